//! RocksDB chain storage
//!
//! Column families:
//! - `blocks`: [`StoredBlock`] as JSON, keyed by big-endian block index
//! - `metadata`: storage schema version
//!
//! RocksDB holds an OS lock on the directory while open; the lock goes away
//! with the process, so a crashed node never leaves the directory unusable.

use super::{ChainStorage, StoredBlock};
use crate::error::StorageFailure;
use crate::{Error, Result};
use parking_lot::RwLock;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Schema version written by this build
pub const STORAGE_SCHEMA_VERSION: u32 = 2;

pub const CF_BLOCKS: &str = "blocks";
pub const CF_METADATA: &str = "metadata";

const SCHEMA_KEY: &[u8] = b"schema_version";

fn db_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    opts.set_keep_log_file_num(4);
    opts
}

/// Map an open failure to the storage failure kinds the node reports
fn open_error(e: rocksdb::Error) -> Error {
    let message = e.to_string();
    if message.contains("lock hold by current process") || message.contains("While lock file") {
        Error::storage(StorageFailure::InUse)
    } else if e.kind() == rocksdb::ErrorKind::IOError {
        debug!("RocksDB open I/O failure: {}", message);
        Error::storage(StorageFailure::Io)
    } else {
        Error::Database(e)
    }
}

fn block_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Chain storage in a RocksDB directory
pub struct RocksStorage {
    dir: PathBuf,
    db: RwLock<Option<DB>>,
}

impl RocksStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            db: RwLock::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    fn with_db<T>(&self, f: impl FnOnce(&DB) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        let db = guard
            .as_ref()
            .ok_or_else(|| Error::invalid_state("storage is not open"))?;
        f(db)
    }

    fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily> {
        db.cf_handle(name)
            .ok_or_else(|| Error::invalid_state(format!("column family {} not found", name)))
    }

    fn schema_version(&self) -> Result<Option<u32>> {
        self.with_db(|db| {
            let raw = db.get_cf(Self::cf(db, CF_METADATA)?, SCHEMA_KEY)?;
            Ok(raw
                .and_then(|bytes| <[u8; 4]>::try_from(bytes.as_slice()).ok())
                .map(u32::from_le_bytes))
        })
    }

    fn write_schema_version(&self, version: u32) -> Result<()> {
        self.with_db(|db| {
            db.put_cf(Self::cf(db, CF_METADATA)?, SCHEMA_KEY, version.to_le_bytes())?;
            Ok(())
        })
    }
}

impl ChainStorage for RocksStorage {
    fn init(&self) -> Result<()> {
        let mut slot = self.db.write();
        if slot.is_some() {
            return Ok(());
        }

        let descriptors = [CF_BLOCKS, CF_METADATA]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db =
            DB::open_cf_descriptors(&db_options(), &self.dir, descriptors).map_err(open_error)?;

        let fresh = {
            let metadata = Self::cf(&db, CF_METADATA)?;
            let blocks = Self::cf(&db, CF_BLOCKS)?;
            db.get_cf(metadata, SCHEMA_KEY)?.is_none()
                && db.iterator_cf(blocks, IteratorMode::Start).next().is_none()
        };
        *slot = Some(db);
        drop(slot);

        if fresh {
            self.write_schema_version(STORAGE_SCHEMA_VERSION)?;
        }
        debug!("Opened storage at {}", self.dir.display());
        Ok(())
    }

    fn schema_matches(&self) -> Result<bool> {
        Ok(self.schema_version()? == Some(STORAGE_SCHEMA_VERSION))
    }

    fn shutdown(&self) {
        if self.db.write().take().is_some() {
            debug!("Closed storage at {}", self.dir.display());
        }
    }

    fn destroy(&self) -> Result<()> {
        if self.is_open() {
            return Err(Error::invalid_state("cannot destroy open storage"));
        }
        if !self.dir.exists() {
            return Ok(());
        }
        DB::destroy(&Options::default(), &self.dir)?;
        info!("Destroyed storage at {}", self.dir.display());
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<StoredBlock>> {
        self.with_db(|db| {
            let mut blocks = Vec::new();
            for item in db.iterator_cf(Self::cf(db, CF_BLOCKS)?, IteratorMode::Start) {
                let (_, value) = item?;
                blocks.push(serde_json::from_slice(&value)?);
            }
            Ok(blocks)
        })
    }

    fn append_block(&self, block: &StoredBlock) -> Result<()> {
        let value = serde_json::to_vec(block)?;
        self.with_db(|db| {
            db.put_cf(Self::cf(db, CF_BLOCKS)?, block_key(block.index), value)?;
            Ok(())
        })
    }

    fn truncate(&self, count: usize) -> Result<()> {
        let from = block_key(count as u64);
        self.with_db(|db| {
            let cf = Self::cf(db, CF_BLOCKS)?;
            let mut batch = WriteBatch::default();
            for item in db.iterator_cf(cf, IteratorMode::From(&from, Direction::Forward)) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
            db.write(batch)?;
            Ok(())
        })
    }
}

impl Drop for RocksStorage {
    fn drop(&mut self) {
        self.shutdown();
    }
}
