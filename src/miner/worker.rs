//! Hashing threads
//!
//! Each worker is a plain OS thread. It watches the template version, copies
//! the template when it changes and searches the nonce sequence
//! `starter_nonce + thread_index + k * thread_count`, so workers of one
//! session never test the same nonce for the same template.

use super::template::{TemplateSnapshot, TemplateStore};
use crate::crypto::{check_hash, pow_hash};
use crate::{Block, Difficulty, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

/// Nonce tested by worker `thread_index` at step `step`
fn nonce_for(starter_nonce: u32, thread_index: u32, stride: u32, step: u32) -> u32 {
    starter_nonce
        .wrapping_add(thread_index)
        .wrapping_add(step.wrapping_mul(stride))
}

/// Shared state of one start/stop cycle
#[derive(Debug)]
pub struct MiningSession {
    id: Uuid,
    thread_count: usize,
    stop: AtomicBool,
    pause: Mutex<u32>,
    sleep_lock: Mutex<()>,
    wake: Condvar,
    hashes: AtomicU64,
}

impl MiningSession {
    pub fn new(thread_count: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_count,
            stop: AtomicBool::new(false),
            pause: Mutex::new(0),
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
            hashes: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Raise the stop flag and wake sleeping workers
    pub fn stop(&self) {
        let _guard = self.sleep_lock.lock();
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Increment the pause counter, returning the new value
    pub fn pause(&self) -> u32 {
        let mut pause = self.pause.lock();
        *pause += 1;
        *pause
    }

    /// Decrement the pause counter, returning the new value
    ///
    /// An unbalanced resume leaves the counter at 0.
    pub fn resume(&self) -> u32 {
        let mut pause = self.pause.lock();
        if *pause == 0 {
            warn!(session = %self.id, "Resume without matching pause");
            return 0;
        }
        *pause -= 1;
        let remaining = *pause;
        drop(pause);

        if remaining == 0 {
            self.wake();
        }
        remaining
    }

    pub fn pause_count(&self) -> u32 {
        *self.pause.lock()
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count() > 0
    }

    /// Hashes computed since the last call
    pub fn take_hashes(&self) -> u64 {
        self.hashes.swap(0, Ordering::Relaxed)
    }

    fn count_hash(&self) {
        self.hashes.fetch_add(1, Ordering::Relaxed);
    }

    /// Wake sleeping workers, e.g. after a new template was published
    pub fn wake(&self) {
        let _guard = self.sleep_lock.lock();
        self.wake.notify_all();
    }

    /// Sleep up to `timeout`, returning early on stop, resume or wake
    fn sleep(&self, timeout: Duration) {
        let mut guard = self.sleep_lock.lock();
        if !self.is_stopped() {
            self.wake.wait_for(&mut guard, timeout);
        }
    }
}

/// Per-thread copy of the template
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub thread_index: u32,
    pub stride: u32,
    starter_nonce: u32,
    step: u32,
    pub version: u64,
    pub difficulty: Difficulty,
    pub merge_mined: bool,
    pub block: Option<Block>,
}

impl WorkerState {
    pub fn new(thread_index: u32, stride: u32) -> Self {
        Self {
            thread_index,
            stride: stride.max(1),
            starter_nonce: 0,
            step: 0,
            version: 0,
            difficulty: 0,
            merge_mined: false,
            block: None,
        }
    }

    /// Re-snapshot when the store moved past the cached version
    ///
    /// Returns true when a new template was taken.
    pub fn refresh(&mut self, store: &TemplateStore) -> bool {
        if store.version() == self.version {
            return false;
        }
        match store.snapshot() {
            Some(snapshot) => {
                self.apply(snapshot);
                true
            }
            None => false,
        }
    }

    fn apply(&mut self, snapshot: TemplateSnapshot) {
        self.version = snapshot.version;
        self.difficulty = snapshot.difficulty;
        self.merge_mined = snapshot.merge_mined;
        self.starter_nonce = snapshot.starter_nonce;
        self.step = 0;
        self.block = Some(snapshot.block);
    }

    /// Next nonce this worker will test
    pub fn nonce(&self) -> u32 {
        nonce_for(self.starter_nonce, self.thread_index, self.stride, self.step)
    }

    /// Hash the current nonce and advance by the stride
    ///
    /// Returns the solved block when the hash meets the difficulty.
    pub fn try_nonce(&mut self) -> Option<Block> {
        let nonce = self.nonce();
        let block = self.block.as_mut()?;
        block.header.nonce = nonce;
        let hash = pow_hash(block, self.merge_mined);
        let solved = check_hash(&hash, self.difficulty).then(|| block.clone());
        self.step = self.step.wrapping_add(1);
        solved
    }
}

/// Everything a worker thread needs
#[derive(Clone)]
pub struct WorkerContext {
    pub session: Arc<MiningSession>,
    pub templates: Arc<TemplateStore>,
    pub found: mpsc::UnboundedSender<Block>,
    pub pause_sleep: Duration,
    pub idle_sleep: Duration,
    pub span: Span,
}

fn run_worker(context: WorkerContext, mut state: WorkerState) {
    let _entered = context.span.enter();
    let session = &context.session;
    debug!(thread = state.thread_index, "Worker started");

    while !session.is_stopped() {
        if session.is_paused() {
            session.sleep(context.pause_sleep);
            continue;
        }

        state.refresh(&context.templates);
        if state.block.is_none() {
            session.sleep(context.idle_sleep);
            continue;
        }

        session.count_hash();
        if let Some(block) = state.try_nonce() {
            info!(
                thread = state.thread_index,
                nonce = block.header.nonce,
                version = state.version,
                "Found block"
            );
            if context.found.send(block).is_err() {
                debug!("Block submitter is gone");
            }
            // Wait for the template built on top of this block
            state.block = None;
        }
    }

    debug!(thread = state.thread_index, "Worker stopped");
}

/// Spawn `session.thread_count()` workers
///
/// If a spawn fails the session is stopped before the error is returned.
pub fn spawn_workers(context: &WorkerContext) -> Result<Vec<JoinHandle<()>>> {
    let thread_count = context.session.thread_count();
    let stride = u32::try_from(thread_count).unwrap_or(u32::MAX);
    let mut handles = Vec::with_capacity(thread_count);

    for index in 0..stride {
        let worker_context = context.clone();
        let state = WorkerState::new(index, stride);
        let spawned = thread::Builder::new()
            .name(format!("miner-{}", index))
            .spawn(move || run_worker(worker_context, state));

        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                context.session.stop();
                let stragglers = join_with_timeout(handles, Duration::from_secs(1));
                if !stragglers.is_empty() {
                    warn!("{} worker threads did not exit", stragglers.len());
                }
                return Err(e.into());
            }
        }
    }
    Ok(handles)
}

/// Tracing span for the threads of one session
pub fn session_span(session: &MiningSession) -> Span {
    info_span!(
        "mining",
        session = %session.id(),
        threads = session.thread_count()
    )
}

/// Join finished threads, then wait up to `timeout` for the rest
///
/// Threads still running at the deadline are returned.
pub fn join_with_timeout(handles: Vec<JoinHandle<()>>, timeout: Duration) -> Vec<JoinHandle<()>> {
    let deadline = std::time::Instant::now() + timeout;
    let mut pending = handles;

    loop {
        let (finished, running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|handle| handle.is_finished());
        for handle in finished {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
        pending = running;

        if pending.is_empty() || std::time::Instant::now() >= deadline {
            return pending;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
