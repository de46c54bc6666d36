//! Hybrid Node Miner
//!
//! Node access and mining coordination for a hybrid proof-of-stake /
//! proof-of-work cryptocurrency wallet:
//! - One [`node::Node`] interface over a remote JSON/HTTP daemon or an
//!   in-process embedded node
//! - Change notifications through a single event channel
//! - A multi-threaded stake miner that binds a wallet stake transaction
//!   into every block template

pub mod config;
pub mod crypto;
pub mod currency;
pub mod error;
pub mod extra;
pub mod logging;
pub mod miner;
pub mod node;
pub mod types;
pub mod utils;
pub mod wallet;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "hybrid-node-miner";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
