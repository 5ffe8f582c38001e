pub mod config;
pub mod error;
pub mod types;
pub mod protocol;
pub mod codec;
pub mod session;
pub mod database;
pub mod upstream;
pub mod heartbeat;
pub mod classify;
pub mod connection;
pub mod server;
pub mod metrics;
pub mod logging;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Error, Result};
pub use config::DaemonConfig;
pub use types::{ConnectionId, VerifyResult};
pub use database::{DatabasePool, LedgerStats, LedgerStore};
pub use server::StratumServer;
pub use upstream::{NodeConnector, UpstreamConnector, UpstreamHandle, UpstreamSender};
