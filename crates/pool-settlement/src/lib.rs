pub mod api;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod database;
pub mod error;
pub mod metrics;
pub mod settlement;
pub mod shares;
pub mod supervisor;

#[cfg(test)]
mod test_utils;

pub use coordinator::{CoinPool, PoolCoordinator};
pub use error::{PoolError, Result};
pub use settlement::SettlementProcessor;
pub use supervisor::Supervisor;
