use thiserror::Error;

use crate::daemon::DaemonError;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Database error: {0}")]
    Database(#[from] redis::RedisError),

    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Overlapping pool configuration: {0}")]
    ConfigOverlap(String),

    #[error("Invalid share: {0}")]
    InvalidShare(String),

    #[error("Unknown coin: {0}")]
    UnknownCoin(String),

    #[error("Pool address {0} is not owned by the daemon wallet")]
    AddressNotOwned(String),

    #[error("Not enough funds to cover transaction fees, withheld up to {withheld_percent}%")]
    UnderfundedFee { withheld_percent: u32 },

    #[error("Payment rejected by daemon: {0}")]
    Payment(String),

    #[error("Ledger commit failed for {coin}: {reason}")]
    LedgerCommitFailure { coin: String, reason: String },

    #[error("Settlement halted for {0}")]
    Halted(String),

    #[error("Worker channel closed")]
    ChannelClosed,

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;
