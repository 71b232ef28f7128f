pub mod batch;
pub mod redis_store;
pub mod schema;

pub use batch::{Batch, Command, Guard};
pub use redis_store::RedisStore;
pub use schema::{BlockCandidate, Keys, RoundId, RoundKeys, WorkerLedger};

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// The shared key-value ledger. Reads are plain lookups; every write goes
/// through [`LedgerStore::apply`] as one atomic batch.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Applies the batch atomically. Returns `false` without touching
    /// anything when one of the batch guards does not hold.
    async fn apply(&self, batch: &Batch) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
}
