use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A share as reported by the protocol layer after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareData {
    /// `address` or `address.rig`.
    pub worker: String,
    pub difficulty: f64,
    /// Port the share arrived on; decides solo versus shared crediting.
    pub port: u16,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    /// Coinbase value claimed by the block, in base units.
    #[serde(default)]
    pub block_reward: Option<u64>,
}

impl ShareData {
    /// Payout address of the worker, the part before the first `.`.
    pub fn miner_address(&self) -> &str {
        self.worker.split('.').next().unwrap_or(&self.worker)
    }
}

/// The protocol layer's verdict on one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareVerdict {
    pub share_valid: bool,
    pub block_valid: bool,
    pub share: ShareData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted,
    Rejected,
    BlockFound { height: u64 },
    BlockRejected,
}
