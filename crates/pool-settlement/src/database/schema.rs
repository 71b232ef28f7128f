use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an accounting round: the open `current` round or a closed
/// snapshot keyed by the height of the block that closed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundId {
    Current,
    Height(u64),
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundId::Current => write!(f, "current"),
            RoundId::Height(height) => write!(f, "round-{}", height),
        }
    }
}

/// Every key owned by one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundKeys {
    pub values: String,
    pub values_solo: String,
    pub counts: String,
    pub records: String,
    pub times_last: String,
    pub times_values: String,
}

impl RoundKeys {
    pub fn all(&self) -> [&str; 6] {
        [
            &self.values,
            &self.values_solo,
            &self.counts,
            &self.records,
            &self.times_last,
            &self.times_values,
        ]
    }
}

/// Coin-scoped key schema. Every key a coin touches is built here.
#[derive(Debug, Clone)]
pub struct Keys {
    coin: String,
}

impl Keys {
    pub fn new(coin: impl Into<String>) -> Self {
        Self { coin: coin.into() }
    }

    pub fn coin(&self) -> &str {
        &self.coin
    }

    pub fn round(&self, round: RoundId) -> RoundKeys {
        RoundKeys {
            values: format!("{}:shares:{}:values", self.coin, round),
            values_solo: format!("{}:shares:{}:values:solo", self.coin, round),
            counts: format!("{}:shares:{}:counts", self.coin, round),
            records: format!("{}:shares:{}:records", self.coin, round),
            times_last: format!("{}:times:{}:last", self.coin, round),
            times_values: format!("{}:times:{}:values", self.coin, round),
        }
    }

    pub fn current(&self) -> RoundKeys {
        self.round(RoundId::Current)
    }

    fn blocks(&self, set: &str) -> String {
        format!("{}:main:blocks:{}", self.coin, set)
    }

    pub fn pending(&self) -> String {
        self.blocks("pending")
    }

    pub fn confirmed(&self) -> String {
        self.blocks("confirmed")
    }

    pub fn kicked(&self) -> String {
        self.blocks("kicked")
    }

    pub fn orphaned(&self) -> String {
        self.blocks("orphaned")
    }

    pub fn duplicate(&self) -> String {
        self.blocks("duplicate")
    }

    pub fn block_counts(&self) -> String {
        self.blocks("counts")
    }

    pub fn balances(&self) -> String {
        format!("{}:main:balances", self.coin)
    }

    pub fn immature(&self) -> String {
        format!("{}:main:immature", self.coin)
    }

    pub fn payouts(&self) -> String {
        format!("{}:main:payouts", self.coin)
    }

    pub fn stats(&self) -> String {
        format!("{}:main:stats", self.coin)
    }
}

/// A block found by the pool, waiting in the pending set until the daemon
/// settles its fate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockCandidate {
    pub height: u64,
    pub block_hash: String,
    pub tx_hash: String,
    /// Reward claimed by the share, in base units.
    pub reward: u64,
    pub worker: String,
    pub solo: bool,
    /// Unix millis at which the round rotated.
    pub time: i64,
}

impl BlockCandidate {
    /// Pending-set member string. Field order is fixed so the same candidate
    /// always serializes to the same member.
    pub fn to_member(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_member(member: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(member)
    }
}

/// Per-worker settlement state for one cycle. Amounts are in base units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerLedger {
    /// Confirmed but unpaid value carried over from earlier cycles.
    pub balance: i64,
    /// Value behind blocks that have not matured yet.
    pub immature: i64,
    /// Value earned by rounds settled in this cycle.
    pub reward: i64,
    /// Amount disbursed in this cycle.
    pub sent: i64,
    pub total_shares: f64,
    /// Net adjustment to `balance` committed by the finalizer.
    pub balance_change: i64,
}
