use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::database::BlockCandidate;
use crate::error::PoolError;

/// Fallback precision when neither config nor `getbalance` settles it.
pub const DEFAULT_PRECISION: u32 = 8;

/// Largest precision whose magnitude fits an `i64`.
pub const MAX_PRECISION: u32 = 18;

/// Conversion between coin amounts reported by the daemon and the integer
/// base units the ledger computes in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoinUnits {
    pub precision: u32,
    pub magnitude: i64,
}

impl CoinUnits {
    pub fn new(precision: u32) -> crate::error::Result<Self> {
        let magnitude = 10i64.checked_pow(precision).ok_or_else(|| {
            PoolError::Configuration(format!(
                "precision {} exceeds {} decimal places",
                precision, MAX_PRECISION
            ))
        })?;
        Ok(Self {
            precision,
            magnitude,
        })
    }

    /// Derives precision from the textual `getbalance` result. JSON drops
    /// trailing zeros, so a short fraction cannot be told apart from a coin
    /// with few decimals and falls back to [`DEFAULT_PRECISION`]. Float noise
    /// past [`MAX_PRECISION`] digits is ignored.
    pub fn from_balance_text(text: &str) -> crate::error::Result<Self> {
        let decimals = text
            .split_once('.')
            .map(|(_, fraction)| fraction.trim_end_matches(|c: char| !c.is_ascii_digit()).len() as u32)
            .unwrap_or(0);
        if decimals > MAX_PRECISION {
            warn!(
                "Balance {} has {} decimal places, using {}",
                text, decimals, MAX_PRECISION
            );
        }
        Self::new(decimals.clamp(DEFAULT_PRECISION, MAX_PRECISION))
    }

    pub fn to_base(&self, coins: f64) -> i64 {
        (coins * self.magnitude as f64).round() as i64
    }

    pub fn to_coins(&self, base: i64) -> f64 {
        base as f64 / self.magnitude as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Mature coinbase, ready to pay.
    Generate,
    Immature,
    /// Chain reorganised the block away.
    Orphan,
    /// Daemon does not know the transaction at all.
    Kicked,
}

impl Category {
    pub fn from_daemon(category: &str) -> Option<Self> {
        match category {
            "generate" => Some(Category::Generate),
            "immature" => Some(Category::Immature),
            "orphan" => Some(Category::Orphan),
            _ => None,
        }
    }

    /// Whether the round may still pay out.
    pub fn is_active(&self) -> bool {
        matches!(self, Category::Generate | Category::Immature)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Generate => "generate",
            Category::Immature => "immature",
            Category::Orphan => "orphan",
            Category::Kicked => "kicked",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending-set member together with its decoded candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBlock {
    pub candidate: BlockCandidate,
    pub member: String,
}

impl PendingBlock {
    pub fn new(candidate: BlockCandidate) -> Result<Self, serde_json::Error> {
        let member = candidate.to_member()?;
        Ok(Self { candidate, member })
    }

    pub fn height(&self) -> u64 {
        self.candidate.height
    }
}

/// Contributions recorded in one round snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundShares {
    pub shared: HashMap<String, f64>,
    pub solo: HashMap<String, f64>,
}

impl RoundShares {
    pub fn from_store(
        height: u64,
        shared: HashMap<String, String>,
        solo: HashMap<String, String>,
    ) -> Self {
        let parse = |map: HashMap<String, String>| {
            map.into_iter()
                .filter_map(|(worker, value)| match value.parse::<f64>() {
                    Ok(value) => Some((worker, value)),
                    Err(_) => {
                        warn!(
                            "Ignoring unparseable share value {:?} for {} in round {}",
                            value, worker, height
                        );
                        None
                    }
                })
                .collect()
        };
        Self {
            shared: parse(shared),
            solo: parse(solo),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.solo.is_empty()
    }
}

/// A classified round moving through the settlement pipeline.
#[derive(Debug, Clone)]
pub struct Round {
    pub block: PendingBlock,
    pub category: Category,
    /// Daemon-reported coinbase amount in base units.
    pub reward: i64,
    /// Snapshot keys may be deleted once the outcome is recorded.
    pub can_delete_shares: bool,
    pub shares: RoundShares,
}

impl Round {
    pub fn height(&self) -> u64 {
        self.block.candidate.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Reconcile and classify only; nothing is disbursed.
    Check,
    Payment,
}

impl fmt::Display for CycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleMode::Check => write!(f, "check"),
            CycleMode::Payment => write!(f, "payment"),
        }
    }
}

/// Summary of one settlement cycle, used for logging and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub pending: usize,
    pub held_duplicates: usize,
    pub moved_duplicates: usize,
    pub generate: usize,
    pub immature: usize,
    pub orphaned: usize,
    pub kicked: usize,
    pub skipped_rounds: usize,
    pub recipients: usize,
    pub total_sent: i64,
    pub withhold_percent: u32,
    pub committed: bool,
    /// Another cycle held the lock; nothing ran.
    pub overlapped: bool,
}
