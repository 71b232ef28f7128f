use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{IngestOutcome, ShareVerdict};
use crate::config::PoolConfig;
use crate::database::{Batch, BlockCandidate, Command, Keys, LedgerStore, RoundId, RoundKeys};
use crate::error::{PoolError, Result};
use crate::metrics;

/// Gaps between two shares of one worker at or above this are idle time
/// and do not count as connected time.
pub const LIVENESS_THRESHOLD_MS: i64 = 900_000;

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Connected-time bookkeeping for one valid share.
pub fn time_commands(
    keys: &RoundKeys,
    address: &str,
    last_share_ms: Option<i64>,
    now_ms: i64,
) -> Vec<Command> {
    let mut commands = Vec::with_capacity(2);

    if let Some(last) = last_share_ms {
        let gap_ms = (now_ms - last).max(0);
        if gap_ms < LIVENESS_THRESHOLD_MS {
            commands.push(Command::HIncrByFloat {
                key: keys.times_values.clone(),
                field: address.to_string(),
                delta: round4(gap_ms as f64 / 1000.0),
            });
        }
    }

    commands.push(Command::HSet {
        key: keys.times_last.clone(),
        field: address.to_string(),
        value: now_ms.to_string(),
    });
    commands
}

/// Builds the atomic batch for one verdict. `record_id` keeps the audit
/// record of every share distinct, even for repeats within a millisecond.
pub fn share_batch(
    keys: &Keys,
    verdict: &ShareVerdict,
    solo: bool,
    last_share_ms: Option<i64>,
    now_ms: i64,
    record_id: &str,
) -> Result<Batch> {
    let share = &verdict.share;
    let address = share.miner_address();
    let current = keys.current();
    let mut batch = Batch::new();

    if verdict.share_valid {
        batch.push(Command::HIncrByFloat {
            key: if solo {
                current.values_solo.clone()
            } else {
                current.values.clone()
            },
            field: address.to_string(),
            delta: share.difficulty,
        });
        batch.push(Command::HIncrBy {
            key: current.counts.clone(),
            field: "validShares".to_string(),
            delta: 1,
        });
        batch.extend(time_commands(&current, address, last_share_ms, now_ms));
    } else {
        batch.push(Command::HIncrBy {
            key: current.counts.clone(),
            field: "invalidShares".to_string(),
            delta: 1,
        });
    }

    let signed = if verdict.share_valid {
        share.difficulty
    } else {
        -share.difficulty
    };
    batch.push(Command::ZAdd {
        key: current.records.clone(),
        score: now_ms / 1000,
        member: format!("{}:{}:{}:{}", signed, share.worker, now_ms, record_id),
    });

    if verdict.block_valid {
        let (height, block_hash, tx_hash) = match (&share.height, &share.block_hash, &share.tx_hash) {
            (Some(height), Some(block_hash), Some(tx_hash)) => (*height, block_hash, tx_hash),
            _ => {
                return Err(PoolError::InvalidShare(format!(
                    "block share from {} lacks height, block hash or tx hash",
                    share.worker
                )))
            }
        };

        let round = keys.round(RoundId::Height(height));
        for (from, to) in current.all().iter().zip(round.all().iter()) {
            batch.push(Command::Rename {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let candidate = BlockCandidate {
            height,
            block_hash: block_hash.clone(),
            tx_hash: tx_hash.clone(),
            reward: share.block_reward.unwrap_or(0),
            worker: address.to_string(),
            solo,
            time: now_ms,
        };
        batch.push(Command::SAdd {
            key: keys.pending(),
            member: candidate.to_member()?,
        });
        batch.push(Command::HIncrBy {
            key: keys.block_counts(),
            field: "validBlocks".to_string(),
            delta: 1,
        });
    } else if share.block_hash.is_some() {
        batch.push(Command::HIncrBy {
            key: keys.block_counts(),
            field: "invalidBlocks".to_string(),
            delta: 1,
        });
    }

    Ok(batch)
}

/// Turns share verdicts into ledger mutations for one coin.
pub struct ShareIngest {
    store: Arc<dyn LedgerStore>,
    keys: Keys,
    pool: Arc<PoolConfig>,
}

impl ShareIngest {
    pub fn new(store: Arc<dyn LedgerStore>, pool: Arc<PoolConfig>) -> Self {
        Self {
            store,
            keys: Keys::new(pool.coin_name()),
            pool,
        }
    }

    pub async fn ingest(&self, verdict: &ShareVerdict) -> Result<IngestOutcome> {
        self.ingest_at(verdict, Utc::now().timestamp_millis()).await
    }

    pub async fn ingest_at(&self, verdict: &ShareVerdict, now_ms: i64) -> Result<IngestOutcome> {
        let coin = self.keys.coin();
        let share = &verdict.share;
        let solo = self.pool.is_solo_port(share.port);

        let last_share_ms = if verdict.share_valid {
            self.store
                .hget(&self.keys.current().times_last, share.miner_address())
                .await?
                .and_then(|v| v.parse::<i64>().ok())
        } else {
            None
        };

        let record_id = Uuid::new_v4().simple().to_string();
        let batch = share_batch(&self.keys, verdict, solo, last_share_ms, now_ms, &record_id)?;
        self.store.apply(&batch).await?;

        let outcome = if verdict.block_valid {
            let height = share.height.unwrap_or_default();
            info!(
                "Block {} found by {} on {} ({}), round rotated",
                height,
                share.worker,
                coin,
                if solo { "solo" } else { "shared" }
            );
            metrics::BLOCKS_FOUND.with_label_values(&[coin]).inc();
            IngestOutcome::BlockFound { height }
        } else if share.block_hash.is_some() {
            warn!(
                "Block candidate {:?} from {} on {} was rejected by the daemon",
                share.block_hash, share.worker, coin
            );
            IngestOutcome::BlockRejected
        } else if verdict.share_valid {
            IngestOutcome::Accepted
        } else {
            IngestOutcome::Rejected
        };

        if verdict.share_valid {
            metrics::SHARES_ACCEPTED.with_label_values(&[coin]).inc();
        } else {
            metrics::SHARES_REJECTED.with_label_values(&[coin]).inc();
        }
        debug!("Ingested share from {} on {}: {:?}", share.worker, coin, outcome);

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shares::types::ShareData;
    use crate::test_utils::MemoryStore;

    const T0: i64 = 1_700_000_000_000;

    fn verdict(share_valid: bool, block_valid: bool) -> ShareVerdict {
        ShareVerdict {
            share_valid,
            block_valid,
            share: ShareData {
                worker: "Lminer.rig1".to_string(),
                difficulty: 16.0,
                port: 3008,
                ip: None,
                height: None,
                block_hash: None,
                tx_hash: None,
                block_reward: None,
            },
        }
    }

    fn block_verdict(height: u64) -> ShareVerdict {
        let mut verdict = verdict(true, true);
        verdict.share.height = Some(height);
        verdict.share.block_hash = Some("00000abc".to_string());
        verdict.share.tx_hash = Some("coinbase-tx".to_string());
        verdict.share.block_reward = Some(10006839);
        verdict
    }

    fn ingest(store: Arc<MemoryStore>) -> ShareIngest {
        let pool = PoolConfig::from_json(
            "litecoin",
            &crate::config::sample_pool_json("litecoin", 3008),
        )
        .unwrap();
        ShareIngest::new(store, Arc::new(pool))
    }

    #[test]
    fn test_time_commands_within_threshold() {
        let keys = Keys::new("litecoin").current();
        let commands = time_commands(&keys, "Lminer", Some(T0), T0 + 300_000);

        assert_eq!(
            commands,
            vec![
                Command::HIncrByFloat {
                    key: keys.times_values.clone(),
                    field: "Lminer".into(),
                    delta: 300.0,
                },
                Command::HSet {
                    key: keys.times_last.clone(),
                    field: "Lminer".into(),
                    value: (T0 + 300_000).to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_time_commands_rounds_to_four_places() {
        let keys = Keys::new("litecoin").current();
        let commands = time_commands(&keys, "Lminer", Some(T0), T0 + 1_234);
        assert!(matches!(
            &commands[0],
            Command::HIncrByFloat { delta, .. } if (*delta - 1.234).abs() < 1e-9
        ));
    }

    #[test]
    fn test_idle_gap_only_advances_last_seen() {
        let keys = Keys::new("litecoin").current();
        let commands = time_commands(&keys, "Lminer", Some(T0), T0 + LIVENESS_THRESHOLD_MS);

        assert_eq!(commands.len(), 1);
        assert!(matches!(&commands[0], Command::HSet { key, .. } if *key == keys.times_last));
    }

    #[test]
    fn test_valid_and_invalid_records_carry_sign() {
        let keys = Keys::new("litecoin");

        let valid = share_batch(&keys, &verdict(true, false), false, None, T0, "r1").unwrap();
        let invalid = share_batch(&keys, &verdict(false, false), false, None, T0, "r2").unwrap();

        let record = |batch: &Batch| {
            batch
                .commands
                .iter()
                .find_map(|c| match c {
                    Command::ZAdd { member, .. } => Some(member.clone()),
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(record(&valid), format!("16:Lminer.rig1:{}:r1", T0));
        assert!(record(&invalid).starts_with("-16:"));

        let counters = |batch: &Batch| -> Vec<String> {
            batch
                .commands
                .iter()
                .filter_map(|c| match c {
                    Command::HIncrBy { field, .. } => Some(field.clone()),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(counters(&valid), vec!["validShares"]);
        assert_eq!(counters(&invalid), vec!["invalidShares"]);
    }

    #[test]
    fn test_block_share_without_height_is_refused() {
        let keys = Keys::new("litecoin");
        let mut verdict = block_verdict(5);
        verdict.share.height = None;
        assert!(matches!(
            share_batch(&keys, &verdict, false, None, T0, "r1"),
            Err(PoolError::InvalidShare(_))
        ));
    }

    #[tokio::test]
    async fn test_shares_accumulate_in_current_round() {
        let store = Arc::new(MemoryStore::new());
        let ingest = ingest(store.clone());
        let keys = Keys::new("litecoin").current();

        ingest.ingest_at(&verdict(true, false), T0).await.unwrap();
        ingest
            .ingest_at(&verdict(true, false), T0 + 300_000)
            .await
            .unwrap();
        ingest
            .ingest_at(&verdict(false, false), T0 + 301_000)
            .await
            .unwrap();

        assert_eq!(store.hash_f64(&keys.values, "Lminer"), Some(32.0));
        assert_eq!(store.hash_f64(&keys.times_values, "Lminer"), Some(300.0));
        assert_eq!(store.hash_f64(&keys.counts, "validShares"), Some(2.0));
        assert_eq!(store.hash_f64(&keys.counts, "invalidShares"), Some(1.0));
        assert_eq!(store.sorted_set(&keys.records).len(), 3);
    }

    #[tokio::test]
    async fn test_solo_port_credits_solo_values() {
        let store = Arc::new(MemoryStore::new());
        let ingest = ingest(store.clone());
        let keys = Keys::new("litecoin").current();

        let mut solo = verdict(true, false);
        solo.share.port = 3009;
        ingest.ingest_at(&solo, T0).await.unwrap();

        assert_eq!(store.hash_f64(&keys.values_solo, "Lminer"), Some(16.0));
        assert!(store.hash(&keys.values).is_empty());
    }

    #[tokio::test]
    async fn test_block_rotates_round() {
        let store = Arc::new(MemoryStore::new());
        let ingest = ingest(store.clone());
        let keys = Keys::new("litecoin");

        ingest.ingest_at(&verdict(true, false), T0).await.unwrap();
        let outcome = ingest
            .ingest_at(&block_verdict(1972211), T0 + 10_000)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::BlockFound { height: 1972211 });

        let current = keys.current();
        let round = keys.round(RoundId::Height(1972211));
        for key in current.all() {
            assert!(!store.exists(key), "{} should have been renamed", key);
        }
        assert_eq!(store.hash_f64(&round.values, "Lminer"), Some(32.0));
        assert_eq!(store.hash_f64(&round.times_values, "Lminer"), Some(10.0));
        assert_eq!(store.hash_f64(&round.counts, "validShares"), Some(2.0));
        assert!(store.exists(&round.times_last));
        assert!(store.exists(&round.records));

        let pending = store.set(&keys.pending());
        assert_eq!(pending.len(), 1);
        let candidate = BlockCandidate::from_member(pending.iter().next().unwrap()).unwrap();
        assert_eq!(candidate.height, 1972211);
        assert_eq!(candidate.worker, "Lminer");
        assert_eq!(candidate.reward, 10006839);
        assert!(!candidate.solo);
        assert_eq!(store.hash_f64(&keys.block_counts(), "validBlocks"), Some(1.0));

        // The next share opens a fresh current round.
        ingest
            .ingest_at(&verdict(true, false), T0 + 20_000)
            .await
            .unwrap();
        assert_eq!(store.hash_f64(&current.values, "Lminer"), Some(16.0));
        assert_eq!(store.hash_f64(&round.values, "Lminer"), Some(32.0));
    }

    #[tokio::test]
    async fn test_rejected_block_counts_without_rotation() {
        let store = Arc::new(MemoryStore::new());
        let ingest = ingest(store.clone());
        let keys = Keys::new("litecoin");

        let mut rejected = block_verdict(1972211);
        rejected.block_valid = false;
        let outcome = ingest.ingest_at(&rejected, T0).await.unwrap();

        assert_eq!(outcome, IngestOutcome::BlockRejected);
        assert!(store.exists(&keys.current().values));
        assert!(store.set(&keys.pending()).is_empty());
        assert_eq!(store.hash_f64(&keys.block_counts(), "invalidBlocks"), Some(1.0));
        assert_eq!(store.hash_f64(&keys.block_counts(), "validBlocks"), None);
    }

    #[tokio::test]
    async fn test_failed_batch_is_surfaced() {
        let store = Arc::new(MemoryStore::new());
        let ingest = ingest(store.clone());
        store.set_failing(true);

        assert!(ingest.ingest_at(&verdict(true, false), T0).await.is_err());
        store.set_failing(false);
        assert!(!store.exists(&Keys::new("litecoin").current().values));
    }

    #[tokio::test]
    async fn test_repeated_share_in_same_millisecond_keeps_both_records() {
        let store = Arc::new(MemoryStore::new());
        let ingest = ingest(store.clone());
        let keys = Keys::new("litecoin").current();

        ingest.ingest_at(&verdict(true, false), T0).await.unwrap();
        ingest.ingest_at(&verdict(true, false), T0).await.unwrap();

        assert_eq!(store.sorted_set(&keys.records).len(), 2);
        assert_eq!(store.hash_f64(&keys.counts, "validShares"), Some(2.0));
    }
}
