use std::collections::BTreeSet;

use serde_json::json;
use tracing::{debug, error, warn};

use super::types::{Category, CoinUnits, PendingBlock, Round, RoundShares};
use crate::daemon::{
    CoinDaemon, DaemonError, RpcCall, RpcReply, TransactionDetail, WalletTransaction,
    RPC_INVALID_ADDRESS_OR_KEY,
};

#[derive(Debug, Default)]
pub struct Classification {
    pub rounds: Vec<Round>,
    /// Candidates whose status could not be settled this cycle.
    pub skipped: Vec<PendingBlock>,
    /// Wallet account owning the pool address, used as the `sendmany` source.
    pub account: String,
}

/// Asks the daemon for the fate of every candidate in one batch and tags
/// each as generate, immature, orphan or kicked.
///
/// `unresolved_heights` are heights with a candidate outside this batch
/// whose status is unknown; their snapshots are never released here.
pub async fn classify(
    daemon: &dyn CoinDaemon,
    pool_address: &str,
    units: &CoinUnits,
    blocks: Vec<PendingBlock>,
    max_generate: usize,
    unresolved_heights: &BTreeSet<u64>,
) -> Result<Classification, DaemonError> {
    let mut calls: Vec<RpcCall> = blocks
        .iter()
        .map(|block| RpcCall::new("gettransaction", vec![json!(block.candidate.tx_hash)]))
        .collect();
    calls.push(RpcCall::new("getaccount", vec![json!(pool_address)]));

    let mut replies = daemon.batch(calls).await?;
    let account_reply = replies.pop().unwrap_or_default();
    let account = match account_reply.result {
        Some(serde_json::Value::String(account)) if account_reply.error.is_none() => account,
        _ => {
            debug!("getaccount gave no account for {}, using default", pool_address);
            String::new()
        }
    };

    let mut classification = Classification {
        account,
        ..Default::default()
    };

    for (block, reply) in blocks.into_iter().zip(replies) {
        match classify_one(pool_address, units, &block, &reply) {
            Some((category, reward)) => classification.rounds.push(Round {
                block,
                category,
                reward,
                can_delete_shares: false,
                shares: RoundShares::default(),
            }),
            None => classification.skipped.push(block),
        }
    }

    cap_generate(&mut classification.rounds, max_generate);

    let mut blocked: BTreeSet<u64> = unresolved_heights.clone();
    blocked.extend(classification.skipped.iter().map(|b| b.height()));
    mark_deletable(&mut classification.rounds, &blocked);

    Ok(classification)
}

fn classify_one(
    pool_address: &str,
    units: &CoinUnits,
    block: &PendingBlock,
    reply: &RpcReply,
) -> Option<(Category, i64)> {
    let candidate = &block.candidate;

    if reply.error_code() == Some(RPC_INVALID_ADDRESS_OR_KEY) {
        warn!(
            "Transaction {} for block {} is not in the wallet, kicking round",
            candidate.tx_hash, candidate.height
        );
        return Some((Category::Kicked, 0));
    }
    if let Some(err) = &reply.error {
        error!(
            "gettransaction failed for block {} ({}): {} {}",
            candidate.height, candidate.tx_hash, err.code, err.message
        );
        return None;
    }

    let transaction = match reply.decode::<WalletTransaction>() {
        Some(Ok(tx)) => tx,
        Some(Err(e)) => {
            error!(
                "Unreadable transaction {} for block {}: {}",
                candidate.tx_hash, candidate.height, e
            );
            return None;
        }
        None => {
            warn!(
                "Daemon returned no transaction {} for block {}, kicking round",
                candidate.tx_hash, candidate.height
            );
            return Some((Category::Kicked, 0));
        }
    };

    if transaction.details.is_empty() {
        warn!(
            "Transaction {} for block {} has no details, kicking round",
            candidate.tx_hash, candidate.height
        );
        return Some((Category::Kicked, 0));
    }

    let Some(detail) = pool_output(&transaction.details, pool_address) else {
        error!(
            "Transaction {} for block {} pays nothing to the pool address",
            candidate.tx_hash, candidate.height
        );
        return None;
    };

    let Some(category) = Category::from_daemon(&detail.category) else {
        error!(
            "Unexpected category {:?} for block {}",
            detail.category, candidate.height
        );
        return None;
    };

    let reward = if category.is_active() {
        units.to_base(detail.amount)
    } else {
        0
    };
    Some((category, reward))
}

fn pool_output<'a>(details: &'a [TransactionDetail], pool_address: &str) -> Option<&'a TransactionDetail> {
    details
        .iter()
        .find(|d| d.address.as_deref() == Some(pool_address))
        .or_else(|| match details {
            [only] => Some(only),
            _ => None,
        })
}

/// Demotes generate rounds past the first `max_generate` (lowest heights
/// first) to immature.
pub fn cap_generate(rounds: &mut [Round], max_generate: usize) {
    let mut generate = 0;
    for round in rounds.iter_mut() {
        if round.category != Category::Generate {
            continue;
        }
        generate += 1;
        if generate > max_generate {
            debug!("Deferring block {} to a later payment", round.height());
            round.category = Category::Immature;
        }
    }
}

/// A settled round may drop its snapshot only when no other candidate at the
/// same height can still pay out.
pub fn mark_deletable(rounds: &mut [Round], blocked_heights: &BTreeSet<u64>) {
    let verdicts: Vec<bool> = rounds
        .iter()
        .map(|round| {
            !blocked_heights.contains(&round.height())
                && !rounds.iter().any(|other| {
                    other.block.member != round.block.member
                        && other.height() == round.height()
                        && other.category.is_active()
                })
        })
        .collect();

    for (round, deletable) in rounds.iter_mut().zip(verdicts) {
        round.can_delete_shares = deletable && round.category != Category::Immature;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::BlockCandidate;
    use crate::test_utils::MockDaemon;
    use serde_json::Value;

    const POOL: &str = "Lpooladdress";

    fn block(height: u64, tx: &str) -> PendingBlock {
        PendingBlock::new(BlockCandidate {
            height,
            block_hash: format!("hash-{}", tx),
            tx_hash: tx.to_string(),
            reward: 1_250_000_000,
            worker: "Lminer".to_string(),
            solo: false,
            time: height as i64,
        })
        .unwrap()
    }

    fn wallet(reply: impl Fn(&str) -> RpcReply + Send + Sync + 'static) -> MockDaemon {
        MockDaemon::new(move |method, params| match method {
            "gettransaction" => Ok(reply(params[0].as_str().unwrap_or_default())),
            "getaccount" => Ok(RpcReply::ok(Value::String("pool".into()))),
            other => panic!("unexpected call {}", other),
        })
    }

    fn tx(category: &str, amount: f64) -> RpcReply {
        RpcReply::ok(json!({
            "details": [{"address": POOL, "category": category, "amount": amount}]
        }))
    }

    #[tokio::test]
    async fn test_categories() {
        let daemon = wallet(|tx_hash| match tx_hash {
            "gen" => tx("generate", 12.5),
            "imm" => tx("immature", 12.5),
            "orph" => tx("orphan", 12.5),
            "gone" => RpcReply::err(RPC_INVALID_ADDRESS_OR_KEY, "Invalid or non-wallet transaction id"),
            "empty" => RpcReply::ok(json!({"details": []})),
            _ => RpcReply::err(-1, "boom"),
        });

        let blocks = vec![
            block(1, "gen"),
            block(2, "imm"),
            block(3, "orph"),
            block(4, "gone"),
            block(5, "empty"),
            block(6, "broken"),
        ];

        let result = classify(&daemon, POOL, &CoinUnits::new(8).unwrap(), blocks, 3, &BTreeSet::new())
            .await
            .unwrap();

        let categories: Vec<_> = result.rounds.iter().map(|r| (r.height(), r.category)).collect();
        assert_eq!(
            categories,
            vec![
                (1, Category::Generate),
                (2, Category::Immature),
                (3, Category::Orphan),
                (4, Category::Kicked),
                (5, Category::Kicked),
            ]
        );
        assert_eq!(result.rounds[0].reward, 1_250_000_000);
        assert_eq!(result.rounds[2].reward, 0);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.account, "pool");
    }

    #[tokio::test]
    async fn test_sole_output_and_foreign_outputs() {
        let daemon = wallet(|tx_hash| match tx_hash {
            "sole" => RpcReply::ok(json!({
                "details": [{"address": "Lother", "category": "generate", "amount": 1.0}]
            })),
            _ => RpcReply::ok(json!({
                "details": [
                    {"address": "La", "category": "generate", "amount": 1.0},
                    {"address": "Lb", "category": "generate", "amount": 2.0}
                ]
            })),
        });

        let result = classify(
            &daemon,
            POOL,
            &CoinUnits::new(8).unwrap(),
            vec![block(1, "sole"), block(2, "split")],
            3,
            &BTreeSet::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.rounds.len(), 1);
        assert_eq!(result.rounds[0].reward, 100_000_000);
        assert_eq!(result.skipped[0].height(), 2);
    }

    #[tokio::test]
    async fn test_generate_cap_demotes_excess() {
        let daemon = wallet(|_| tx("generate", 1.0));
        let blocks = (1..=5).map(|h| block(h, &format!("tx{}", h))).collect();

        let result = classify(&daemon, POOL, &CoinUnits::new(8).unwrap(), blocks, 3, &BTreeSet::new())
            .await
            .unwrap();

        let generate = result
            .rounds
            .iter()
            .filter(|r| r.category == Category::Generate)
            .count();
        assert_eq!(generate, 3);
        assert_eq!(result.rounds[3].category, Category::Immature);
        assert_eq!(result.rounds[4].category, Category::Immature);
    }

    #[tokio::test]
    async fn test_contested_height_keeps_shares() {
        let daemon = wallet(|tx_hash| match tx_hash {
            "live" => tx("immature", 1.0),
            _ => tx("orphan", 1.0),
        });

        let result = classify(
            &daemon,
            POOL,
            &CoinUnits::new(8).unwrap(),
            vec![block(7, "live"), block(7, "dead"), block(8, "lonely"), block(9, "held")],
            3,
            &BTreeSet::from([9]),
        )
        .await
        .unwrap();

        let deletable: Vec<_> = result
            .rounds
            .iter()
            .map(|r| (r.block.candidate.tx_hash.as_str(), r.can_delete_shares))
            .collect();
        assert_eq!(
            deletable,
            vec![("live", false), ("dead", false), ("lonely", true), ("held", false)]
        );
    }

    #[tokio::test]
    async fn test_unreachable_daemon_aborts() {
        let daemon = MockDaemon::unreachable();
        let result = classify(
            &daemon,
            POOL,
            &CoinUnits::new(8).unwrap(),
            vec![block(1, "tx")],
            3,
            &BTreeSet::new(),
        )
        .await;
        assert!(matches!(result, Err(DaemonError::Unreachable(_))));
    }
}
