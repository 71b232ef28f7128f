use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::json;
use tracing::{debug, info, warn};

use super::types::PendingBlock;
use crate::daemon::{BlockInfo, CoinDaemon, RpcCall};
use crate::database::{Command, Keys, RoundId};

/// Outcome of duplicate reconciliation. The moves are not committed here;
/// they ride along in the finalizer's batch.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Candidates that go on to classification.
    pub blocks: Vec<PendingBlock>,
    /// Duplicates moved out of the pending set.
    pub moved: Vec<PendingBlock>,
    /// `SMOVE`s for `moved`, plus a `DEL` of the snapshot at every height
    /// that was already paid.
    pub moves: Vec<Command>,
    /// Heights with a duplicate whose fate is still unknown.
    pub held_heights: BTreeSet<u64>,
    pub held: usize,
    retired_heights: BTreeSet<u64>,
}

/// Resolves candidates that share a height. Candidates are expected in load
/// order (height, then rotation time).
///
/// A candidate at one of `paid_heights` lost to a block that was already
/// paid from the same snapshot. It leaves as a duplicate and the snapshot
/// is dropped without crediting anyone again.
pub async fn reconcile(
    daemon: &dyn CoinDaemon,
    keys: &Keys,
    pending: Vec<PendingBlock>,
    paid_heights: &BTreeSet<u64>,
) -> Reconciliation {
    let mut result = Reconciliation::default();

    let (settled, pending): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .partition(|block| paid_heights.contains(&block.height()));
    for block in settled {
        info!(
            "{}: candidate {} at height {} lost to a block already paid",
            keys.coin(),
            block.candidate.block_hash,
            block.height()
        );
        result.retire(keys, block);
    }

    let mut per_height: HashMap<u64, usize> = HashMap::new();
    for block in &pending {
        *per_height.entry(block.height()).or_default() += 1;
    }

    let (duplicates, mut blocks): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .partition(|block| per_height[&block.height()] > 1);

    if duplicates.is_empty() {
        result.blocks = blocks;
        return result;
    }

    info!(
        "{}: {} duplicate candidates across {} heights",
        keys.coin(),
        duplicates.len(),
        duplicates.iter().map(|b| b.height()).collect::<HashSet<_>>().len()
    );

    let calls = duplicates
        .iter()
        .map(|block| RpcCall::new("getblock", vec![json!(block.candidate.block_hash)]))
        .collect();

    let replies = match daemon.batch(calls).await {
        Ok(replies) => replies,
        Err(e) => {
            warn!(
                "{}: could not check duplicate blocks, holding them: {}",
                keys.coin(),
                e
            );
            for block in duplicates {
                result.hold(block);
            }
            result.blocks = blocks;
            return result;
        }
    };

    let mut accepted_hashes: HashSet<String> = HashSet::new();
    for (block, reply) in duplicates.into_iter().zip(replies) {
        let info = match reply.decode::<BlockInfo>() {
            Some(Ok(info)) => info,
            Some(Err(e)) => {
                warn!(
                    "{}: unreadable getblock result for {}: {}",
                    keys.coin(),
                    block.candidate.block_hash,
                    e
                );
                result.hold(block);
                continue;
            }
            None => {
                warn!(
                    "{}: getblock failed for duplicate {} at height {}: {:?}",
                    keys.coin(),
                    block.candidate.block_hash,
                    block.height(),
                    reply.error
                );
                result.hold(block);
                continue;
            }
        };

        if info.confirmations < 0 {
            debug!(
                "{}: duplicate {} at height {} is off the main chain",
                keys.coin(),
                info.hash,
                block.height()
            );
            result.move_out(keys, block);
        } else if !accepted_hashes.insert(block.candidate.block_hash.clone()) {
            debug!(
                "{}: duplicate {} at height {} repeats an accepted hash",
                keys.coin(),
                block.candidate.block_hash,
                block.height()
            );
            result.move_out(keys, block);
        } else {
            blocks.push(block);
        }
    }

    blocks.sort_by_key(|b| (b.height(), b.candidate.time));
    result.blocks = blocks;
    result
}

impl Reconciliation {
    fn hold(&mut self, block: PendingBlock) {
        self.held += 1;
        self.held_heights.insert(block.height());
    }

    fn retire(&mut self, keys: &Keys, block: PendingBlock) {
        if self.retired_heights.insert(block.height()) {
            let snapshot = keys.round(RoundId::Height(block.height()));
            self.moves.push(Command::Del {
                keys: snapshot.all().iter().map(|k| k.to_string()).collect(),
            });
        }
        self.move_out(keys, block);
    }

    fn move_out(&mut self, keys: &Keys, block: PendingBlock) {
        self.moves.push(Command::SMove {
            source: keys.pending(),
            destination: keys.duplicate(),
            member: block.member.clone(),
        });
        self.moved.push(block);
    }
}
