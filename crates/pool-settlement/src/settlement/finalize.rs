use std::collections::{BTreeMap, HashMap, HashSet};

use super::types::{Category, CoinUnits, Round};
use crate::database::{Batch, Command, Guard, Keys, RoundId, WorkerLedger};

pub const LAST_CYCLE_FIELD: &str = "lastCycle";
pub const TOTAL_PAID_FIELD: &str = "totalPaid";

/// Everything a cycle decided, ready to be written in one batch.
#[derive(Debug)]
pub struct Settlement<'a> {
    pub rounds: &'a [Round],
    pub duplicate_moves: &'a [Command],
    pub ledger: &'a HashMap<String, WorkerLedger>,
    /// Workers holding an immature entry when the cycle started.
    pub stored_immature: &'a HashSet<String>,
    /// `lastCycle` as read at cycle start.
    pub last_cycle: Option<&'a str>,
    pub cycle_id: &'a str,
}

/// Builds the single guarded batch that records a cycle. Returns `None` when
/// the cycle changed nothing.
///
/// The batch only applies while every settled candidate is still pending and
/// no other cycle has committed since this one started, so replaying it is a
/// no-op.
pub fn build_final_batch(keys: &Keys, units: &CoinUnits, settlement: &Settlement) -> Option<Batch> {
    let mut batch = Batch::new();

    batch.extend(settlement.duplicate_moves.iter().cloned());
    let moved = settlement
        .duplicate_moves
        .iter()
        .filter(|c| matches!(c, Command::SMove { .. }))
        .count();
    if moved > 0 {
        batch.push(Command::HIncrBy {
            key: keys.block_counts(),
            field: "duplicateBlocks".into(),
            delta: moved as i64,
        });
    }

    let mut released: HashSet<u64> = HashSet::new();
    let mut outcome_counts: BTreeMap<&str, i64> = BTreeMap::new();

    for round in settlement.rounds {
        let (destination, counter) = match round.category {
            Category::Immature => continue,
            Category::Generate => (keys.confirmed(), "confirmedBlocks"),
            Category::Orphan => (keys.orphaned(), "orphanedBlocks"),
            Category::Kicked => (keys.kicked(), "kickedBlocks"),
        };

        batch.push(Command::SMove {
            source: keys.pending(),
            destination,
            member: round.block.member.clone(),
        });
        *outcome_counts.entry(counter).or_default() += 1;

        if !round.can_delete_shares || !released.insert(round.height()) {
            continue;
        }
        release_round(keys, round, &mut batch);
    }

    for (field, delta) in outcome_counts {
        batch.push(Command::HIncrBy {
            key: keys.block_counts(),
            field: field.into(),
            delta,
        });
    }

    let mut total_sent = 0;
    let workers: BTreeMap<&String, &WorkerLedger> = settlement.ledger.iter().collect();
    for (worker, entry) in workers {
        if entry.balance_change != 0 {
            batch.push(Command::HIncrByFloat {
                key: keys.balances(),
                field: worker.clone(),
                delta: units.to_coins(entry.balance_change),
            });
        }
        if entry.sent > 0 {
            total_sent += entry.sent;
            batch.push(Command::HIncrByFloat {
                key: keys.payouts(),
                field: worker.clone(),
                delta: units.to_coins(entry.sent),
            });
        }
        if entry.immature > 0 {
            batch.push(Command::HSet {
                key: keys.immature(),
                field: worker.clone(),
                value: units.to_coins(entry.immature).to_string(),
            });
        } else if settlement.stored_immature.contains(worker.as_str()) {
            batch.push(Command::HDel {
                key: keys.immature(),
                field: worker.clone(),
            });
        }
    }

    let mut stale: Vec<&String> = settlement
        .stored_immature
        .iter()
        .filter(|worker| !settlement.ledger.contains_key(worker.as_str()))
        .collect();
    stale.sort();
    for worker in stale {
        batch.push(Command::HDel {
            key: keys.immature(),
            field: worker.clone(),
        });
    }

    if total_sent > 0 {
        batch.push(Command::HIncrByFloat {
            key: keys.stats(),
            field: TOTAL_PAID_FIELD.into(),
            delta: units.to_coins(total_sent),
        });
    }

    if batch.is_empty() {
        return None;
    }

    batch.push(Command::HSet {
        key: keys.stats(),
        field: LAST_CYCLE_FIELD.into(),
        value: settlement.cycle_id.to_string(),
    });

    batch.guard(Guard::Field {
        key: keys.stats(),
        field: LAST_CYCLE_FIELD.into(),
        value: settlement.last_cycle.map(str::to_string),
    });
    let settled = settlement
        .rounds
        .iter()
        .filter(|r| r.category != Category::Immature)
        .map(|r| r.block.member.clone());
    let duplicates = settlement.duplicate_moves.iter().filter_map(|c| match c {
        Command::SMove { member, .. } => Some(member.clone()),
        _ => None,
    });
    for member in settled.chain(duplicates) {
        batch.guard(Guard::Member {
            key: keys.pending(),
            member,
        });
    }

    Some(batch)
}

/// Drops a settled round's snapshot. Contributions nobody was paid for move
/// forward into the current round.
fn release_round(keys: &Keys, round: &Round, batch: &mut Batch) {
    let current = keys.current();
    let mut carry = |key: &str, shares: &HashMap<String, f64>| {
        let mut workers: Vec<_> = shares.iter().collect();
        workers.sort_by(|a, b| a.0.cmp(b.0));
        for (worker, value) in workers {
            batch.push(Command::HIncrByFloat {
                key: key.to_string(),
                field: worker.clone(),
                delta: *value,
            });
        }
    };

    match round.category {
        Category::Orphan | Category::Kicked => {
            carry(&current.values, &round.shares.shared);
            carry(&current.values_solo, &round.shares.solo);
        }
        Category::Generate if round.block.candidate.solo => {
            carry(&current.values, &round.shares.shared);
        }
        Category::Generate | Category::Immature => {}
    }

    let snapshot = keys.round(RoundId::Height(round.height()));
    batch.push(Command::Del {
        keys: snapshot.all().iter().map(|k| k.to_string()).collect(),
    });
}
