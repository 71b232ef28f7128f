use std::collections::HashMap;

use thiserror::Error;
use tracing::error;

use super::types::{Category, Round};
use crate::database::WorkerLedger;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoundSkip {
    #[error("round {height} has no recorded shares")]
    MissingShares { height: u64 },

    #[error("round {height} would pay {worker} {proportion:.4} of the reward")]
    Overpayment {
        height: u64,
        worker: String,
        proportion: f64,
    },
}

/// Credits one round into the cycle ledger. Nothing is credited when the
/// round is skipped.
pub fn credit_round(
    round: &Round,
    fee: i64,
    ledger: &mut HashMap<String, WorkerLedger>,
) -> Result<(), RoundSkip> {
    if !round.category.is_active() {
        return Ok(());
    }
    if round.shares.is_empty() {
        return Err(RoundSkip::MissingShares {
            height: round.height(),
        });
    }

    let payable = (round.reward - fee).max(0);
    let candidate = &round.block.candidate;

    if candidate.solo {
        let finder = ledger.entry(candidate.worker.clone()).or_default();
        credit(finder, round.category, payable);
        let solo_shares: f64 = round.shares.solo.values().sum();
        finder.total_shares += solo_shares;
        return Ok(());
    }

    let total: f64 = round.shares.shared.values().sum();
    let mut credits = Vec::with_capacity(round.shares.shared.len());
    for (worker, &shares) in &round.shares.shared {
        let proportion = if total > 0.0 { shares / total } else { 0.0 };
        if proportion > 1.0 {
            return Err(RoundSkip::Overpayment {
                height: round.height(),
                worker: worker.clone(),
                proportion,
            });
        }
        let amount = (payable as f64 * proportion).floor() as i64;
        credits.push((worker, amount, shares));
    }

    for (worker, amount, shares) in credits {
        let entry = ledger.entry(worker.clone()).or_default();
        credit(entry, round.category, amount);
        entry.total_shares += shares;
    }
    Ok(())
}

fn credit(entry: &mut WorkerLedger, category: Category, amount: i64) {
    match category {
        Category::Generate => entry.reward += amount,
        Category::Immature => entry.immature += amount,
        Category::Orphan | Category::Kicked => {}
    }
}

/// Credits every round and drops the ones that could not be credited.
/// Returns the dropped rounds so they stay pending.
pub fn calculate_rewards(
    rounds: Vec<Round>,
    fee: i64,
    ledger: &mut HashMap<String, WorkerLedger>,
) -> (Vec<Round>, Vec<(Round, RoundSkip)>) {
    let mut settled = Vec::with_capacity(rounds.len());
    let mut skipped = Vec::new();

    for round in rounds {
        match credit_round(&round, fee, ledger) {
            Ok(()) => settled.push(round),
            Err(skip) => {
                error!("Skipping round this cycle: {}", skip);
                skipped.push((round, skip));
            }
        }
    }
    (settled, skipped)
}
