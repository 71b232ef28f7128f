use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use super::types::CoinUnits;
use crate::daemon::{CoinDaemon, DaemonError, RPC_WALLET_INSUFFICIENT_FUNDS};
use crate::database::WorkerLedger;
use crate::error::{PoolError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Disbursement {
    pub withhold_percent: u32,
    pub total_sent: i64,
    pub recipients: usize,
}

/// Decides per worker what goes out at the given withholding and what rolls
/// into the balance. Returns the amounts to send, in base units.
pub fn plan_disbursement(
    ledger: &mut HashMap<String, WorkerLedger>,
    withhold_percent: u32,
    minimum: i64,
) -> BTreeMap<String, i64> {
    let keep = 100 - withhold_percent.min(100) as i64;
    let mut plan = BTreeMap::new();

    for (worker, entry) in ledger.iter_mut() {
        let owed = entry.balance + entry.reward;
        let to_send = (owed * keep).div_euclid(100);

        if to_send > 0 && to_send >= minimum {
            entry.sent = to_send;
            entry.balance_change = -entry.balance.min(to_send);
            plan.insert(worker.clone(), to_send);
        } else {
            entry.sent = 0;
            entry.balance_change = (to_send - entry.balance).max(0);
        }
    }
    plan
}

/// Moves every reward into the balance without sending anything.
pub fn roll_over(ledger: &mut HashMap<String, WorkerLedger>) {
    for entry in ledger.values_mut() {
        entry.sent = 0;
        entry.balance_change = entry.reward;
    }
}

/// Pays out everything above the minimum in one `sendmany`. When the wallet
/// cannot cover the fee the payout is retried with one more percent withheld,
/// up to `max_withhold_percent`.
pub async fn send_payments(
    daemon: &dyn CoinDaemon,
    account: &str,
    ledger: &mut HashMap<String, WorkerLedger>,
    units: &CoinUnits,
    minimum: i64,
    max_withhold_percent: u32,
) -> Result<Disbursement> {
    let mut withhold_percent = 0;

    loop {
        let plan = plan_disbursement(ledger, withhold_percent, minimum);
        if plan.is_empty() {
            if withhold_percent > 0 {
                // Nobody clears the minimum after withholding; keep it all.
                roll_over(ledger);
            }
            return Ok(Disbursement::default());
        }

        let amounts: Map<String, Value> = plan
            .iter()
            .map(|(address, amount)| (address.clone(), json!(units.to_coins(*amount))))
            .collect();

        let reply = match daemon
            .call("sendmany", vec![json!(account), Value::Object(amounts)])
            .await
        {
            Ok(reply) => reply,
            Err(DaemonError::Http {
                status_code,
                message,
            }) => {
                return Err(PoolError::Payment(format!(
                    "HTTP {}: {}",
                    status_code, message
                )))
            }
            Err(e) => {
                error!(
                    "sendmany of {} to {} miners got no answer, nothing recorded: {}",
                    units.to_coins(plan.values().sum()),
                    plan.len(),
                    e
                );
                return Err(PoolError::Daemon(e));
            }
        };

        match reply.error {
            None => {
                let total_sent: i64 = plan.values().sum();
                if withhold_percent > 0 {
                    warn!(
                        "Had to withhold {}% of reward from miners to cover transaction fees",
                        withhold_percent
                    );
                }
                let txid = reply.result.unwrap_or_default();
                info!(
                    "Sent {} to {} miners, txid {}",
                    units.to_coins(total_sent),
                    plan.len(),
                    txid
                );
                return Ok(Disbursement {
                    withhold_percent,
                    total_sent,
                    recipients: plan.len(),
                });
            }
            Some(err) if err.code == RPC_WALLET_INSUFFICIENT_FUNDS => {
                if withhold_percent >= max_withhold_percent {
                    return Err(PoolError::UnderfundedFee {
                        withheld_percent: withhold_percent,
                    });
                }
                withhold_percent += 1;
                warn!(
                    "Insufficient funds for transaction fee ({}), retrying with {}% withheld",
                    err.message, withhold_percent
                );
            }
            Some(err) => {
                return Err(PoolError::Payment(format!("{} {}", err.code, err.message)));
            }
        }
    }
}
