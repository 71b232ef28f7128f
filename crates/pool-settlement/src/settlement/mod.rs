pub mod classify;
pub mod duplicates;
pub mod finalize;
pub mod payments;
pub mod rewards;
pub mod types;

pub use finalize::{build_final_batch, Settlement, LAST_CYCLE_FIELD};
pub use payments::Disbursement;
pub use types::{Category, CoinUnits, CycleMode, CycleReport, PendingBlock, Round, RoundShares};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::daemon::{AddressInfo, CoinDaemon};
use crate::database::{Batch, BlockCandidate, Command, Keys, LedgerStore, RoundId, WorkerLedger};
use crate::error::{PoolError, Result};
use crate::metrics;

/// Delay before the first cycle after start.
pub const FIRST_RUN_DELAY: Duration = Duration::from_millis(100);

/// Periodic settlement for one coin: reconciles pending blocks, credits
/// rewards, pays miners and records the outcome in one atomic batch.
pub struct SettlementProcessor {
    pool: Arc<PoolConfig>,
    keys: Keys,
    store: Arc<dyn LedgerStore>,
    daemon: Arc<dyn CoinDaemon>,
    recovery_dir: PathBuf,
    units: OnceCell<CoinUnits>,
    cycle_lock: Mutex<()>,
    halted: AtomicBool,
}

impl SettlementProcessor {
    pub fn new(
        pool: Arc<PoolConfig>,
        store: Arc<dyn LedgerStore>,
        daemon: Arc<dyn CoinDaemon>,
        recovery_dir: PathBuf,
    ) -> Self {
        Self {
            keys: Keys::new(pool.coin_name()),
            pool,
            store,
            daemon,
            recovery_dir,
            units: OnceCell::new(),
            cycle_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
        }
    }

    pub fn coin(&self) -> &str {
        self.keys.coin()
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// A halted coin has an unrecorded outcome on disk and runs no more
    /// cycles until an operator replays it and restarts.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn recovery_path(&self) -> PathBuf {
        self.recovery_dir
            .join(format!("{}_final_commands.json", self.coin()))
    }

    /// Runs one cycle unless another one is still in flight.
    pub async fn run_cycle(&self, mode: CycleMode) -> Result<CycleReport> {
        let coin = self.coin();
        if self.is_halted() {
            return Err(PoolError::Halted(coin.to_string()));
        }
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            warn!("{}: previous settlement cycle still running, skipping {} cycle", coin, mode);
            return Ok(CycleReport {
                overlapped: true,
                ..Default::default()
            });
        };

        let timer = metrics::CYCLE_DURATION.with_label_values(&[coin]).start_timer();
        let result = match self.units.get_or_try_init(|| self.setup()).await {
            Ok(units) => self.settle(mode, *units).await,
            Err(e) => Err(e),
        };
        timer.observe_duration();

        let outcome = match &result {
            Ok(report) if report.committed => "committed",
            Ok(_) => "idle",
            Err(_) => "failed",
        };
        metrics::SETTLEMENT_CYCLES
            .with_label_values(&[coin, outcome])
            .inc();
        result
    }

    /// Confirms the wallet owns the pool address and settles the coin's
    /// precision. Runs once; a failure is retried on the next cycle.
    async fn setup(&self) -> Result<CoinUnits> {
        let coin = self.coin();
        if !self.owns_address("validateaddress").await? && !self.owns_address("getaddressinfo").await? {
            error!(
                "{}: daemon does not own pool address {}, payments disabled",
                coin, self.pool.address
            );
            return Err(PoolError::AddressNotOwned(self.pool.address.clone()));
        }

        let units = match self.pool.payment.coin_precision {
            Some(precision) => CoinUnits::new(precision)?,
            None => match self.daemon.call("getbalance", vec![]).await?.into_result()? {
                Value::Number(balance) => CoinUnits::from_balance_text(&balance.to_string())?,
                other => {
                    return Err(PoolError::Configuration(format!(
                        "{}: unexpected getbalance result {}",
                        coin, other
                    )))
                }
            },
        };
        info!(
            "{}: settlement ready, {} decimal places, magnitude {}",
            coin, units.precision, units.magnitude
        );
        Ok(units)
    }

    async fn owns_address(&self, method: &str) -> Result<bool> {
        let reply = self
            .daemon
            .call(method, vec![json!(self.pool.address)])
            .await?;
        Ok(matches!(reply.decode::<AddressInfo>(), Some(Ok(info)) if info.ismine))
    }

    async fn settle(&self, mode: CycleMode, units: CoinUnits) -> Result<CycleReport> {
        let coin = self.coin();
        let payment = &self.pool.payment;
        let mut report = CycleReport::default();

        let last_cycle = self.store.hget(&self.keys.stats(), LAST_CYCLE_FIELD).await?;
        let pending = self.load_pending().await?;
        report.pending = pending.len();
        if pending.is_empty() && mode == CycleMode::Check {
            debug!("{}: no pending blocks", coin);
            return Ok(report);
        }

        let paid_heights = self.load_paid_heights(&pending).await?;
        let reconciliation =
            duplicates::reconcile(self.daemon.as_ref(), &self.keys, pending, &paid_heights).await;
        report.held_duplicates = reconciliation.held;
        report.moved_duplicates = reconciliation.moved.len();

        let classification = classify::classify(
            self.daemon.as_ref(),
            &self.pool.address,
            &units,
            reconciliation.blocks,
            payment.max_blocks_per_payment,
            &reconciliation.held_heights,
        )
        .await?;

        let mut rounds = classification.rounds;
        if mode == CycleMode::Check {
            for round in rounds.iter_mut().filter(|r| r.category == Category::Generate) {
                round.category = Category::Immature;
                round.can_delete_shares = false;
            }
        }
        for round in rounds.iter_mut() {
            round.shares = self.load_shares(round.height()).await?;
        }

        let (mut ledger, stored_immature) = self.load_ledger(&units).await?;
        let fee = units.to_base(self.pool.coin.txfee);
        let (rounds, skipped) = rewards::calculate_rewards(rounds, fee, &mut ledger);
        report.skipped_rounds = classification.skipped.len() + skipped.len();

        let disbursement = match mode {
            CycleMode::Check => {
                payments::roll_over(&mut ledger);
                Disbursement::default()
            }
            CycleMode::Payment => {
                payments::send_payments(
                    self.daemon.as_ref(),
                    &classification.account,
                    &mut ledger,
                    &units,
                    units.to_base(payment.minimum_payment),
                    payment.max_withhold_percent,
                )
                .await?
            }
        };
        report.recipients = disbursement.recipients;
        report.total_sent = disbursement.total_sent;
        report.withhold_percent = disbursement.withhold_percent;

        let cycle_id = uuid::Uuid::new_v4().to_string();
        let settlement = Settlement {
            rounds: &rounds,
            duplicate_moves: &reconciliation.moves,
            ledger: &ledger,
            stored_immature: &stored_immature,
            last_cycle: last_cycle.as_deref(),
            cycle_id: &cycle_id,
        };
        let Some(batch) = build_final_batch(&self.keys, &units, &settlement) else {
            debug!("{}: nothing to record this {} cycle", coin, mode);
            return Ok(report);
        };

        match self.store.apply(&batch).await {
            Ok(true) => report.committed = true,
            Ok(false) if disbursement.total_sent == 0 => {
                warn!(
                    "{}: ledger changed during the {} cycle, retrying next cycle",
                    coin, mode
                );
                return Ok(report);
            }
            Ok(false) => {
                let reason = "ledger changed while a payment was in flight";
                self.halt(&batch, reason).await;
                return Err(PoolError::LedgerCommitFailure {
                    coin: coin.to_string(),
                    reason: reason.to_string(),
                });
            }
            Err(e) => {
                self.halt(&batch, &e.to_string()).await;
                return Err(PoolError::LedgerCommitFailure {
                    coin: coin.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        for round in &rounds {
            match round.category {
                Category::Generate => report.generate += 1,
                Category::Immature => report.immature += 1,
                Category::Orphan => report.orphaned += 1,
                Category::Kicked => report.kicked += 1,
            }
            metrics::ROUNDS_SETTLED
                .with_label_values(&[coin, round.category.as_str()])
                .inc();
        }
        metrics::PAID_BASE_UNITS
            .with_label_values(&[coin])
            .inc_by(disbursement.total_sent.max(0) as u64);
        metrics::WITHHOLD_PERCENT
            .with_label_values(&[coin])
            .set(disbursement.withhold_percent as i64);

        Ok(report)
    }

    async fn load_pending(&self) -> Result<Vec<PendingBlock>> {
        let mut pending: Vec<PendingBlock> = self
            .store
            .smembers(&self.keys.pending())
            .await?
            .into_iter()
            .filter_map(|member| match BlockCandidate::from_member(&member) {
                Ok(candidate) => Some(PendingBlock { candidate, member }),
                Err(e) => {
                    error!("{}: unreadable pending block {:?}: {}", self.coin(), member, e);
                    None
                }
            })
            .collect();
        pending.sort_by_key(|b| (b.candidate.height, b.candidate.time));
        Ok(pending)
    }

    /// Heights among `pending` already settled by a confirmed block.
    async fn load_paid_heights(&self, pending: &[PendingBlock]) -> Result<BTreeSet<u64>> {
        if pending.is_empty() {
            return Ok(BTreeSet::new());
        }
        let heights: BTreeSet<u64> = pending.iter().map(|b| b.height()).collect();
        Ok(self
            .store
            .smembers(&self.keys.confirmed())
            .await?
            .iter()
            .filter_map(|member| BlockCandidate::from_member(member).ok())
            .map(|candidate| candidate.height)
            .filter(|height| heights.contains(height))
            .collect())
    }

    async fn load_shares(&self, height: u64) -> Result<RoundShares> {
        let snapshot = self.keys.round(RoundId::Height(height));
        let shared = self.store.hgetall(&snapshot.values).await?;
        let solo = self.store.hgetall(&snapshot.values_solo).await?;
        Ok(RoundShares::from_store(height, shared, solo))
    }

    /// Loads carried balances. Immature values are recomputed every cycle,
    /// so only the set of workers holding one is kept.
    async fn load_ledger(
        &self,
        units: &CoinUnits,
    ) -> Result<(HashMap<String, WorkerLedger>, HashSet<String>)> {
        let balances = self.store.hgetall(&self.keys.balances()).await?;
        let immature = self.store.hgetall(&self.keys.immature()).await?;

        let mut ledger = HashMap::new();
        for (worker, value) in balances {
            match value.parse::<f64>() {
                Ok(coins) => {
                    ledger.insert(
                        worker,
                        WorkerLedger {
                            balance: units.to_base(coins),
                            ..Default::default()
                        },
                    );
                }
                Err(_) => error!(
                    "{}: unreadable balance {:?} for {}, leaving it untouched",
                    self.coin(),
                    value,
                    worker
                ),
            }
        }
        Ok((ledger, immature.into_keys().collect()))
    }

    /// Writes the unrecorded batch for manual replay and stops the coin.
    async fn halt(&self, batch: &Batch, reason: &str) {
        self.halted.store(true, Ordering::SeqCst);
        let coin = self.coin();
        let path = self.recovery_path();

        let written = match batch.to_wire() {
            Ok(wire) => match tokio::fs::create_dir_all(&self.recovery_dir).await {
                Ok(()) => tokio::fs::write(&path, wire).await.map_err(PoolError::from),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        };

        match written {
            Ok(()) => error!(
                "{}: could not record settlement ({}). {} commands written to {}; replay them and restart",
                coin,
                reason,
                batch.len(),
                path.display()
            ),
            Err(e) => error!(
                "{}: could not record settlement ({}) nor write {}: {}. Commands: {:?}",
                coin,
                reason,
                path.display(),
                e,
                batch.commands.iter().map(Command::to_args).collect::<Vec<_>>()
            ),
        }
    }
}

/// Drives check and payment cycles for one coin until it halts.
pub async fn run_schedule(processor: Arc<SettlementProcessor>) -> Result<()> {
    let coin = processor.coin().to_string();
    let payment = &processor.pool().payment;
    let start = Instant::now() + FIRST_RUN_DELAY;

    let mut payments = interval_at(start, Duration::from_secs(payment.payment_interval));
    payments.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut checks = interval_at(start, Duration::from_secs(payment.check_interval));
    checks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "{}: payments every {}s, checks every {}s",
        coin, payment.payment_interval, payment.check_interval
    );

    loop {
        let mode = tokio::select! {
            biased;
            _ = payments.tick() => CycleMode::Payment,
            _ = checks.tick() => CycleMode::Check,
        };

        match processor.run_cycle(mode).await {
            Ok(report) if report.committed => info!(
                "{}: {} cycle recorded: {} paid to {} miners, {} confirmed, {} immature, {} orphaned, {} kicked",
                coin,
                mode,
                report.total_sent,
                report.recipients,
                report.generate,
                report.immature,
                report.orphaned,
                report.kicked
            ),
            Ok(report) => debug!("{}: {} cycle: {:?}", coin, mode, report),
            Err(e) => error!("{}: {} cycle aborted: {}", coin, mode, e),
        }

        if processor.is_halted() {
            return Err(PoolError::Halted(coin));
        }
    }
}
