use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::coordinator::{CoinPool, PoolCoordinator};
use crate::error::{PoolError, Result};
use crate::metrics;
use crate::settlement::run_schedule;

pub const RESPAWN_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Shares,
    Payments,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Shares => write!(f, "share"),
            WorkerKind::Payments => write!(f, "payment"),
        }
    }
}

/// Messages reported up to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    BanIp(IpAddr),
}

struct WorkerExit {
    coin: Arc<CoinPool>,
    kind: WorkerKind,
    result: Result<()>,
}

/// Runs a share worker and a payment worker per coin, restarts workers that
/// exit and fans bans out to every share worker.
pub struct Supervisor {
    coordinator: Arc<PoolCoordinator>,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    bans: broadcast::Sender<IpAddr>,
    banned: Arc<RwLock<HashSet<IpAddr>>>,
}

impl Supervisor {
    pub fn new(coordinator: Arc<PoolCoordinator>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (bans, _) = broadcast::channel(256);
        Self {
            coordinator,
            events_tx,
            events_rx,
            bans,
            banned: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Channel for reporting events up to the supervisor.
    pub fn events(&self) -> mpsc::Sender<WorkerEvent> {
        self.events_tx.clone()
    }

    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();

        for coin in self.coordinator.coins() {
            self.spawn(coin.clone(), WorkerKind::Shares, Duration::ZERO, &exits_tx);
            if coin.pool.payment.enabled {
                self.spawn(coin.clone(), WorkerKind::Payments, Duration::ZERO, &exits_tx);
            } else {
                info!("{}: payment processing disabled", coin.coin());
            }
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Supervisor shutting down");
                    return Ok(());
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(exit) = exits_rx.recv() => {
                    let WorkerExit { coin, kind, result } = exit;
                    match result {
                        Err(PoolError::Halted(_)) if kind == WorkerKind::Payments => {
                            error!(
                                "{}: payment worker halted, not respawning until restart",
                                coin.coin()
                            );
                            continue;
                        }
                        Err(e) => warn!("{}: {} worker exited: {}", coin.coin(), kind, e),
                        Ok(()) => warn!("{}: {} worker exited", coin.coin(), kind),
                    }
                    self.spawn(coin, kind, RESPAWN_DELAY, &exits_tx);
                }
            }
        }
    }

    fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::BanIp(ip) => {
                let newly = self
                    .banned
                    .write()
                    .map(|mut banned| banned.insert(ip))
                    .unwrap_or(false);
                if newly {
                    info!("Banning {} on all workers", ip);
                }
                // No subscribers just means no share worker is up right now.
                let _ = self.bans.send(ip);
            }
        }
    }

    fn spawn(
        &self,
        coin: Arc<CoinPool>,
        kind: WorkerKind,
        delay: Duration,
        exits: &mpsc::UnboundedSender<WorkerExit>,
    ) {
        let exits = exits.clone();
        let bans = self.bans.subscribe();
        let banned = self.banned.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            debug!("{}: starting {} worker", coin.coin(), kind);

            let work = async {
                match kind {
                    WorkerKind::Shares => run_share_worker(coin.clone(), bans, banned).await,
                    WorkerKind::Payments => run_schedule(coin.processor.clone()).await,
                }
            };
            let result = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(PoolError::Worker(format!("{} worker panicked", kind))),
            };

            let _ = exits.send(WorkerExit { coin, kind, result });
        });
    }
}

/// Drains the coin's share queue into the ledger, dropping verdicts from
/// banned IPs.
pub async fn run_share_worker(
    coin: Arc<CoinPool>,
    mut bans: broadcast::Receiver<IpAddr>,
    banned: Arc<RwLock<HashSet<IpAddr>>>,
) -> Result<()> {
    let name = coin.coin().to_string();
    let mut local: HashSet<IpAddr> = banned
        .read()
        .map(|banned| banned.clone())
        .unwrap_or_default();

    loop {
        tokio::select! {
            ban = bans.recv() => match ban {
                Ok(ip) => {
                    local.insert(ip);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("{}: share worker missed {} bans, reloading", name, missed);
                    if let Ok(banned) = banned.read() {
                        local = banned.clone();
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(PoolError::ChannelClosed),
            },
            verdict = coin.next_share() => {
                let Some(verdict) = verdict else {
                    return Err(PoolError::ChannelClosed);
                };
                if verdict.share.ip.is_some_and(|ip| local.contains(&ip)) {
                    metrics::SHARES_DROPPED.with_label_values(&[name.as_str()]).inc();
                    debug!("{}: dropped share from banned {:?}", name, verdict.share.ip);
                    continue;
                }
                if let Err(e) = coin.ingest.ingest(&verdict).await {
                    error!(
                        "{}: could not record share from {}: {}",
                        name, verdict.share.worker, e
                    );
                }
            }
        }
    }
}
