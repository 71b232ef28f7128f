use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::config::{PoolConfig, Settings};
use crate::daemon::{CoinDaemon, DaemonClient};
use crate::database::{LedgerStore, RedisStore};
use crate::error::{PoolError, Result};
use crate::settlement::SettlementProcessor;
use crate::shares::{ShareIngest, ShareVerdict};

/// Verdicts buffered per coin before submitters are pushed back.
const SHARE_QUEUE_DEPTH: usize = 4096;

/// Everything one coin runs on: its config, daemon, ingest path and
/// settlement processor.
pub struct CoinPool {
    pub pool: Arc<PoolConfig>,
    pub daemon: Arc<dyn CoinDaemon>,
    pub ingest: Arc<ShareIngest>,
    pub processor: Arc<SettlementProcessor>,
    shares_tx: mpsc::Sender<ShareVerdict>,
    shares_rx: Arc<Mutex<mpsc::Receiver<ShareVerdict>>>,
}

impl CoinPool {
    pub fn new(
        pool: PoolConfig,
        store: Arc<dyn LedgerStore>,
        daemon: Arc<dyn CoinDaemon>,
        recovery_dir: &Path,
    ) -> Self {
        let pool = Arc::new(pool);
        let (shares_tx, shares_rx) = mpsc::channel(SHARE_QUEUE_DEPTH);
        Self {
            ingest: Arc::new(ShareIngest::new(store.clone(), pool.clone())),
            processor: Arc::new(SettlementProcessor::new(
                pool.clone(),
                store,
                daemon.clone(),
                recovery_dir.to_path_buf(),
            )),
            pool,
            daemon,
            shares_tx,
            shares_rx: Arc::new(Mutex::new(shares_rx)),
        }
    }

    pub fn coin(&self) -> &str {
        self.pool.coin_name()
    }

    /// Queues a verdict for the coin's share worker.
    pub async fn submit(&self, verdict: ShareVerdict) -> Result<()> {
        self.shares_tx
            .send(verdict)
            .await
            .map_err(|_| PoolError::ChannelClosed)
    }

    /// Next queued verdict. The queue outlives any single share worker, so a
    /// respawned worker picks up where the last one stopped.
    pub async fn next_share(&self) -> Option<ShareVerdict> {
        self.shares_rx.lock().await.recv().await
    }
}

/// All configured coins, keyed by coin name.
pub struct PoolCoordinator {
    coins: BTreeMap<String, Arc<CoinPool>>,
}

impl PoolCoordinator {
    /// Connects the shared store and one daemon client per coin.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let redis = RedisStore::new(&settings.redis_url).await?;
        info!("Ledger store connected at {}", redis.connection_info().addr);
        let store: Arc<dyn LedgerStore> = Arc::new(redis);

        let mut coins = Vec::with_capacity(settings.pools.len());
        for pool in &settings.pools {
            let daemon: Arc<dyn CoinDaemon> = Arc::new(DaemonClient::new(&pool.daemon)?);
            info!(
                "Pool {} mining {} on ports {:?}",
                pool.name,
                pool.coin.name,
                pool.ports.keys().collect::<Vec<_>>()
            );
            coins.push(CoinPool::new(
                pool.clone(),
                store.clone(),
                daemon,
                &settings.recovery_dir,
            ));
        }
        Ok(Self::from_pools(coins))
    }

    pub fn from_pools(pools: Vec<CoinPool>) -> Self {
        let coins = pools
            .into_iter()
            .map(|pool| (pool.coin().to_string(), Arc::new(pool)))
            .collect();
        Self { coins }
    }

    pub fn coin(&self, name: &str) -> Result<Arc<CoinPool>> {
        self.coins
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownCoin(name.to_string()))
    }

    pub fn coins(&self) -> impl Iterator<Item = &Arc<CoinPool>> {
        self.coins.values()
    }
}

#[cfg(test)]
pub(crate) fn test_coin(coin: &str, port: u16, daemon: Arc<dyn CoinDaemon>) -> (CoinPool, Arc<crate::test_utils::MemoryStore>) {
    let pool = PoolConfig::from_json(coin, &crate::config::sample_pool_json(coin, port))
        .expect("sample config parses");
    let store = Arc::new(crate::test_utils::MemoryStore::new());
    let coin = CoinPool::new(pool, store.clone(), daemon, Path::new("recovery"));
    (coin, store)
}
