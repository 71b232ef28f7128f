use crate::error::{PoolError, Result};
use crate::settlement::types::MAX_PRECISION;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinConfig {
    pub name: String,
    pub symbol: String,
    pub algorithm: String,
    /// Fee in coins subtracted once from every settled round.
    #[serde(default)]
    pub txfee: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub diff: f64,
    /// Shares arriving on a solo port are credited to their finder only.
    #[serde(default)]
    pub solo: bool,
}

#[derive(Deserialize, Clone)]
pub struct DaemonConfig {
    pub url: String,
    pub user: String,
    pub password: String,
}

/// Custom Debug to redact passwords
impl std::fmt::Debug for DaemonConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DaemonConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"[redacted]")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between validation-only cycles.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Seconds between disbursement cycles.
    #[serde(default = "default_payment_interval")]
    pub payment_interval: u64,
    /// Smallest payout in coins; smaller amounts roll over into the balance.
    pub minimum_payment: f64,
    #[serde(default = "default_max_blocks_per_payment")]
    pub max_blocks_per_payment: usize,
    #[serde(default = "default_max_withhold_percent")]
    pub max_withhold_percent: u32,
    /// Decimal places of the coin; discovered from `getbalance` when unset.
    #[serde(default)]
    pub coin_precision: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> u64 {
    20
}

fn default_payment_interval() -> u64 {
    120
}

fn default_max_blocks_per_payment() -> usize {
    3
}

fn default_max_withhold_percent() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Pool name, defaults to the config file stem.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub coin: CoinConfig,
    /// Pool wallet address receiving block rewards.
    pub address: String,
    pub ports: BTreeMap<u16, PortConfig>,
    pub daemon: DaemonConfig,
    pub payment: PaymentConfig,
}

impl PoolConfig {
    pub fn from_json(name: &str, json: &str) -> Result<Self> {
        let mut config: PoolConfig = serde_json::from_str(json)
            .map_err(|e| PoolError::Configuration(format!("{}: {}", name, e)))?;
        if config.name.is_empty() {
            config.name = name.to_string();
        }
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(PoolError::Configuration(format!(
                "{}: pool address is empty",
                self.name
            )));
        }
        if self.ports.is_empty() {
            return Err(PoolError::Configuration(format!(
                "{}: no ports configured",
                self.name
            )));
        }
        if self.payment.check_interval == 0 || self.payment.payment_interval == 0 {
            return Err(PoolError::Configuration(format!(
                "{}: settlement intervals must be positive",
                self.name
            )));
        }
        if self.payment.max_withhold_percent >= 100 {
            return Err(PoolError::Configuration(format!(
                "{}: maxWithholdPercent must be below 100",
                self.name
            )));
        }
        if let Some(precision) = self.payment.coin_precision {
            if precision > MAX_PRECISION {
                return Err(PoolError::Configuration(format!(
                    "{}: coinPrecision must be at most {}",
                    self.name, MAX_PRECISION
                )));
            }
        }
        if self.payment.minimum_payment < 0.0 || self.coin.txfee < 0.0 {
            return Err(PoolError::Configuration(format!(
                "{}: amounts must not be negative",
                self.name
            )));
        }
        Ok(())
    }

    pub fn coin_name(&self) -> &str {
        &self.coin.name
    }

    /// Whether shares submitted on `port` are solo-mined. Unknown ports
    /// count as shared.
    pub fn is_solo_port(&self, port: u16) -> bool {
        self.ports.get(&port).map(|p| p.solo).unwrap_or(false)
    }
}

/// Process-wide settings, built once at start and passed down by value.
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub recovery_dir: PathBuf,
    pub http_bind: SocketAddr,
    pub pools: Vec<PoolConfig>,
}

impl Settings {
    /// Host and port of the ledger store, without credentials.
    pub fn store_address(&self) -> Result<String> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        Ok(client.get_connection_info().addr.to_string())
    }
}

/// Reads every `*.json` file in `dir` and returns the enabled pools.
pub fn load_pool_configs(dir: &Path) -> Result<Vec<PoolConfig>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    paths.sort();

    let mut pools = Vec::new();
    for path in paths {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let json = std::fs::read_to_string(&path)?;
        let pool = PoolConfig::from_json(&name, &json)?;

        if !pool.enabled {
            info!("Pool {} is disabled, skipping", pool.name);
            continue;
        }
        pools.push(pool);
    }

    if pools.is_empty() {
        warn!("No enabled pools found in {}", dir.display());
    }
    validate_pools(&pools)?;
    Ok(pools)
}

/// Rejects enabled pools sharing a name, a coin or a port.
pub fn validate_pools(pools: &[PoolConfig]) -> Result<()> {
    let mut names: HashMap<&str, &str> = HashMap::new();
    let mut coins: HashMap<&str, &str> = HashMap::new();
    let mut ports: HashMap<u16, &str> = HashMap::new();

    for pool in pools.iter().filter(|p| p.enabled) {
        if let Some(other) = names.insert(&pool.name, &pool.name) {
            return Err(PoolError::ConfigOverlap(format!(
                "pool name {} is used twice",
                other
            )));
        }
        if let Some(other) = coins.insert(&pool.coin.name, &pool.name) {
            return Err(PoolError::ConfigOverlap(format!(
                "pools {} and {} both mine {}",
                other, pool.name, pool.coin.name
            )));
        }
        for port in pool.ports.keys() {
            if let Some(other) = ports.insert(*port, &pool.name) {
                return Err(PoolError::ConfigOverlap(format!(
                    "pools {} and {} both listen on port {}",
                    other, pool.name, port
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_pool_json(coin: &str, port: u16) -> String {
    serde_json::json!({
        "coin": {"name": coin, "symbol": "LTC", "algorithm": "scrypt", "txfee": 0.0004},
        "address": "Lpooladdress",
        "ports": {
            port.to_string(): {"diff": 8},
            (port + 1).to_string(): {"diff": 32, "solo": true}
        },
        "daemon": {"url": "http://127.0.0.1:19332", "user": "rpc", "password": "secret"},
        "payment": {"minimumPayment": 0.01}
    })
    .to_string()
}
