use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, TextEncoder,
};

lazy_static! {
    pub static ref SHARES_ACCEPTED: IntCounterVec = IntCounterVec::new(
        Opts::new("pool_shares_accepted_total", "Total number of valid shares ingested"),
        &["coin"]
    ).expect("metric definition is valid");

    pub static ref SHARES_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("pool_shares_rejected_total", "Total number of invalid shares ingested"),
        &["coin"]
    ).expect("metric definition is valid");

    pub static ref SHARES_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("pool_shares_dropped_total", "Shares dropped because their IP is banned"),
        &["coin"]
    ).expect("metric definition is valid");

    pub static ref BLOCKS_FOUND: IntCounterVec = IntCounterVec::new(
        Opts::new("pool_blocks_found_total", "Total number of blocks found"),
        &["coin"]
    ).expect("metric definition is valid");

    pub static ref SETTLEMENT_CYCLES: IntCounterVec = IntCounterVec::new(
        Opts::new("pool_settlement_cycles_total", "Settlement cycles by outcome"),
        &["coin", "outcome"]
    ).expect("metric definition is valid");

    pub static ref ROUNDS_SETTLED: IntCounterVec = IntCounterVec::new(
        Opts::new("pool_rounds_settled_total", "Rounds committed by category"),
        &["coin", "category"]
    ).expect("metric definition is valid");

    pub static ref PAID_BASE_UNITS: IntCounterVec = IntCounterVec::new(
        Opts::new("pool_paid_base_units_total", "Amount disbursed to miners in base units"),
        &["coin"]
    ).expect("metric definition is valid");

    pub static ref WITHHOLD_PERCENT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("pool_withhold_percent", "Percent withheld in the last disbursement"),
        &["coin"]
    ).expect("metric definition is valid");

    pub static ref CYCLE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("pool_settlement_cycle_seconds", "Duration of settlement cycles"),
        &["coin"]
    ).expect("metric definition is valid");
}

pub fn register_metrics() -> prometheus::Result<()> {
    prometheus::register(Box::new(SHARES_ACCEPTED.clone()))?;
    prometheus::register(Box::new(SHARES_REJECTED.clone()))?;
    prometheus::register(Box::new(SHARES_DROPPED.clone()))?;
    prometheus::register(Box::new(BLOCKS_FOUND.clone()))?;
    prometheus::register(Box::new(SETTLEMENT_CYCLES.clone()))?;
    prometheus::register(Box::new(ROUNDS_SETTLED.clone()))?;
    prometheus::register(Box::new(PAID_BASE_UNITS.clone()))?;
    prometheus::register(Box::new(WITHHOLD_PERCENT.clone()))?;
    prometheus::register(Box::new(CYCLE_DURATION.clone()))?;
    Ok(())
}

pub fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
