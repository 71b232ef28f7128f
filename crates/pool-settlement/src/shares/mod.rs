pub mod ingest;
pub mod types;

pub use ingest::{share_batch, time_commands, ShareIngest, LIVENESS_THRESHOLD_MS};
pub use types::{IngestOutcome, ShareData, ShareVerdict};
