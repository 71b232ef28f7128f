pub mod rpc;

pub use rpc::DaemonClient;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Invalid or non-wallet transaction id, unknown block hash.
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// Wallet cannot cover the amount plus the transaction fee.
pub const RPC_WALLET_INSUFFICIENT_FUNDS: i64 = -6;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("daemon unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP error {status_code}: {message}")]
    Http { status_code: u16, message: String },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unparseable daemon response: {0}")]
    Parse(String),

    #[error("batch returned {got} replies for {expected} calls")]
    BatchMismatch { expected: usize, got: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcCall {
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcCall {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// One JSON-RPC reply. Transport failures never produce a reply; they are
/// reported as [`DaemonError`] by the client instead.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcReply {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(code: i64, message: &str) -> Self {
        Self {
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.to_string(),
            }),
        }
    }

    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().map(|e| e.code)
    }

    /// The raw result, with a daemon-reported error turned into [`DaemonError::Rpc`].
    pub fn into_result(self) -> Result<Value, DaemonError> {
        match self.error {
            Some(err) => Err(DaemonError::Rpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    /// Decodes the result, `None` when the daemon returned an error or null.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        if self.error.is_some() {
            return None;
        }
        match &self.result {
            Some(Value::Null) | None => None,
            Some(value) => Some(serde_json::from_value(value.clone())),
        }
    }
}

/// The coin daemon as seen by the settlement engine.
#[async_trait]
pub trait CoinDaemon: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<RpcReply, DaemonError>;

    /// Issues all calls in one round trip. Replies come back in call order.
    async fn batch(&self, calls: Vec<RpcCall>) -> Result<Vec<RpcReply>, DaemonError>;
}

/// `getblock` result fields used for duplicate resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockInfo {
    pub hash: String,
    #[serde(default)]
    pub height: u64,
    pub confirmations: i64,
}

/// `gettransaction` result fields used for classification.
#[derive(Debug, Clone, Deserialize)]
pub struct WalletTransaction {
    #[serde(default)]
    pub details: Vec<TransactionDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionDetail {
    #[serde(default)]
    pub address: Option<String>,
    pub category: String,
    #[serde(default)]
    pub amount: f64,
}

/// `validateaddress` / `getaddressinfo` ownership fields.
#[derive(Debug, Clone, Deserialize)]
pub struct AddressInfo {
    #[serde(default)]
    pub isvalid: Option<bool>,
    #[serde(default)]
    pub ismine: bool,
}
