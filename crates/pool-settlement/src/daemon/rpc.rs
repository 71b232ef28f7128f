use super::{CoinDaemon, DaemonError, RpcCall, RpcErrorObject, RpcReply};
use crate::config::DaemonConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC 1.0 request structure
#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    method: &'a str,
    params: &'a [Value],
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

impl From<JsonRpcResponse> for RpcReply {
    fn from(response: JsonRpcResponse) -> Self {
        RpcReply {
            result: response.result,
            error: response.error,
        }
    }
}

/// HTTP JSON-RPC client for a bitcoind-style coin daemon.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
    request_id: Arc<AtomicU64>,
}

impl DaemonClient {
    pub fn new(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DaemonError::Unreachable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            request_id: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<String, DaemonError> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!("HTTP request to daemon at {} failed: {}", self.url, e);
                DaemonError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DaemonError::Unreachable(format!("Failed to read response: {e}")))?;

        // bitcoind answers RPC errors with HTTP 500 and a JSON body, so the
        // status only matters when the body is not JSON.
        if !status.is_success() && serde_json::from_str::<Value>(&text).is_err() {
            error!(
                "Error reaching daemon with status={:?}. Message={:?}",
                status.as_u16(),
                text
            );
            return Err(DaemonError::Http {
                status_code: status.as_u16(),
                message: text,
            });
        }

        Ok(text)
    }
}

#[async_trait]
impl CoinDaemon for DaemonClient {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<RpcReply, DaemonError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        debug!("Daemon call {} with params {:?}", method, params);

        let text = self
            .post(&JsonRpcRequest {
                method,
                params: &params,
                id,
            })
            .await?;

        let response: JsonRpcResponse = serde_json::from_str(&text)
            .map_err(|e| DaemonError::Parse(format!("{method}: {e}")))?;
        Ok(response.into())
    }

    async fn batch(&self, calls: Vec<RpcCall>) -> Result<Vec<RpcReply>, DaemonError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let first_id = self
            .request_id
            .fetch_add(calls.len() as u64, Ordering::SeqCst);
        let requests: Vec<JsonRpcRequest<'_>> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| JsonRpcRequest {
                method: &call.method,
                params: &call.params,
                id: first_id + i as u64,
            })
            .collect();

        let text = self.post(&requests).await?;
        let mut responses: Vec<JsonRpcResponse> =
            serde_json::from_str(&text).map_err(|e| DaemonError::Parse(format!("batch: {e}")))?;

        if responses.len() != calls.len() {
            return Err(DaemonError::BatchMismatch {
                expected: calls.len(),
                got: responses.len(),
            });
        }

        // Replies may arrive in any order; ids restore call order.
        responses.sort_by_key(|r| r.id.unwrap_or(u64::MAX));
        Ok(responses.into_iter().map(RpcReply::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{basic_auth, body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn config(url: String) -> DaemonConfig {
        DaemonConfig {
            url,
            user: "testuser".to_string(),
            password: "testpass".to_string(),
        }
    }

    #[tokio::test]
    async fn test_single_call() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .and(basic_auth("testuser", "testpass"))
            .and(body_json(json!({
                "method": "getbalance",
                "params": [],
                "id": 0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 12.5,
                "error": null,
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = DaemonClient::new(&config(mock_server.uri())).unwrap();
        let reply = client.call("getbalance", vec![]).await.unwrap();

        assert_eq!(reply.result, Some(json!(12.5)));
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_rpc_error_with_server_error_status() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "result": null,
                "error": {"code": -6, "message": "Insufficient funds"},
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = DaemonClient::new(&config(mock_server.uri())).unwrap();
        let reply = client
            .call("sendmany", vec![json!(""), json!({"addr": 1.0})])
            .await
            .unwrap();

        assert_eq!(reply.error_code(), Some(-6));
    }

    #[tokio::test]
    async fn test_non_json_error_is_http_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&mock_server)
            .await;

        let client = DaemonClient::new(&config(mock_server.uri())).unwrap();
        let result = client.call("getbalance", vec![]).await;

        assert!(matches!(
            result,
            Err(DaemonError::Http {
                status_code: 401,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_batch_restores_call_order() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_json(json!([
                {"method": "gettransaction", "params": ["aa"], "id": 0},
                {"method": "getaccount", "params": ["pooladdr"], "id": 1}
            ])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"result": "", "error": null, "id": 1},
                {"result": null, "error": {"code": -5, "message": "Invalid or non-wallet transaction id"}, "id": 0}
            ])))
            .mount(&mock_server)
            .await;

        let client = DaemonClient::new(&config(mock_server.uri())).unwrap();
        let replies = client
            .batch(vec![
                RpcCall::new("gettransaction", vec![json!("aa")]),
                RpcCall::new("getaccount", vec![json!("pooladdr")]),
            ])
            .await
            .unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].error_code(), Some(-5));
        assert_eq!(replies[1].result, Some(json!("")));
    }

    #[tokio::test]
    async fn test_unreachable_daemon() {
        let client = DaemonClient::new(&config("http://127.0.0.1:1".to_string())).unwrap();
        let result = client.call("getbalance", vec![]).await;
        assert!(matches!(result, Err(DaemonError::Unreachable(_))));
    }
}
