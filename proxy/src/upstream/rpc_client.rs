/// Daemon JSON-RPC client
///
/// Two calls only: `get_block_template` and `submit_block`, over plain HTTP
/// POST with a per-request timeout.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::address::Identity;
use crate::metrics::prometheus as metrics;
use crate::session::SessionId;
use crate::work::BlockTemplate;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC connection failed: {0}")]
    Transport(String),
    #[error("RPC request timeout")]
    Timeout,
    #[error("RPC HTTP error: {0}")]
    Http(u16),
    #[error("RPC decode error: {0}")]
    Decode(String),
    #[error("RPC error: {0}")]
    Application(String),
}

/// A locally validated share on its way to the daemon.
#[derive(Debug, Clone)]
pub struct ShareSubmission {
    pub session_id: SessionId,
    pub seq: u64,
    pub height: u64,
    /// Hashing blob with the upstream nonce filled in (hex)
    pub blob: String,
    pub nonce: u32,
    pub identity: Identity,
    /// Miner-reported hash, passed through when present
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

/// The daemon as seen by the upstream client.
pub trait DaemonClient: Send + Sync + 'static {
    fn get_block_template(
        &self,
        identity: &Identity,
    ) -> impl Future<Output = Result<BlockTemplate>> + Send;

    /// `Err` only for transport failures; daemon verdicts are `Ok`.
    fn submit_share(
        &self,
        share: &ShareSubmission,
    ) -> impl Future<Output = Result<SubmitOutcome>> + Send;
}

pub struct JsonRpcDaemon {
    base_url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl JsonRpcDaemon {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Self {
        let base_url = base_url.into();
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!("Daemon RPC client initialized: {}", base_url);

        Self {
            base_url,
            timeout: timeout.unwrap_or(DEFAULT_RPC_TIMEOUT),
            client,
        }
    }

    /// Make a JSON-RPC call to the daemon
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        metrics::inc_rpc_requests();
        let res = self.call_inner(method, params).await;
        if res.is_err() {
            metrics::inc_rpc_errors();
        }
        res
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        };

        let body_bytes = serde_json::to_vec(&payload).map_err(|e| RpcError::Decode(e.to_string()))?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.base_url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| RpcError::Timeout)?
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Http(status.as_u16()));
        }

        let body = tokio::time::timeout(self.timeout, response.into_body().collect())
            .await
            .map_err(|_| RpcError::Timeout)?
            .map_err(|e| RpcError::Transport(e.to_string()))?
            .to_bytes();
        let rpc_response: RpcResponse =
            serde_json::from_reader(body.reader()).map_err(|e| RpcError::Decode(e.to_string()))?;

        if let Some(error) = rpc_response.error {
            return Err(RpcError::Application(error_message(&error)));
        }

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }
}

impl DaemonClient for JsonRpcDaemon {
    async fn get_block_template(&self, identity: &Identity) -> Result<BlockTemplate> {
        let params = json!({
            "wallet_address": identity.wallet,
            "worker": identity.worker.clone().unwrap_or_default(),
        });
        let value = self.call("get_block_template", params).await?;
        BlockTemplate::from_rpc_response(&value)
    }

    async fn submit_share(&self, share: &ShareSubmission) -> Result<SubmitOutcome> {
        let mut params = vec![
            json!(share.blob),
            json!(share.nonce),
            json!(share.identity.wallet),
        ];
        if let Some(result) = &share.result {
            params.push(json!(result));
        }

        match self.call("submit_block", Value::Array(params)).await {
            Ok(result) => Ok(parse_submit_result(&result)),
            Err(RpcError::Application(reason)) => Ok(SubmitOutcome::Rejected(reason)),
            Err(e) => Err(e.into()),
        }
    }
}

/// `true`, `{"accepted": bool}` or `{"status": "accepted" | "ok" | ...}`.
pub fn parse_submit_result(result: &Value) -> SubmitOutcome {
    let accepted = if let Some(b) = result.as_bool() {
        b
    } else if let Some(obj) = result.as_object() {
        obj.get("accepted")
            .and_then(|v| v.as_bool())
            .or_else(|| {
                obj.get("status")
                    .and_then(|s| s.as_str())
                    .map(|s| s.eq_ignore_ascii_case("accepted") || s.eq_ignore_ascii_case("ok"))
            })
            .unwrap_or(false)
    } else {
        false
    };

    if accepted {
        SubmitOutcome::Accepted
    } else {
        let reason = result
            .get("reason")
            .or_else(|| result.get("status"))
            .and_then(|v| v.as_str())
            .unwrap_or("rejected by daemon")
            .to_string();
        SubmitOutcome::Rejected(reason)
    }
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submit_result() {
        assert_eq!(parse_submit_result(&json!(true)), SubmitOutcome::Accepted);
        assert_eq!(parse_submit_result(&json!({"accepted": true})), SubmitOutcome::Accepted);
        assert_eq!(parse_submit_result(&json!({"status": "OK"})), SubmitOutcome::Accepted);
        assert_eq!(
            parse_submit_result(&json!({"status": "low difficulty"})),
            SubmitOutcome::Rejected("low difficulty".into())
        );
        assert_eq!(
            parse_submit_result(&json!(false)),
            SubmitOutcome::Rejected("rejected by daemon".into())
        );
    }

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(&json!({"code": -7, "message": "stale"})), "stale");
        assert_eq!(error_message(&json!("boom")), "\"boom\"");
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_transport_error() {
        // Nothing listens on port 9 of the loopback in test environments.
        let daemon = JsonRpcDaemon::new("http://127.0.0.1:9/json_rpc", Some(Duration::from_secs(2)));
        let err = daemon.call("get_block_template", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_) | RpcError::Timeout));
    }
}
