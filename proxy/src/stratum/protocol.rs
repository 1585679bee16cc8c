/// Miner-facing JSON-RPC messages (XMRig dialect)
///
/// One JSON object per line. Requests carry an `id`; job pushes are
/// notifications with `method: "job"`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::work::Job;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// JSON-RPC version (usually "2.0")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    /// Request ID
    #[serde(default)]
    pub id: Value,

    /// Method name
    pub method: String,

    /// Method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    /// JSON-RPC version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    /// Request ID
    pub id: Value,

    /// Result (if success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (if failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StratumError>,
}

impl StratumResponse {
    /// Create success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create error response
    pub fn error(id: Value, error: StratumError) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumError {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl StratumError {
    /// Standard error codes
    pub const UNKNOWN: i32 = -1;
    pub const INVALID_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Job not found (unknown or stale)
    pub const JOB_NOT_FOUND: i32 = 21;

    /// Invalid share
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;

    /// Not authorized
    pub const UNAUTHORIZED: i32 = 24;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn invalid_method(method: &str) -> Self {
        Self::new(Self::INVALID_METHOD, format!("Unknown method: {}", method))
    }
}

/// `login` params
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginParams {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub rigid: Option<String>,
}

/// `submit` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitParams {
    #[serde(default)]
    pub id: Option<String>,
    pub job_id: String,
    pub nonce: String,
    #[serde(default)]
    pub result: Option<String>,
}

impl StratumRequest {
    pub fn login_params(&self) -> Option<LoginParams> {
        serde_json::from_value(self.params.clone()?).ok()
    }

    pub fn submit_params(&self) -> Result<SubmitParams, String> {
        let params = self.params.clone().ok_or_else(|| "missing params".to_string())?;
        serde_json::from_value(params).map_err(|e| e.to_string())
    }
}

/// Login result carrying the first job (if a template exists yet).
pub fn login_result(session_id: u64, job: Option<&Job>, nicehash: bool) -> Value {
    let mut result = json!({
        "id": session_id.to_string(),
        "job": job,
        "status": "OK",
    });
    if nicehash {
        result["extensions"] = json!(["nicehash"]);
    }
    result
}

/// Server-initiated job notification.
pub fn job_push(job: &Job) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "job",
        "params": job,
    })
}
