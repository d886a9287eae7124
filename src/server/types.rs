//! Request and response types exchanged with the transport layer.

use crate::database::{
    BatchRequest, DeleteRequest, InsertRequest, PoolStatus, QueryRequest, QueryResult,
    UpdateRequest,
};
use crate::error::{DatabaseError, GatewayError, Result, ValidationCode, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// One gateway operation with its decoded body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", content = "body", rename_all = "snake_case")]
pub enum Operation {
    Query(QueryRequest),
    Batch(BatchRequest),
    Transaction(BatchRequest),
    Insert(InsertRequest),
    Update(UpdateRequest),
    Delete(DeleteRequest),
}

impl Operation {
    /// Decode a JSON body for the named operation.
    pub fn from_json(name: &str, body: Value) -> Result<Self> {
        let operation = match name {
            "query" => Self::Query(serde_json::from_value(body)?),
            "batch" => Self::Batch(serde_json::from_value(body)?),
            "transaction" => Self::Transaction(serde_json::from_value(body)?),
            "insert" => Self::Insert(serde_json::from_value(body)?),
            "update" => Self::Update(serde_json::from_value(body)?),
            "delete" => Self::Delete(serde_json::from_value(body)?),
            other => {
                return Err(ValidationError::new(
                    ValidationCode::UnknownOperation,
                    format!("Unknown operation '{}'", other),
                )
                .into());
            }
        };
        Ok(operation)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Batch(_) => "batch",
            Self::Transaction(_) => "transaction",
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }

    /// Raw statements carried by the request, if any.
    pub fn statements(&self) -> &[QueryRequest] {
        match self {
            Self::Query(request) => std::slice::from_ref(request),
            Self::Batch(batch) | Self::Transaction(batch) => &batch.queries,
            Self::Insert(_) | Self::Update(_) | Self::Delete(_) => &[],
        }
    }
}

/// An inbound call as seen by the gateway core.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub peer: Option<SocketAddr>,
    pub headers: HashMap<String, String>,
    pub operation: Operation,
}

impl GatewayRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            peer: None,
            headers: HashMap::new(),
            operation,
        }
    }

    pub fn peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    Single(QueryResult),
    Many(Vec<QueryResult>),
}

/// Client-facing error. Never carries driver text.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<usize>,
}

impl ErrorBody {
    pub fn from_error(err: &GatewayError, retry_after: Option<Duration>) -> Self {
        let (failed_index, completed) = match err {
            GatewayError::Database(DatabaseError::BatchAborted {
                index, completed, ..
            }) => (Some(*index), Some(*completed)),
            _ => (None, None),
        };
        Self {
            kind: err.kind().as_str(),
            code: err.code(),
            message: err.public_message(),
            retry_after_secs: retry_after
                .or_else(|| err.retry_after())
                .map(|d| (d.as_millis() as u64).div_ceil(1000).max(1)),
            failed_index,
            completed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Transport headers, e.g. rate-limit metadata.
    #[serde(skip)]
    pub headers: Vec<(&'static str, String)>,
}

impl GatewayResponse {
    pub fn ok(data: ResponseData, headers: Vec<(&'static str, String)>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            headers,
        }
    }

    pub fn error(error: ErrorBody, headers: Vec<(&'static str, String)>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn error_code(&self) -> Option<&'static str> {
        self.error.as_ref().map(|e| e.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub database: bool,
    pub rate_limit_store: &'static str,
    pub pool: PoolStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_from_json() {
        let op = Operation::from_json(
            "query",
            json!({"sql": "SELECT * FROM users WHERE id = $1", "params": [7], "timeout": 500}),
        )
        .unwrap();
        match &op {
            Operation::Query(q) => {
                assert_eq!(q.params.len(), 1);
                assert_eq!(q.timeout(), Some(Duration::from_millis(500)));
            }
            other => panic!("unexpected operation {:?}", other),
        }
        assert_eq!(op.statements().len(), 1);

        let op = Operation::from_json(
            "transaction",
            json!({"queries": [{"sql": "SELECT 1"}, {"sql": "SELECT 2"}]}),
        )
        .unwrap();
        assert_eq!(op.name(), "transaction");
        assert_eq!(op.statements().len(), 2);

        let op = Operation::from_json(
            "update",
            json!({"table": "users", "data": {"name": "x"}, "where": {"id": 1}, "returning": true}),
        )
        .unwrap();
        assert!(op.statements().is_empty());
    }

    #[test]
    fn test_operation_rejects_unknown_and_malformed() {
        let err = Operation::from_json("drop", json!({})).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_OPERATION");

        let err = Operation::from_json("query", json!({"params": []})).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST_BODY");
    }

    #[test]
    fn test_error_body_for_aborted_batch() {
        let err: GatewayError = DatabaseError::BatchAborted {
            index: 2,
            completed: 2,
            source: Box::new(DatabaseError::QueryFailed {
                sqlstate: Some("42601".into()),
                message: "syntax error at or near \"SELEC\"".into(),
            }),
        }
        .into();
        let body = ErrorBody::from_error(&err, None);
        assert_eq!(body.code, "BATCH_ABORTED");
        assert_eq!(body.kind, "internal");
        assert_eq!(body.failed_index, Some(2));
        assert_eq!(body.completed, Some(2));
        assert!(!body.message.contains("SELEC"));
    }
}
