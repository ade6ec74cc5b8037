//! Query gateway: the symmetric read-side entry point.
//!
//! Accepts `{query_type, params}`, performs structural validation, looks
//! up a registered projection reader, and maps its state through a pure
//! response function. It never loads aggregates, never reads the event
//! store, and never runs business rules; any filtering beyond structure
//! belongs to the projection itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An untrusted query record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query_type: String,
    pub params: serde_json::Value,
}

/// The wire result: `{success, data | error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<QueryErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryErrorBody {
    pub kind: String,
    pub detail: String,
}

impl QueryResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(kind: &str, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(QueryErrorBody {
                kind: kind.to_string(),
                detail: detail.into(),
            }),
        }
    }
}

/// Failure of a registered query handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("{field}: {reason}")]
    Validation { field: String, reason: String },
    #[error("not found: {0}")]
    NotFound(String),
}

type QueryHandler = Box<dyn Fn(&serde_json::Value) -> Result<serde_json::Value, QueryError> + Send + Sync>;

/// Registry of named queries over projection snapshots.
#[derive(Default)]
pub struct QueryGateway {
    handlers: HashMap<String, QueryHandler>,
}

impl QueryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query. The handler receives the raw params and returns
    /// the response data; it must be pure over the projection snapshot it
    /// captured.
    pub fn register(
        &mut self,
        query_type: impl Into<String>,
        handler: impl Fn(&serde_json::Value) -> Result<serde_json::Value, QueryError> + Send + Sync + 'static,
    ) {
        self.handlers.insert(query_type.into(), Box::new(handler));
    }

    /// Handle one request. Never panics; all outcomes are values.
    pub fn handle(&self, request: &QueryRequest) -> QueryResult {
        if !request.params.is_object() {
            return QueryResult::err("validation_error", "params must be an object");
        }
        let Some(handler) = self.handlers.get(&request.query_type) else {
            return QueryResult::err("unknown_query_type", request.query_type.clone());
        };
        match handler(&request.params) {
            Ok(data) => QueryResult::ok(data),
            Err(QueryError::Validation { field, reason }) => {
                QueryResult::err("validation_error", format!("{field}: {reason}"))
            }
            Err(QueryError::NotFound(detail)) => QueryResult::err("not_found", detail),
        }
    }
}

/// Extract a required UUID param.
pub fn uuid_param(params: &serde_json::Value, field: &str) -> Result<Uuid, QueryError> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| QueryError::Validation {
            field: field.to_string(),
            reason: "missing or invalid UUID".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with_echo() -> QueryGateway {
        let mut gateway = QueryGateway::new();
        gateway.register("echo", |params| Ok(params.clone()));
        gateway.register("patient_lookup", |params| {
            let id = uuid_param(params, "patient_id")?;
            Err(QueryError::NotFound(id.to_string()))
        });
        gateway
    }

    #[test]
    fn registered_query_round_trips() {
        let gateway = gateway_with_echo();
        let result = gateway.handle(&QueryRequest {
            query_type: "echo".to_string(),
            params: serde_json::json!({ "a": 1 }),
        });
        assert!(result.success);
        assert_eq!(result.data, Some(serde_json::json!({ "a": 1 })));
    }

    #[test]
    fn unknown_query_type_reported() {
        let gateway = gateway_with_echo();
        let result = gateway.handle(&QueryRequest {
            query_type: "nope".to_string(),
            params: serde_json::json!({}),
        });
        assert!(!result.success);
        assert_eq!(result.error.expect("error").kind, "unknown_query_type");
    }

    #[test]
    fn non_object_params_rejected() {
        let gateway = gateway_with_echo();
        let result = gateway.handle(&QueryRequest {
            query_type: "echo".to_string(),
            params: serde_json::json!([1, 2, 3]),
        });
        assert!(!result.success);
        assert_eq!(result.error.expect("error").kind, "validation_error");
    }

    #[test]
    fn invalid_uuid_param_is_validation_error() {
        let gateway = gateway_with_echo();
        let result = gateway.handle(&QueryRequest {
            query_type: "patient_lookup".to_string(),
            params: serde_json::json!({ "patient_id": "nope" }),
        });
        assert_eq!(result.error.expect("error").kind, "validation_error");
    }

    #[test]
    fn not_found_maps_to_its_kind() {
        let gateway = gateway_with_echo();
        let result = gateway.handle(&QueryRequest {
            query_type: "patient_lookup".to_string(),
            params: serde_json::json!({ "patient_id": Uuid::new_v4().to_string() }),
        });
        assert_eq!(result.error.expect("error").kind, "not_found");
    }
}
