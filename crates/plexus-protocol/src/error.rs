//! Error payloads for `error:generic` and `error:validation` frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Machine-readable error class sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ServerError,
    BadRequest,
    Validation,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ServerError => "server_error",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Validation => "validation",
        }
    }
}

/// Payload of an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub error: String,

    /// Failing field name to the rule it broke. Only set for validation errors.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub validation_errors: BTreeMap<String, String>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            code,
            error: error.into(),
            validation_errors: BTreeMap::new(),
        }
    }

    pub fn validation(fields: BTreeMap<String, String>) -> Self {
        Self {
            code: ErrorCode::Validation,
            error: "validation error".to_string(),
            validation_errors: fields,
        }
    }
}
