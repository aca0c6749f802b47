//! Errors a plugin returns for one inbound frame.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::error;
use validator::{Validate, ValidationError, ValidationErrors};

use plexus_protocol::{Envelope, ErrorCode};

use crate::store::StoreError;

/// Failure of a single frame. The hub turns it into an error frame that
/// carries the originating sequence id.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload failed its schema checks. Field name to the rule it broke.
    #[error("validation error")]
    Validation(BTreeMap<String, String>),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Server(String),
}

impl FrameError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        FrameError::BadRequest(message.into())
    }

    pub fn server(message: impl Into<String>) -> Self {
        FrameError::Server(message.into())
    }

    pub fn unauthenticated() -> Self {
        FrameError::BadRequest("authentication required".to_string())
    }

    pub fn field(field: &str, tag: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), tag.to_string());
        FrameError::Validation(fields)
    }

    pub fn into_envelope(self, sequence_id: impl Into<String>) -> Envelope {
        match self {
            FrameError::Validation(fields) => Envelope::validation_error(sequence_id, fields),
            FrameError::BadRequest(message) => Envelope::error(sequence_id, ErrorCode::BadRequest, message),
            FrameError::Server(message) => Envelope::error(sequence_id, ErrorCode::ServerError, message),
        }
    }
}

impl From<ValidationErrors> for FrameError {
    fn from(errors: ValidationErrors) -> Self {
        let fields = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let tag = errs.first().map_or_else(|| "invalid".to_string(), |e| e.code.to_string());
                (field.to_string(), tag)
            })
            .collect();
        FrameError::Validation(fields)
    }
}

impl From<StoreError> for FrameError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) | StoreError::Forbidden(message) | StoreError::Invalid(message) => {
                FrameError::BadRequest(message)
            }
            other => {
                error!(error = %other, "store failure");
                FrameError::Server("internal server error".to_string())
            }
        }
    }
}

/// Validator rule for ids carried as decimal strings.
pub fn decimal_id(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("required"));
    }
    value
        .parse::<i64>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("number"))
}

pub fn decimal_ids(values: &[String]) -> Result<(), ValidationError> {
    values.iter().try_for_each(|value| decimal_id(value))
}

/// Parse an id that already passed validation.
pub fn parse_id(raw: &str, field: &str) -> Result<i64, FrameError> {
    raw.parse().map_err(|_| FrameError::field(field, "number"))
}

pub fn parse_ids(raw: &[String], field: &str) -> Result<Vec<i64>, FrameError> {
    raw.iter().map(|id| parse_id(id, field)).collect()
}

/// Decode and validate a frame payload.
pub fn parse_payload<T>(frame: &Envelope) -> Result<T, FrameError>
where
    T: DeserializeOwned + Validate,
{
    let params: T = frame
        .payload_as()
        .map_err(|_| FrameError::field("payload", "type"))?;
    params.validate()?;
    Ok(params)
}
