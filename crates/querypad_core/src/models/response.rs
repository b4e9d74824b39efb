//! Uniform result envelope returned across the UI boundary.

use serde::{Deserialize, Serialize};

use crate::error::QueryPadError;

/// `{success, data?, error?}` envelope.
///
/// Typed errors never cross the boundary; they are flattened to their display
/// message here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response<T> {
    /// Whether the operation succeeded
    pub success: bool,
    /// Payload on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Human-readable error message on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Response<T> {
    /// Successful response carrying data.
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    /// Failed response carrying a message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()) }
    }

    /// Check whether the response is a success.
    pub fn is_ok(&self) -> bool {
        self.success
    }
}

impl Response<()> {
    /// Successful response without data.
    pub fn done() -> Self {
        Self { success: true, data: None, error: None }
    }
}

impl<T> From<Result<T, QueryPadError>> for Response<T> {
    fn from(result: Result<T, QueryPadError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failure(err.to_string()),
        }
    }
}

/// Envelope for operations that only report success.
pub fn unit_response(result: Result<(), QueryPadError>) -> Response<()> {
    match result {
        Ok(()) => Response::done(),
        Err(err) => Response::failure(err.to_string()),
    }
}
