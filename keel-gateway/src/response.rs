//! Response envelopes.
//!
//! Success bodies are `{"data": …}`. Errors are
//! `{"errors": [{"message", "extensions": {"status", "httpError", "stack"}}]}`
//! with `stack` present only in development mode.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Serialize, Deserialize)]
pub struct DataResponse {
    pub data: JsonValue,
}

pub fn data_response(data: JsonValue) -> Response {
    (StatusCode::OK, Json(DataResponse { data })).into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorItem {
    pub message: String,
    pub extensions: ErrorExtensions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorExtensions {
    pub status: u16,
    #[serde(rename = "httpError")]
    pub http_error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Build the error envelope for `status`. `dev` attaches the stack field.
pub fn error_response(status: StatusCode, message: impl Into<String>, dev: bool) -> Response {
    let message = message.into();
    let body = ErrorResponse {
        errors: vec![ErrorItem {
            message: message.clone(),
            extensions: ErrorExtensions {
                status: status.as_u16(),
                http_error: status
                    .canonical_reason()
                    .unwrap_or("Unknown")
                    .to_string(),
                stack: dev.then(|| message),
            },
        }],
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_dev_only() {
        let body = ErrorResponse {
            errors: vec![ErrorItem {
                message: "no database available".into(),
                extensions: ErrorExtensions {
                    status: 500,
                    http_error: "Internal Server Error".into(),
                    stack: None,
                },
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["errors"][0]["extensions"].get("stack").is_none());
        assert_eq!(json["errors"][0]["extensions"]["httpError"], "Internal Server Error");
    }
}
