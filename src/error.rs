//! Error taxonomy and JSON error responses for the front door

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Failure to launch the backend process. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("backend command is empty")]
    EmptyCommand,

    #[error("cannot parse backend command line: {0}")]
    InvalidCommandLine(#[from] shell_words::ParseError),

    #[error("backend executable not found: {command}")]
    CommandNotFound { command: String },

    #[error("invalid working directory: {path}")]
    InvalidWorkingDir { path: String },

    #[error("supervisor has been stopped")]
    SupervisorStopped,

    #[error("failed to spawn backend: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while forwarding a single request upstream
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),

    #[error("no response from backend within {} ms", .0.as_millis())]
    Timeout(Duration),
}

impl ForwardError {
    /// The error and all of its sources, joined with `": "`
    pub fn details(&self) -> String {
        let mut details = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let text = cause.to_string();
            if !details.contains(&text) {
                details.push_str(": ");
                details.push_str(&text);
            }
            source = cause.source();
        }
        details
    }
}

/// Error codes for locally synthesized responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Backend is not ready or forwarding failed
    BackendUnavailable,
    /// Method is not on the allow-list
    MethodNotAllowed,
    /// Request body exceeds the configured limit
    PayloadTooLarge,
    /// Request body could not be read
    BadRequest,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Value of the `error` field in the JSON body
    pub fn message(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendUnavailable => "backend unavailable",
            ProxyErrorCode::MethodNotAllowed => "method not allowed",
            ProxyErrorCode::PayloadTooLarge => "payload too large",
            ProxyErrorCode::BadRequest => "bad request",
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, details: Option<String>) -> Self {
        Self {
            error: code.message(),
            details,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"error":"{}"}}"#, self.error))
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    details: Option<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, details).to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::BackendUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            ProxyErrorCode::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(ProxyErrorCode::BadRequest.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_body_without_details() {
        let json = ErrorResponse::new(ProxyErrorCode::BackendUnavailable, None).to_json();
        assert_eq!(json, r#"{"error":"backend unavailable"}"#);
    }

    #[test]
    fn test_error_body_with_details() {
        let json = ErrorResponse::new(
            ProxyErrorCode::BackendUnavailable,
            Some("connection refused \"quoted\"".to_string()),
        )
        .to_json();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["error"], "backend unavailable");
        assert_eq!(value["details"], "connection refused \"quoted\"");
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::MethodNotAllowed, None);

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "METHOD_NOT_ALLOWED"
        );
    }

    #[test]
    fn test_forward_timeout_details() {
        let err = ForwardError::Timeout(Duration::from_secs(2));
        assert_eq!(err.details(), "no response from backend within 2000 ms");
    }

    #[test]
    fn test_spawn_error_messages() {
        let err = SpawnError::CommandNotFound {
            command: "nodee".to_string(),
        };
        assert_eq!(err.to_string(), "backend executable not found: nodee");

        let err = SpawnError::InvalidWorkingDir {
            path: "/nope".to_string(),
        };
        assert!(err.to_string().contains("/nope"));
    }
}
