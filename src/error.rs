//! Error types and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Header carrying the wire error code on every error response
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes surfaced to HTTP clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorCode {
    /// Request body is not the expected JSON document
    InvalidJson,
    /// Submitted URL is malformed or targets a forbidden host
    InvalidUrl,
    /// Service name is blank
    InvalidName,
    /// Missing or wrong bearer token on the control plane
    Unauthorized,
    /// Unknown host, unknown job or unknown control-plane route
    NotFound,
    /// Job orchestration failed
    FailedCreateJob,
    /// Job deregistration failed
    FailedPurgeJob,
    /// Backend workload could not be reached
    ServiceUnavailable,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::InvalidJson
            | GatewayErrorCode::InvalidUrl
            | GatewayErrorCode::InvalidName => StatusCode::BAD_REQUEST,
            GatewayErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::FailedCreateJob
            | GatewayErrorCode::FailedPurgeJob
            | GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Wire representation, used in the body and the X-Gateway-Error header
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayErrorCode::InvalidJson => "invalid_json",
            GatewayErrorCode::InvalidUrl => "invalid_url",
            GatewayErrorCode::InvalidName => "invalid_name",
            GatewayErrorCode::Unauthorized => "unauthorized",
            GatewayErrorCode::NotFound => "not_found",
            GatewayErrorCode::FailedCreateJob => "failed_create_job",
            GatewayErrorCode::FailedPurgeJob => "failed_purge_job",
            GatewayErrorCode::ServiceUnavailable => "service_unavailable",
            GatewayErrorCode::InternalError => "internal_error",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(X_GATEWAY_ERROR, code.as_str())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Failure talking to the cluster scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler unreachable: {0}")]
    Transport(String),

    #[error("scheduler returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected scheduler response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SchedulerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SchedulerError::Decode(err.to_string())
        } else {
            SchedulerError::Transport(err.to_string())
        }
    }
}

/// Failure in the job lifecycle
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to submit job {job_id}: {source}")]
    Submit {
        job_id: String,
        #[source]
        source: SchedulerError,
    },

    #[error("job {job_id} reported no running allocation after {attempts} attempts")]
    ReadinessTimeout { job_id: String, attempts: u32 },

    #[error("creation of job {job_id} aborted by shutdown")]
    Cancelled { job_id: String },

    #[error("failed to deregister job {job_id}: {source}")]
    Purge {
        job_id: String,
        #[source]
        source: SchedulerError,
    },

    #[error("failed to purge {} job(s): {}", .0.len(), join_errors(.0))]
    Shutdown(Vec<OrchestratorError>),
}

fn join_errors(errors: &[OrchestratorError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure forwarding one request to a workload
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("backend handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("forwarding failed: {0}")]
    Forward(#[source] hyper::Error),

    #[error("backend did not respond within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("cannot build backend request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::InvalidJson.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayErrorCode::InvalidName.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayErrorCode::FailedCreateJob.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayErrorCode::ServiceUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(GatewayErrorCode::InvalidUrl, "url is not allowed");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"invalid_url\""));
        assert!(json.contains("\"message\":\"url is not allowed\""));
        assert!(json.contains("\"status\":400"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(GatewayErrorCode::ServiceUnavailable, "down");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get(X_GATEWAY_ERROR).unwrap(),
            "service_unavailable"
        );
    }

    #[test]
    fn test_shutdown_error_lists_every_failure() {
        let err = OrchestratorError::Shutdown(vec![
            OrchestratorError::Purge {
                job_id: "a".to_string(),
                source: SchedulerError::Transport("refused".to_string()),
            },
            OrchestratorError::Purge {
                job_id: "b".to_string(),
                source: SchedulerError::Api {
                    status: 500,
                    message: "boom".to_string(),
                },
            },
        ]);
        let text = err.to_string();

        assert!(text.starts_with("failed to purge 2 job(s)"));
        assert!(text.contains("job a"));
        assert!(text.contains("job b"));
        assert!(text.contains("500: boom"));
    }
}
