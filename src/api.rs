//! Control-plane API, served on the configured API host
//!
//! Jobs are created with `PUT /services/{name}`, listed with `GET /services`
//! and purged with `DELETE /services/{job_id}`.

use crate::error::{json_error_response, GatewayErrorCode};
use crate::orchestrator::JobOrchestrator;
use crate::validation::is_valid_target_url;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const SERVICES_PATH: &str = "/services";
const SERVICES_PREFIX: &str = "/services/";
const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Body of `PUT /services/{name}`
#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub is_script: bool,
}

/// Successful creation: the public URL of the job
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateServiceResponse {
    pub url: String,
}

/// One entry of `GET /services`
#[derive(Debug, Serialize)]
pub struct ServiceSummary {
    pub job_id: String,
    pub port: u16,
    pub url: String,
}

pub struct ControlPlane {
    orchestrator: Arc<JobOrchestrator>,
    api_token: Option<String>,
    max_body_bytes: usize,
}

impl ControlPlane {
    /// Without a token every endpoint is open
    pub fn new(orchestrator: Arc<JobOrchestrator>, api_token: Option<String>) -> Self {
        Self {
            orchestrator,
            api_token: api_token.filter(|t| !t.is_empty()),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "Control-plane request");

        match (&method, path.as_str()) {
            // Health check (no auth required)
            (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),

            // Version (no auth required)
            (&Method::GET, "/version") => {
                let version_info = serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                });
                json_response(StatusCode::OK, version_info.to_string())
            }

            (&Method::GET, SERVICES_PATH) => match self.authorize(&req) {
                Ok(()) => self.list_services(),
                Err(response) => response,
            },

            (&Method::PUT, path) if path.starts_with(SERVICES_PREFIX) => {
                if let Err(response) = self.authorize(&req) {
                    return response;
                }
                let raw_name = &path[SERVICES_PREFIX.len()..];
                self.create_service(raw_name, req).await
            }

            (&Method::DELETE, path) if path.starts_with(SERVICES_PREFIX) => {
                if let Err(response) = self.authorize(&req) {
                    return response;
                }
                self.delete_service(&path[SERVICES_PREFIX.len()..]).await
            }

            _ => json_error_response(GatewayErrorCode::NotFound, "Not found"),
        }
    }

    fn authorize<B>(&self, req: &Request<B>) -> Result<(), Response<BoxBody<Bytes, hyper::Error>>> {
        let Some(expected) = self.api_token.as_deref() else {
            return Ok(());
        };

        if check_auth(req, expected) {
            Ok(())
        } else {
            warn!(path = req.uri().path(), "Unauthorized control-plane request");
            Err(json_error_response(
                GatewayErrorCode::Unauthorized,
                "Missing or invalid bearer token",
            ))
        }
    }

    async fn create_service<B>(&self, raw_name: &str, req: Request<B>) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body = match Limited::new(req.into_body(), self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "Failed to read request body");
                return json_error_response(GatewayErrorCode::InvalidJson, "Request body could not be read");
            }
        };

        let request: CreateServiceRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Invalid create request body");
                return json_error_response(GatewayErrorCode::InvalidJson, "Request body is not valid JSON");
            }
        };

        if !is_valid_target_url(&request.url) {
            warn!(url = %request.url, "Rejected target URL");
            return json_error_response(
                GatewayErrorCode::InvalidUrl,
                "URL must be http(s) and point to a public host",
            );
        }

        let Some(name) = decode_segment(raw_name) else {
            return json_error_response(GatewayErrorCode::InvalidName, "Service name must not be blank");
        };

        // The lifecycle runs on its own task so a dropped connection cannot
        // abandon a submitted job mid-poll
        let orchestrator = Arc::clone(&self.orchestrator);
        let job_name = name.clone();
        let creation = tokio::spawn(async move {
            orchestrator
                .create(&job_name, &request.url, request.is_script)
                .await
        });

        let created = match creation.await {
            Ok(created) => created,
            Err(e) => {
                error!(name, error = %e, "Service creation task failed");
                return json_error_response(GatewayErrorCode::FailedCreateJob, "Failed to create job");
            }
        };

        match created {
            Ok(created) => {
                info!(name, job_id = %created.job_id, url = %created.url, "Service created");
                let body = CreateServiceResponse { url: created.url };
                match serde_json::to_string(&body) {
                    Ok(json) => json_response(StatusCode::OK, json),
                    Err(e) => {
                        error!(error = %e, "Failed to encode response");
                        json_error_response(GatewayErrorCode::InternalError, "Internal error")
                    }
                }
            }
            Err(e) => {
                error!(name, error = %e, "Service creation failed");
                json_error_response(GatewayErrorCode::FailedCreateJob, "Failed to create job")
            }
        }
    }

    async fn delete_service(&self, raw_job_id: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        // Only jobs this gateway tracks can be purged through the API
        let Some(job_id) = decode_segment(raw_job_id).filter(|id| self.orchestrator.get_port(id).is_some()) else {
            return json_error_response(GatewayErrorCode::NotFound, "Not found");
        };

        match self.orchestrator.purge(&job_id).await {
            Ok(()) => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                .expect("valid response with StatusCode enum"),
            Err(e) => {
                error!(job_id, error = %e, "Service purge failed");
                json_error_response(GatewayErrorCode::FailedPurgeJob, "Failed to purge job")
            }
        }
    }

    fn list_services(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let services: Vec<ServiceSummary> = self
            .orchestrator
            .registry()
            .snapshot()
            .into_iter()
            .map(|(job_id, port)| ServiceSummary {
                url: self.orchestrator.public_url(&job_id),
                job_id,
                port,
            })
            .collect();

        let body = serde_json::json!({
            "count": services.len(),
            "services": services,
        });
        json_response(StatusCode::OK, body.to_string())
    }
}

/// Percent-decode one path segment. Blank names and nested paths are rejected.
fn decode_segment(raw: &str) -> Option<String> {
    if raw.contains('/') {
        return None;
    }
    let decoded = urlencoding::decode(raw).ok()?;
    if decoded.trim().is_empty() || decoded.contains('/') {
        return None;
    }
    Some(decoded.into_owned())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| constant_time_compare(token, expected_token))
        .unwrap_or(false)
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}
