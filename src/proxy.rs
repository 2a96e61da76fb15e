use crate::api::ControlPlane;
use crate::error::{json_error_response, GatewayErrorCode, ProxyError};
use crate::router::{extract_hostname, RouteMatch, VirtualHostRouter};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Job the request was routed to
pub const X_ORIGINAL_SUBDOMAIN: &str = "x-original-subdomain";
/// Host header as the client sent it
pub const X_ORIGINAL_HOST: &str = "x-original-host";

/// Connection-scoped headers that must not cross the proxy
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The gateway's single HTTP listener: control plane and data plane
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<VirtualHostRouter>,
    control_plane: Arc<ControlPlane>,
    request_timeout: Duration,
    drain_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<VirtualHostRouter>,
        control_plane: Arc<ControlPlane>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            control_plane,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            shutdown_rx,
        }
    }

    /// Bound on connecting to a workload and receiving its response headers
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How long open connections may finish after shutdown is signalled
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown, then drain.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            api_host = self.router.api_host(),
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let gateway = Arc::new(Gateway {
            router: Arc::clone(&self.router),
            control_plane: Arc::clone(&self.control_plane),
            request_timeout: self.request_timeout,
        });

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .preserve_header_case(true)
            .http2()
            .max_concurrent_streams(250);

        let graceful = GracefulShutdown::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&gateway);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let gateway = Arc::clone(&gateway);
                                async move { gateway.handle(req, addr).await }
                            });

                            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                            let conn = graceful.watch(conn.into_owned());

                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.wait_for(|&stop| stop) => {
                    info!("Gateway shutting down, draining connections");
                    break;
                }
            }
        }

        drop(listener);

        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections drained");
            }
            _ = tokio::time::sleep(self.drain_timeout) => {
                warn!(
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Drain deadline reached, closing remaining connections"
                );
            }
        }

        Ok(())
    }
}

/// Per-connection view of the server state
struct Gateway {
    router: Arc<VirtualHostRouter>,
    control_plane: Arc<ControlPlane>,
    request_timeout: Duration,
}

impl Gateway {
    async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let hostname = extract_hostname(&req);

        match self.router.classify(hostname.as_deref()) {
            RouteMatch::ControlPlane => Ok(self.control_plane.handle(req).await),
            RouteMatch::Job { job_id, port } => {
                debug!(
                    job_id,
                    port,
                    method = %req.method(),
                    uri = %req.uri(),
                    "Proxying request"
                );
                let proxy = ReverseProxy::new(job_id, port, self.request_timeout);
                Ok(proxy.forward(req, client_addr).await)
            }
            RouteMatch::Unmatched => {
                debug!(
                    host = hostname.as_deref().unwrap_or("-"),
                    "No route for host"
                );
                Ok(json_error_response(GatewayErrorCode::NotFound, "Not found"))
            }
        }
    }
}

/// Single-use proxy to one job's workload on loopback.
///
/// Built for one request and dropped with it; the port behind a job id can
/// change when the job is recreated.
#[derive(Debug)]
pub struct ReverseProxy {
    job_id: String,
    target: SocketAddr,
    timeout: Duration,
}

impl ReverseProxy {
    pub fn new(job_id: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            job_id: job_id.into(),
            target: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            timeout,
        }
    }

    /// Forward `req` to the workload. Any failure becomes a 503.
    pub async fn forward<B>(
        self,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.try_forward(req, client_addr).await {
            Ok(response) => response,
            Err(e) => {
                // Details stay in the log, the client only learns the service is unavailable
                warn!(job_id = %self.job_id, target = %self.target, error = %e, "Proxy error");
                json_error_response(GatewayErrorCode::ServiceUnavailable, "Service unavailable")
            }
        }
    }

    async fn try_forward<B>(
        &self,
        mut req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let client_upgrade = is_upgrade_request(&req).then(|| hyper::upgrade::on(&mut req));

        self.prepare_request(&mut req, client_addr, &request_id)?;

        let mut response = tokio::time::timeout(self.timeout, self.send(req))
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))??;

        if let Some(client_upgrade) = client_upgrade {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                info!(job_id = %self.job_id, request_id, "Upgrade accepted by backend");
                tokio::spawn(tunnel(
                    client_upgrade,
                    backend_upgrade,
                    self.job_id.clone(),
                    request_id,
                ));
                return Ok(response.map(|_| Empty::<Bytes>::new().map_err(|never| match never {}).boxed()));
            }
        }

        strip_hop_by_hop(response.headers_mut());
        Ok(response.map(|body| body.boxed()))
    }

    /// Rewrite the inbound request for the workload: origin-form URI over
    /// HTTP/1.1, hop-by-hop headers gone, provenance and forwarding headers set.
    /// Client-supplied values for any of those headers are overwritten.
    fn prepare_request<B>(
        &self,
        req: &mut Request<B>,
        client_addr: SocketAddr,
        request_id: &str,
    ) -> Result<(), ProxyError> {
        let original_host = req
            .headers()
            .get(HOST)
            .cloned()
            .or_else(|| {
                req.uri()
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = path
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::InvalidRequest(e.to_string()))?;
        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;

        let upgrade = if is_upgrade_request(req) {
            req.headers().get(UPGRADE).cloned()
        } else {
            None
        };

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);

        if let Some(protocol) = upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(UPGRADE, protocol);
        }

        if let Some(host) = original_host {
            headers.insert(HOST, host.clone());
            headers.insert(X_FORWARDED_HOST, host.clone());
            headers.insert(X_ORIGINAL_HOST, host);
        } else {
            headers.remove(X_FORWARDED_HOST);
            headers.remove(X_ORIGINAL_HOST);
        }

        if let Ok(value) = HeaderValue::from_str(&self.job_id) {
            headers.insert(X_ORIGINAL_SUBDOMAIN, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }

        Ok(())
    }

    async fn send<B>(&self, req: Request<B>) -> Result<Response<Incoming>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = TcpStream::connect(self.target)
            .await
            .map_err(|source| ProxyError::Connect {
                addr: self.target,
                source,
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ProxyError::Handshake)?;

        let job_id = self.job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(job_id, error = %e, "Backend connection closed with error");
            }
        });

        sender.send_request(req).await.map_err(ProxyError::Forward)
    }
}

/// Check if a request is an HTTP upgrade request (WebSocket and friends)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    has_upgrade_connection && req.headers().contains_key(UPGRADE)
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Copy bytes both ways between the upgraded client and backend connections
async fn tunnel(client: OnUpgrade, backend: OnUpgrade, job_id: String, request_id: String) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            error!(job_id, request_id, error = %e, "Connection upgrade failed");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                job_id,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(job_id, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn client_addr() -> SocketAddr {
        "203.0.113.7:51000".parse().unwrap()
    }

    fn proxy(port: u16) -> ReverseProxy {
        ReverseProxy::new("my-app-1234", port, Duration::from_secs(5))
    }

    #[test]
    fn test_proxy_targets_loopback() {
        assert_eq!(
            proxy(31050).target,
            "127.0.0.1:31050".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_prepare_request_sets_provenance_headers() {
        let mut req = Request::builder()
            .uri("/page?x=1")
            .header(HOST, "my-app-1234.example.com")
            .header(X_ORIGINAL_SUBDOMAIN, "spoofed")
            .header(X_ORIGINAL_HOST, "spoofed.example.com")
            .header(X_FORWARDED_FOR, "10.0.0.1")
            .body(())
            .unwrap();

        proxy(1)
            .prepare_request(&mut req, client_addr(), "req-1")
            .unwrap();

        let headers = req.headers();
        assert_eq!(req.uri(), "/page?x=1");
        assert_eq!(headers.get(X_ORIGINAL_SUBDOMAIN).unwrap(), "my-app-1234");
        assert_eq!(headers.get(X_ORIGINAL_HOST).unwrap(), "my-app-1234.example.com");
        assert_eq!(headers.get(HOST).unwrap(), "my-app-1234.example.com");
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "my-app-1234.example.com");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-1");
    }

    #[test]
    fn test_prepare_request_uses_authority_without_host_header() {
        let mut req = Request::builder()
            .uri("http://my-app-1234.example.com/a")
            .version(Version::HTTP_2)
            .body(())
            .unwrap();

        proxy(1)
            .prepare_request(&mut req, client_addr(), "req-1")
            .unwrap();

        assert_eq!(req.uri(), "/a");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(req.headers().get(HOST).unwrap(), "my-app-1234.example.com");
        assert_eq!(
            req.headers().get(X_ORIGINAL_HOST).unwrap(),
            "my-app-1234.example.com"
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_upgrade_headers_survive_preparation() {
        let mut req = Request::builder()
            .uri("/ws")
            .header(HOST, "my-app-1234.example.com")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();

        assert!(is_upgrade_request(&req));
        proxy(1)
            .prepare_request(&mut req, client_addr(), "req-1")
            .unwrap();

        assert_eq!(req.headers().get(CONNECTION).unwrap(), "upgrade");
        assert_eq!(req.headers().get(UPGRADE).unwrap(), "websocket");
    }

    #[test]
    fn test_is_upgrade_request_requires_both_headers() {
        let req = Request::builder()
            .header(CONNECTION, "upgrade")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));

        let req = Request::builder()
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    fn get(host: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri("/")
            .header(HOST, host)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_refused_connection_is_service_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let response = proxy(port)
            .forward(get("my-app-1234.example.com"), client_addr())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(crate::error::X_GATEWAY_ERROR).unwrap(),
            "service_unavailable"
        );
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let backend = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let response = ReverseProxy::new("slow", port, Duration::from_millis(100))
            .forward(get("slow.example.com"), client_addr())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        backend.abort();
    }

    #[tokio::test]
    async fn test_forwards_to_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let backend = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 5\r\nKeep-Alive: timeout=5\r\n\r\nhello")
                .await
                .unwrap();
            request
        });

        let response = proxy(port)
            .forward(get("my-app-1234.example.com"), client_addr())
            .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("keep-alive").is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        let request = backend.await.unwrap().to_lowercase();
        assert!(request.starts_with("get / http/1.1\r\n"));
        assert!(request.contains("x-original-subdomain: my-app-1234\r\n"));
        assert!(request.contains("x-original-host: my-app-1234.example.com\r\n"));
    }
}
