//! Host-based request classification
//!
//! Every inbound request is either for the control plane, for a live job
//! subdomain (`<job_id>.<domain>`), or for nothing we serve.

use crate::registry::RouteRegistry;
use hyper::Request;
use std::sync::Arc;

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    ControlPlane,
    Job { job_id: String, port: u16 },
    Unmatched,
}

pub struct VirtualHostRouter {
    api_host: String,
    /// `.<domain>`, matched as an anchored suffix
    domain_suffix: String,
    registry: Arc<RouteRegistry>,
}

impl VirtualHostRouter {
    pub fn new(
        domain: impl AsRef<str>,
        api_host: impl AsRef<str>,
        registry: Arc<RouteRegistry>,
    ) -> Self {
        Self {
            api_host: normalize(api_host.as_ref()),
            domain_suffix: format!(".{}", normalize(domain.as_ref())),
            registry,
        }
    }

    pub fn api_host(&self) -> &str {
        &self.api_host
    }

    /// Classify a request by its (already normalized) hostname.
    ///
    /// The control-plane host is checked first, so it is never proxied even
    /// when it also looks like a job subdomain.
    pub fn classify(&self, hostname: Option<&str>) -> RouteMatch {
        let Some(hostname) = hostname else {
            return RouteMatch::Unmatched;
        };

        if hostname == self.api_host {
            return RouteMatch::ControlPlane;
        }

        let Some(label) = self.job_label(hostname) else {
            return RouteMatch::Unmatched;
        };

        match self.registry.get(label) {
            Some(port) => RouteMatch::Job {
                job_id: label.to_string(),
                port,
            },
            None => RouteMatch::Unmatched,
        }
    }

    /// The single leading label of `<label>.<domain>`, if the host has that shape
    fn job_label<'a>(&self, hostname: &'a str) -> Option<&'a str> {
        let label = hostname.strip_suffix(self.domain_suffix.as_str())?;
        if label.is_empty() || label.contains('.') {
            return None;
        }
        Some(label)
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// The request's hostname: Host header, or URI authority for HTTP/2.
///
/// Port is stripped and the result lower-cased. Hosts that are too long or
/// carry characters outside `[A-Za-z0-9.-]` are treated as absent.
pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let hostname = raw.rsplit_once('@').map_or(raw, |(_, h)| h);
    let hostname = hostname.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Rejects anything that could smuggle control characters into logs
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> VirtualHostRouter {
        let registry = Arc::new(RouteRegistry::new());
        registry.put("my-app-1234", 31050);
        registry.put("api", 31999);
        VirtualHostRouter::new("apps.example.com", "api.apps.example.com", registry)
    }

    fn request(host: &str) -> Request<()> {
        Request::builder()
            .uri("/")
            .header(hyper::header::HOST, host)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_control_plane_never_proxied() {
        // "api" is also a registered job id, but the control plane wins
        assert_eq!(
            router().classify(Some("api.apps.example.com")),
            RouteMatch::ControlPlane
        );
    }

    #[test]
    fn test_registered_job() {
        assert_eq!(
            router().classify(Some("my-app-1234.apps.example.com")),
            RouteMatch::Job {
                job_id: "my-app-1234".to_string(),
                port: 31050
            }
        );
    }

    #[test]
    fn test_unknown_job_is_unmatched() {
        assert_eq!(
            router().classify(Some("unknown-job.apps.example.com")),
            RouteMatch::Unmatched
        );
    }

    #[test]
    fn test_subdomain_match_is_anchored() {
        let router = router();
        for host in [
            "apps.example.com",
            ".apps.example.com",
            "a.my-app-1234.apps.example.com",
            "my-app-1234.apps.example.com.evil.net",
            "my-app-1234xapps.example.com",
            "other.example.com",
        ] {
            assert_eq!(router.classify(Some(host)), RouteMatch::Unmatched, "{}", host);
        }
        assert_eq!(router.classify(None), RouteMatch::Unmatched);
    }

    #[test]
    fn test_router_normalizes_configured_hosts() {
        let registry = Arc::new(RouteRegistry::new());
        registry.put("job", 1);
        let router = VirtualHostRouter::new("Apps.Example.COM.", " API.apps.example.com", registry);

        assert_eq!(router.api_host(), "api.apps.example.com");
        assert_eq!(
            router.classify(Some("job.apps.example.com")),
            RouteMatch::Job {
                job_id: "job".to_string(),
                port: 1
            }
        );
    }

    #[test]
    fn test_extract_hostname_strips_port_and_lowercases() {
        assert_eq!(
            extract_hostname(&request("My-App.Example.com:8080")),
            Some("my-app.example.com".to_string())
        );
    }

    #[test]
    fn test_extract_hostname_from_authority() {
        let req = Request::builder()
            .uri("http://job.example.com:80/path")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&req), Some("job.example.com".to_string()));
    }

    #[test]
    fn test_extract_hostname_rejects_bad_input() {
        assert_eq!(extract_hostname(&request("bad host.com")), None);
        assert_eq!(extract_hostname(&request("under_score.com")), None);
        assert_eq!(extract_hostname(&request(&"a".repeat(254))), None);
        assert_eq!(extract_hostname(&request(":8080")), None);

        let missing = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(extract_hostname(&missing), None);
    }
}
