//! Validation of user-submitted target URLs
//!
//! Workloads fetch the submitted URL from inside the cluster, so anything
//! that could reach cluster-internal services is refused.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

const FORBIDDEN_HOSTS: &[&str] = &["localhost", "localhost.", "local", "broadcasthost"];

const FORBIDDEN_SUFFIXES: &[&str] = &[".local", ".localhost", ".internal"];

/// Check that a target URL is absolute http(s) and points at a public host.
pub fn is_valid_target_url(raw: &str) -> bool {
    if raw.is_empty() || raw.chars().any(char::is_whitespace) {
        return false;
    }

    let Ok(url) = Url::parse(raw) else {
        return false;
    };

    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return false;
    }

    // The WHATWG parser reads "https:///path" as host "path"; insist the
    // authority is actually present in the raw input.
    match raw.split_once("://") {
        Some((_, rest)) if !rest.is_empty() && !rest.starts_with('/') => {}
        _ => return false,
    }

    match url.host() {
        Some(Host::Ipv4(ip)) => !is_forbidden_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => !is_forbidden_ip(IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => is_allowed_domain(domain),
        None => false,
    }
}

fn is_allowed_domain(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    if domain.is_empty() || FORBIDDEN_HOSTS.contains(&domain.as_str()) {
        return false;
    }

    let trimmed = domain.trim_end_matches('.');
    !FORBIDDEN_SUFFIXES
        .iter()
        .any(|suffix| trimmed.ends_with(suffix))
}

/// Loopback, private, link-local, multicast, unspecified and reserved ranges
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_ipv4(v4),
        IpAddr::V6(v6) => match embedded_ipv4(v6) {
            Some(v4) => is_forbidden_ipv4(v4),
            None => is_forbidden_ipv6(v6),
        },
    }
}

/// IPv4 address carried by a v4-mapped, v4-compatible or NAT64 (64:ff9b::/96) address
fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let segments = ip.segments();
    let tail = Ipv4Addr::from((u32::from(segments[6]) << 16) | u32::from(segments[7]));
    match segments {
        [0, 0, 0, 0, 0, 0, _, _] | [0x64, 0xff9b, 0, 0, 0, 0, _, _] => Some(tail),
        _ => None,
    }
}

fn is_forbidden_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || a == 0 // 0.0.0.0/8
        || a >= 240 // 240.0.0.0/4
        || (a == 100 && (b & 0xc0) == 64) // 100.64.0.0/10 carrier-grade NAT
        || (a == 192 && b == 0 && c == 0) // 192.0.0.0/24 protocol assignments
        || (a == 198 && (b & 0xfe) == 18) // 198.18.0.0/15 benchmarking
}

fn is_forbidden_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00 // fc00::/7 unique local
        || (first & 0xffc0) == 0xfe80 // fe80::/10 link-local
}
