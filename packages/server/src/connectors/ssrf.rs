//! SSRF guard for network connectors.
//!
//! Runs before any I/O: scheme check, blocked-host literals, private and
//! link-local address ranges, and an optional host allowlist with
//! `*.domain` wildcards.

use std::net::IpAddr;
use url::Url;

/// Hostnames that are never reachable through a connector.
const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "0.0.0.0",
    "169.254.169.254",
    "metadata.google.internal",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SsrfViolation {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("scheme {0:?} is not allowed")]
    SchemeNotAllowed(String),
    #[error("host {0:?} is blocked")]
    HostBlocked(String),
    #[error("host {0:?} resolves to a private or local address")]
    PrivateAddress(String),
    #[error("host {0:?} is not on the allowlist")]
    HostNotAllowed(String),
}

/// Validate a URL for outbound use. Returns the parsed URL on success.
pub async fn check_url(raw: &str, allowlist: Option<&[String]>) -> Result<Url, SsrfViolation> {
    let url = Url::parse(raw).map_err(|e| SsrfViolation::InvalidUrl(e.to_string()))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(SsrfViolation::SchemeNotAllowed(scheme.to_string()));
    }

    let host = url
        .host_str()
        .ok_or_else(|| SsrfViolation::InvalidUrl("missing host".to_string()))?
        .to_ascii_lowercase();

    if BLOCKED_HOSTS.contains(&host.as_str()) {
        return Err(SsrfViolation::HostBlocked(host));
    }

    let bare_host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare_host.parse::<IpAddr>() {
        if ip_is_local(ip) {
            return Err(SsrfViolation::PrivateAddress(host));
        }
        check_allowlist(&host, allowlist)?;
        return Ok(url);
    }

    check_allowlist(&host, allowlist)?;

    // resolve the name and reject anything landing in local ranges; an
    // unresolvable host is left for the request itself to fail
    let port = url.port_or_known_default().unwrap_or(443);
    if let Ok(addrs) = tokio::net::lookup_host((host.clone(), port)).await {
        for addr in addrs {
            if ip_is_local(addr.ip()) {
                return Err(SsrfViolation::PrivateAddress(host));
            }
        }
    }

    Ok(url)
}

fn check_allowlist(host: &str, allowlist: Option<&[String]>) -> Result<(), SsrfViolation> {
    let Some(allowlist) = allowlist else {
        return Ok(());
    };
    if allowlist.iter().any(|pattern| host_matches(pattern, host)) {
        Ok(())
    } else {
        Err(SsrfViolation::HostNotAllowed(host.to_string()))
    }
}

/// Exact match, or `*.domain` matching any subdomain of `domain`.
fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host.ends_with(&format!(".{suffix}")) || host == suffix
    } else {
        host == pattern
    }
}

fn ip_is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local
                || (segments[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique-local
                || (segments[0] & 0xfe00) == 0xfc00
        }
    }
}
