//! Origin policy and client address resolution for the upgrade request.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use axum::http::header::{HOST, ORIGIN};
use reqwest::Url;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// `host[:port]` of an origin URL, lowercased.
fn origin_authority(origin: &str) -> Option<String> {
    let url = Url::parse(origin).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

fn normalize(origin: &str) -> &str {
    origin.trim().trim_end_matches('/')
}

/// Whether a browser at `origin` may open a socket to this server.
///
/// The origin must name the request's own host or be listed in `allowed`.
/// Requests without an `Origin` header are only accepted from loopback peers.
pub fn origin_allowed(
    origin: Option<&str>,
    host: Option<&str>,
    allowed: &[String],
    peer_is_loopback: bool,
) -> bool {
    let Some(origin) = origin else {
        return peer_is_loopback;
    };
    if allowed
        .iter()
        .any(|a| normalize(a).eq_ignore_ascii_case(normalize(origin)))
    {
        return true;
    }
    match (origin_authority(origin), host) {
        (Some(authority), Some(host)) => authority == host.trim().to_ascii_lowercase(),
        _ => false,
    }
}

/// Check the upgrade request's headers against the origin policy.
pub fn request_origin_allowed(headers: &HeaderMap, peer: SocketAddr, allowed: &[String]) -> bool {
    let header = |name| headers.get(name).and_then(|v| v.to_str().ok());
    origin_allowed(
        header(ORIGIN),
        header(HOST),
        allowed,
        peer.ip().is_loopback(),
    )
}

/// The address sessions are bound to: the first `X-Forwarded-For` hop when
/// behind a trusted proxy, otherwise the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> IpAddr {
    if trust_proxy
        && let Some(ip) = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok())
    {
        return ip;
    }
    peer.ip()
}
