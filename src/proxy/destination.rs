//! Where an intercepted request is headed, and whether that is us.

use std::net::{IpAddr, SocketAddr};

use crate::config::ProxySettings;
use crate::normalize::message::ParsedMessage;

/// Origin named by the first request of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Destination {
    /// Host header first, then SNI. Without an explicit port the configured
    /// default for the scheme applies.
    pub fn from_request(
        request: &ParsedMessage,
        sni: Option<&str>,
        tls: bool,
        settings: &ProxySettings,
    ) -> Option<Self> {
        let default_port = if tls {
            settings.default_https_port
        } else {
            settings.default_http_port
        };
        let authority = request
            .header("host")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .or_else(|| absolute_form_authority(request.target()?))
            .or(sni)?;
        let (host, port) = split_authority(authority, default_port)?;
        Some(Self { host, port, tls })
    }
}

fn absolute_form_authority(target: &str) -> Option<&str> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let end = rest.find('/').unwrap_or(rest.len());
    Some(&rest[..end]).filter(|a| !a.is_empty())
}

/// `host`, `host:port`, `[v6]` or `[v6]:port`.
pub fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        let port = match rest[close + 1..].strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 literal.
        Some((host, _)) if host.contains(':') => Some((authority.to_string(), default_port)),
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

/// True when `target` is the proxy's own listening socket.
///
/// `accepted` is the local address of the connection being served, which
/// names a concrete interface even when the listener is bound to an
/// unspecified address. Such a listener also matches loopback on its port.
pub fn is_self(target: SocketAddr, listener: SocketAddr, accepted: SocketAddr) -> bool {
    if target == listener || target == accepted {
        return true;
    }
    if target.port() != listener.port() {
        return false;
    }
    (listener.ip().is_unspecified() && (target.ip().is_loopback() || target.ip().is_unspecified()))
        || target.ip() == listener.ip()
}

/// [`is_self`], extended for wildcard listeners to any address assigned to
/// a local interface.
pub async fn targets_proxy(target: SocketAddr, listener: SocketAddr, accepted: SocketAddr) -> bool {
    if is_self(target, listener, accepted) {
        return true;
    }
    listener.ip().is_unspecified() && target.port() == listener.port() && is_local_ip(target.ip()).await
}

/// An address can only be bound when it belongs to this host.
async fn is_local_ip(ip: IpAddr) -> bool {
    tokio::net::UdpSocket::bind(SocketAddr::new(ip, 0)).await.is_ok()
}

/// Fixed page answered to requests addressed to the proxy itself.
pub fn fallback_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::message::parse;

    fn settings() -> ProxySettings {
        ProxySettings::default()
    }

    #[test]
    fn host_header_wins_over_sni() {
        let request = parse(b"GET / HTTP/1.1\r\nHost: example.com:8443\r\n\r\n").unwrap();
        let dest = Destination::from_request(&request, Some("sni.test"), true, &settings()).unwrap();
        assert_eq!(dest.host, "example.com");
        assert_eq!(dest.port, 8443);
    }

    #[test]
    fn sni_and_default_port_without_host() {
        let request = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let dest = Destination::from_request(&request, Some("sni.test"), true, &settings()).unwrap();
        assert_eq!(dest, Destination { host: "sni.test".into(), port: 443, tls: true });
        assert!(Destination::from_request(&request, None, false, &settings()).is_none());
    }

    #[test]
    fn authority_forms() {
        assert_eq!(split_authority("a.test", 80), Some(("a.test".into(), 80)));
        assert_eq!(split_authority("[::1]:8080", 80), Some(("::1".into(), 8080)));
        assert_eq!(split_authority("[::1]", 443), Some(("::1".into(), 443)));
        assert_eq!(split_authority("::1", 80), Some(("::1".into(), 80)));
        assert_eq!(split_authority("a.test:nope", 80), None);
    }

    #[test]
    fn loop_guard_matches_own_address() {
        let local: SocketAddr = "127.0.0.1:8084".parse().unwrap();
        assert!(is_self("127.0.0.1:8084".parse().unwrap(), local, local));
        assert!(!is_self("127.0.0.1:8085".parse().unwrap(), local, local));
        assert!(!is_self("10.0.0.1:8084".parse().unwrap(), local, local));

        let any: SocketAddr = "0.0.0.0:8084".parse().unwrap();
        assert!(is_self("127.0.0.1:8084".parse().unwrap(), any, local));
    }

    #[test]
    fn wildcard_listener_matches_accepting_interface() {
        let any: SocketAddr = "0.0.0.0:8084".parse().unwrap();
        let accepted: SocketAddr = "192.168.1.5:8084".parse().unwrap();
        assert!(is_self("192.168.1.5:8084".parse().unwrap(), any, accepted));
        assert!(!is_self("192.168.1.6:8084".parse().unwrap(), any, accepted));
    }

    #[tokio::test]
    async fn wildcard_listener_matches_local_interfaces() {
        let any: SocketAddr = "0.0.0.0:8084".parse().unwrap();
        let accepted: SocketAddr = "127.0.0.1:8084".parse().unwrap();
        // Accepted on loopback, but named by another local address.
        assert!(targets_proxy("127.0.0.2:8084".parse().unwrap(), any, accepted).await);
        // Documentation range: never assigned locally.
        assert!(!targets_proxy("203.0.113.7:8084".parse().unwrap(), any, accepted).await);

        let bound: SocketAddr = "127.0.0.1:8084".parse().unwrap();
        assert!(!targets_proxy("127.0.0.2:8084".parse().unwrap(), bound, bound).await);
    }

    #[test]
    fn fallback_is_framed() {
        let page = fallback_response("hi");
        assert!(page.ends_with(b"Content-Length: 2\r\nConnection: close\r\n\r\nhi"));
    }
}
