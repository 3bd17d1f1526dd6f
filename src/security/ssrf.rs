//! SSRF protection for OAuth metadata fetches.
//!
//! Metadata URLs come from untrusted places (challenge headers, remote
//! metadata documents), so every fetch target is checked before a request
//! is built. Hosts are rejected when they are, or resolve to, loopback,
//! private, link-local or otherwise non-routable addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::net::lookup_host;
use url::{Host, Url};

use crate::{Error, Result};

/// Whether an address must never be the target of an outbound fetch
#[must_use]
pub fn is_blocked_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(addr: Ipv4Addr) -> bool {
    let [a, b, c, _] = addr.octets();
    addr.is_loopback()          // 127.0.0.0/8
    || addr.is_private()        // 10/8, 172.16/12, 192.168/16
    || addr.is_link_local()     // 169.254/16
    || addr.is_broadcast()
    || addr.is_unspecified()
    || (a == 100 && (b & 0xC0) == 64) // 100.64/10 CGN
    || (a == 192 && b == 0 && c == 2)
    || (a == 198 && b == 51 && c == 100)
    || (a == 203 && b == 0 && c == 113)
}

#[allow(clippy::cast_possible_truncation)] // u16 segments split into u8 octets
fn embedded_ipv4(hi: u16, lo: u16) -> Ipv4Addr {
    Ipv4Addr::new((hi >> 8) as u8, hi as u8, (lo >> 8) as u8, lo as u8)
}

fn is_blocked_ipv6(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() {
        return true;
    }

    let s = addr.segments();

    // fe80::/10 link-local, fc00::/7 unique local
    if s[0] & 0xFFC0 == 0xFE80 || s[0] & 0xFE00 == 0xFC00 {
        return true;
    }

    // ::ffff:a.b.c.d (mapped) and ::a.b.c.d (compatible)
    if s[..5].iter().all(|&seg| seg == 0) && (s[5] == 0xFFFF || s[5] == 0) {
        return is_blocked_ipv4(embedded_ipv4(s[6], s[7]));
    }

    // 6to4 carries the IPv4 address in segments 1-2
    if s[0] == 0x2002 {
        return is_blocked_ipv4(embedded_ipv4(s[1], s[2]));
    }

    // Teredo carries the client address inverted in segments 6-7
    if s[0] == 0x2001 && s[1] == 0 {
        return is_blocked_ipv4(embedded_ipv4(!s[6], !s[7]));
    }

    false
}

fn is_local_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost" || host.ends_with(".localhost")
}

/// Check a URL without touching the network: scheme, literal IPs and
/// `localhost` names.
///
/// Returns the host name that still needs resolving, or `None` when the host
/// was an IP literal that passed.
pub fn check_literal(url: &Url) -> Result<Option<String>> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Discovery(format!(
            "SSRF blocked: unsupported scheme {}",
            url.scheme()
        )));
    }

    match url.host() {
        None => Err(Error::Discovery("SSRF blocked: URL has no host".to_string())),
        Some(Host::Ipv4(v4)) if is_blocked_ipv4(v4) => Err(Error::Discovery(format!(
            "SSRF blocked: {v4} is a private or reserved address"
        ))),
        Some(Host::Ipv6(v6)) if is_blocked_ipv6(v6) => Err(Error::Discovery(format!(
            "SSRF blocked: {v6} is a private or reserved address"
        ))),
        Some(Host::Ipv4(_) | Host::Ipv6(_)) => Ok(None),
        Some(Host::Domain(name)) if is_local_hostname(name) => Err(Error::Discovery(format!(
            "SSRF blocked: {name} is a local host name"
        ))),
        Some(Host::Domain(name)) => Ok(Some(name.to_string())),
    }
}

/// Full check: literal rules, then DNS resolution of host names.
///
/// A host that fails to resolve is blocked as well; the fetch could not have
/// succeeded and the answer might change between check and use.
pub async fn check_target(url: &Url) -> Result<()> {
    let Some(host) = check_literal(url)? else {
        return Ok(());
    };

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = lookup_host((host.as_str(), port))
        .await
        .map_err(|e| Error::Discovery(format!("SSRF blocked: cannot resolve {host}: {e}")))?;

    let mut resolved_any = false;
    for addr in addrs {
        resolved_any = true;
        if is_blocked_ip(addr.ip()) {
            return Err(Error::Discovery(format!(
                "SSRF blocked: {host} resolves to private address {}",
                addr.ip()
            )));
        }
    }

    if resolved_any {
        Ok(())
    } else {
        Err(Error::Discovery(format!("SSRF blocked: {host} has no addresses")))
    }
}
