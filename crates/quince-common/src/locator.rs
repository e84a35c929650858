//! Locator string parsing for cluster discovery
//!
//! A locators string is a comma-separated list of `[qualifier@]host[port]`
//! entries. The qualifier may also be separated by a colon
//! (`bind-name:host[port]`) unless the text before the colon is itself a
//! numeric address containing colons, in which case only `@` separates a
//! qualifier from the host.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use tracing::{debug, warn};

use crate::error::{GridError, Result};

/// A locator endpoint produced by [`parse_locators`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostAddress {
    /// Host as written in the locators string (qualifier removed)
    pub host: String,
    pub port: u16,
    /// Resolved socket endpoint, if the host could be resolved
    pub socket_addr: Option<SocketAddr>,
}

impl HostAddress {
    pub fn is_resolved(&self) -> bool {
        self.socket_addr.is_some()
    }

    pub fn is_loopback(&self) -> bool {
        self.socket_addr.is_some_and(|addr| addr.ip().is_loopback())
    }
}

impl Display for HostAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.host, self.port)
    }
}

/// Name resolution used while parsing locators
pub trait HostResolver: Send + Sync {
    /// Resolve `host` to a socket address for `port`, `None` if unknown
    fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr>;

    fn resolve_ip(&self, host: &str) -> Option<IpAddr> {
        self.resolve(host, 0).map(|addr| addr.ip())
    }
}

/// Resolver backed by the operating system
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr> {
        (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
    }
}

#[derive(Hash, PartialEq, Eq)]
enum EndpointKey {
    Resolved(SocketAddr),
    Unresolved(String, u16),
}

/// Parse a locators string with the system resolver.
///
/// See [`parse_locators_with`].
pub fn parse_locators(locators: &str, bind_address: Option<&str>) -> Result<Vec<HostAddress>> {
    parse_locators_with(locators, bind_address, &SystemResolver)
}

/// Parse a locators string and check it against the bind address.
///
/// Entries are returned in first-occurrence order with duplicate endpoints
/// collapsed. Malformed entries are logged and skipped. When `bind_address`
/// resolves to a loopback address every locator must be a loopback address
/// as well, otherwise [`GridError::LoopbackMismatch`] is returned.
pub fn parse_locators_with(
    locators: &str,
    bind_address: Option<&str>,
    resolver: &dyn HostResolver,
) -> Result<Vec<HostAddress>> {
    let bind = bind_address.map(str::trim).filter(|b| !b.is_empty());
    let bind_ip = bind.and_then(|b| {
        let ip = resolver.resolve_ip(b);
        if ip.is_none() {
            warn!(bind_address = %b, "Unable to resolve bind address, skipping loopback check");
        }
        ip
    });
    let loopback_bind = bind_ip.is_some_and(|ip| ip.is_loopback());

    let mut result = Vec::with_capacity(2);
    let mut seen = HashSet::new();

    for entry in locators.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (host, port) = match split_locator_entry(entry) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Skipping locator entry");
                continue;
            }
        };

        let socket_addr = resolver.resolve(host, port);
        if socket_addr.is_none() {
            debug!(host = %host, port, "Locator host did not resolve");
        }

        if loopback_bind && !socket_addr.is_some_and(|addr| addr.ip().is_loopback()) {
            return Err(GridError::LoopbackMismatch {
                bind_address: bind.unwrap_or_default().to_string(),
                locator: socket_addr
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| format!("{}[{}]", host, port)),
            });
        }

        let key = match socket_addr {
            Some(addr) => EndpointKey::Resolved(addr),
            None => EndpointKey::Unresolved(host.to_ascii_lowercase(), port),
        };
        if seen.insert(key) {
            result.push(HostAddress {
                host: host.to_string(),
                port,
                socket_addr,
            });
        }
    }

    Ok(result)
}

/// Split one locator entry into host and port
fn split_locator_entry(entry: &str) -> Result<(&str, u16)> {
    let malformed = |reason: &str| GridError::MalformedLocator {
        entry: entry.to_string(),
        reason: reason.to_string(),
    };

    let open = entry.rfind('[').ok_or_else(|| malformed("missing '['"))?;
    let close = entry[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| malformed("missing ']'"))?;

    let port = entry[open + 1..close]
        .trim()
        .parse::<u16>()
        .map_err(|e| malformed(&format!("invalid port: {}", e)))?;

    let prefix = &entry[..open];
    let mut separator = prefix.rfind('@').or_else(|| prefix.rfind(':'));
    let before = &prefix[..separator.unwrap_or(prefix.len())];
    if before.contains(':') {
        // numeric address with colons, only '@' may separate a qualifier
        separator = prefix.rfind('@');
    }
    let host = match separator {
        Some(idx) => &prefix[idx + 1..],
        None => prefix,
    };

    if host.is_empty() {
        return Err(malformed("empty host"));
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use super::*;

    /// Resolver with a fixed host table
    struct StaticResolver(HashMap<&'static str, IpAddr>);

    impl StaticResolver {
        fn new(entries: &[(&'static str, IpAddr)]) -> Self {
            Self(entries.iter().cloned().collect())
        }
    }

    impl HostResolver for StaticResolver {
        fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr> {
            host.parse::<IpAddr>()
                .ok()
                .or_else(|| self.0.get(host).copied())
                .map(|ip| SocketAddr::new(ip, port))
        }
    }

    fn lan(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn resolver() -> StaticResolver {
        StaticResolver::new(&[
            ("host1", lan(1)),
            ("host2", lan(2)),
            ("alias1", lan(1)),
            ("localhost", IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ])
    }

    #[test]
    fn test_parse_two_locators() {
        let parsed =
            parse_locators_with("host1[10334],host2[10335]", None, &resolver()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!((parsed[0].host.as_str(), parsed[0].port), ("host1", 10334));
        assert_eq!((parsed[1].host.as_str(), parsed[1].port), ("host2", 10335));
        assert_eq!(parsed[0].to_string(), "host1[10334]");
    }

    #[test]
    fn test_duplicate_endpoints_collapse() {
        let parsed = parse_locators_with(
            "host1[10334],alias1[10334],host2[10335],host1[10334]",
            None,
            &resolver(),
        )
        .unwrap();
        let hosts: Vec<_> = parsed.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(hosts, vec!["host1", "host2"]);
    }

    #[test]
    fn test_unresolved_hosts_dedup_by_name() {
        let parsed =
            parse_locators_with("nowhere[1],NOWHERE[1],nowhere[2]", None, &resolver()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(!parsed[0].is_resolved());
    }

    #[test]
    fn test_qualifiers_are_stripped() {
        let parsed = parse_locators_with(
            "member-a@host1[1],bindname:host2[2],::1[3],peer@::1[4]",
            None,
            &resolver(),
        )
        .unwrap();
        let hosts: Vec<_> = parsed
            .iter()
            .map(|h| (h.host.as_str(), h.port))
            .collect();
        assert_eq!(
            hosts,
            vec![("host1", 1), ("host2", 2), ("::1", 3), ("::1", 4)]
        );
    }

    #[test]
    fn test_ipv6_literal_is_not_split() {
        let parsed = parse_locators_with("2001:db8::7[10334]", None, &resolver()).unwrap();
        assert_eq!(parsed[0].host, "2001:db8::7");
        assert!(parsed[0].is_resolved());
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let parsed = parse_locators_with(
            "host1[abc],host2,host1[99999],,host2[10335]",
            None,
            &resolver(),
        )
        .unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].host, "host2");
    }

    #[test]
    fn test_loopback_bind_rejects_remote_locator() {
        let err = parse_locators_with(
            "localhost[10334],host1[10334]",
            Some("127.0.0.1"),
            &resolver(),
        )
        .unwrap_err();
        assert!(matches!(err, GridError::LoopbackMismatch { .. }));
        assert!(err.is_fatal_config());
    }

    #[test]
    fn test_loopback_bind_accepts_local_locators() {
        let parsed = parse_locators_with(
            "localhost[10334],127.0.0.1[10335]",
            Some("localhost"),
            &resolver(),
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.iter().all(HostAddress::is_loopback));
    }

    #[test]
    fn test_non_loopback_bind_skips_check() {
        let parsed =
            parse_locators_with("localhost[10334],host1[10334]", Some("host2"), &resolver())
                .unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_split_locator_entry_errors() {
        assert!(split_locator_entry("host").is_err());
        assert!(split_locator_entry("host[12").is_err());
        assert!(split_locator_entry("@[12]").is_err());
        assert_eq!(split_locator_entry("h[ 12 ]").unwrap(), ("h", 12));
    }

    proptest::proptest! {
        #[test]
        fn prop_output_has_unique_endpoints(ports in proptest::collection::vec(1u16..20, 0..12)) {
            let locators = ports
                .iter()
                .map(|p| format!("host1[{}]", p))
                .collect::<Vec<_>>()
                .join(",");
            let parsed = parse_locators_with(&locators, None, &resolver()).unwrap();

            let mut expected = Vec::new();
            for p in &ports {
                if !expected.contains(p) {
                    expected.push(*p);
                }
            }
            let got: Vec<u16> = parsed.iter().map(|h| h.port).collect();
            proptest::prop_assert_eq!(got, expected);
        }
    }
}
