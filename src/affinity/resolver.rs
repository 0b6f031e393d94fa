//! Listening endpoint resolution
//!
//! Works out the base URI sibling instances should use to reach this process.
//! An explicit override always wins. Otherwise the addresses the listener is
//! bound to are ranked:
//!
//! 1. external + http
//! 2. external + https
//! 3. localhost + http
//! 4. localhost + https
//!
//! http beats https because the forwarded hop stays inside the cluster, and
//! external bindings beat loopback because siblings cannot reach loopback.
//! Wildcard binds (`0.0.0.0`, `[::]`) count as external and are kept verbatim.
//! With nothing usable the result is [`FALLBACK_ADDRESS`].

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::RwLock;

use url::{Host, Url};

use super::error::AffinityError;

/// Address used when neither an override nor a usable binding exists
pub const FALLBACK_ADDRESS: &str = "http://localhost:80";

/// Source of the addresses the hosting runtime is listening on
pub trait ServerAddresses: Send + Sync {
    /// `None` when the runtime does not expose bindings at all
    fn addresses(&self) -> Option<Vec<String>>;
}

/// Addresses recorded by the binary as it binds listeners
#[derive(Debug, Default)]
pub struct ListenerAddresses {
    addresses: RwLock<Vec<String>>,
}

impl ListenerAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bound socket as `<scheme>://<ip>:<port>`
    pub fn record(&self, scheme: &str, addr: SocketAddr) {
        self.record_uri(format!("{}://{}", scheme, addr));
    }

    pub fn record_uri(&self, uri: impl Into<String>) {
        let mut addresses = self.addresses.write().unwrap_or_else(|e| e.into_inner());
        addresses.push(uri.into());
    }
}

impl ServerAddresses for ListenerAddresses {
    fn addresses(&self) -> Option<Vec<String>> {
        let addresses = self.addresses.read().unwrap_or_else(|e| e.into_inner());
        if addresses.is_empty() {
            None
        } else {
            Some(addresses.clone())
        }
    }
}

/// Fixed address list, handy when bindings are known up front
impl ServerAddresses for Vec<String> {
    fn addresses(&self) -> Option<Vec<String>> {
        Some(self.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Locality {
    External,
    Localhost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Scheme {
    Http,
    Https,
}

/// Resolve the address to embed in ownership records claimed by this process
pub fn resolve_listening_address(
    bound: Option<&[String]>,
    explicit: Option<&str>,
) -> Result<String, AffinityError> {
    if let Some(explicit) = explicit.filter(|s| !s.trim().is_empty()) {
        return normalize_explicit(explicit);
    }

    let best = bound
        .unwrap_or_default()
        .iter()
        .filter_map(|raw| classify(raw))
        // min_by_key keeps the first of equal keys, i.e. input order on ties
        .min_by_key(|(rank, _)| *rank);

    Ok(match best {
        Some((_, url)) => normalize(&url),
        None => FALLBACK_ADDRESS.to_string(),
    })
}

/// Validate and normalize an explicit override
pub fn normalize_explicit(explicit: &str) -> Result<String, AffinityError> {
    let trimmed = explicit.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| AffinityError::invalid_address(trimmed, format!("not an absolute URI ({})", e)))?;

    if scheme_of(&url).is_none() {
        return Err(AffinityError::invalid_address(
            trimmed,
            format!("scheme must be http or https, got '{}'", url.scheme()),
        ));
    }
    if url.host().is_none() {
        return Err(AffinityError::invalid_address(trimmed, "missing host"));
    }

    Ok(normalize(&url))
}

fn classify(raw: &str) -> Option<((Locality, Scheme), Url)> {
    let url = Url::parse(raw.trim()).ok()?;
    let scheme = scheme_of(&url)?;
    let locality = locality_of(url.host()?);
    Some(((locality, scheme), url))
}

fn scheme_of(url: &Url) -> Option<Scheme> {
    match url.scheme() {
        "http" => Some(Scheme::Http),
        "https" => Some(Scheme::Https),
        _ => None,
    }
}

fn locality_of(host: Host<&str>) -> Locality {
    let is_local = match host {
        Host::Domain(domain) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Host::Ipv4(ip) => ip == Ipv4Addr::LOCALHOST,
        Host::Ipv6(ip) => ip == Ipv6Addr::LOCALHOST,
    };

    if is_local {
        Locality::Localhost
    } else {
        Locality::External
    }
}

/// `scheme://host:port`, port always explicit, path/query/fragment dropped
fn normalize(url: &Url) -> String {
    let host = url.host_str().unwrap_or("localhost");
    let port = url
        .port_or_known_default()
        .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });
    format!("{}://{}:{}", url.scheme(), host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn resolve(list: &[&str]) -> String {
        let bound = addrs(list);
        resolve_listening_address(Some(&bound), None).unwrap()
    }

    #[test]
    fn test_priority_prefers_external_http() {
        assert_eq!(
            resolve(&[
                "https://localhost:5443",
                "http://localhost:5000",
                "https://10.0.1.5:5001",
                "http://10.0.1.5:5000",
            ]),
            "http://10.0.1.5:5000"
        );
    }

    #[test]
    fn test_priority_order_across_categories() {
        assert_eq!(
            resolve(&["https://localhost:5443", "http://localhost:5000", "https://10.0.1.5:5001"]),
            "https://10.0.1.5:5001"
        );
        assert_eq!(
            resolve(&["https://localhost:5443", "http://127.0.0.1:5000"]),
            "http://127.0.0.1:5000"
        );
        assert_eq!(resolve(&["https://[::1]:5443"]), "https://[::1]:5443");
    }

    #[test]
    fn test_first_address_wins_within_category() {
        assert_eq!(
            resolve(&["http://10.0.0.2:7000", "http://10.0.0.1:7000"]),
            "http://10.0.0.2:7000"
        );
    }

    #[test]
    fn test_localhost_classification() {
        // Every one of these is loopback, so the external https entry wins
        for local in [
            "http://LOCALHOST:5000",
            "http://api.localhost:5000",
            "http://127.0.0.1:5000",
            "http://[::1]:5000",
        ] {
            assert_eq!(
                resolve(&[local, "https://node-3.internal:5001"]),
                "https://node-3.internal:5001",
                "{local} should be treated as localhost"
            );
        }
    }

    #[test]
    fn test_wildcards_are_external_and_kept_verbatim() {
        assert_eq!(
            resolve(&["http://localhost:5000", "http://0.0.0.0:5000"]),
            "http://0.0.0.0:5000"
        );
        assert_eq!(resolve(&["http://[::]:8080"]), "http://[::]:8080");
    }

    #[test]
    fn test_unparsable_and_foreign_schemes_are_skipped() {
        assert_eq!(
            resolve(&["not a uri", "/relative/path", "ws://10.0.0.1:9000", "http://localhost:5000"]),
            "http://localhost:5000"
        );
    }

    #[test]
    fn test_default_ports_are_explicit() {
        assert_eq!(resolve(&["http://10.0.0.1"]), "http://10.0.0.1:80");
        assert_eq!(resolve(&["https://10.0.0.1/"]), "https://10.0.0.1:443");
    }

    #[test]
    fn test_fallback_when_nothing_bound() {
        assert_eq!(resolve_listening_address(None, None).unwrap(), FALLBACK_ADDRESS);
        assert_eq!(resolve(&[]), "http://localhost:80");
        assert_eq!(resolve(&["garbage"]), FALLBACK_ADDRESS);
    }

    #[test]
    fn test_explicit_override_wins_and_is_normalized() {
        let bound = addrs(&["http://10.0.1.5:5000"]);
        assert_eq!(
            resolve_listening_address(Some(&bound), Some("https://mcp-2.svc.cluster.local/mcp?x=1#frag"))
                .unwrap(),
            "https://mcp-2.svc.cluster.local:443"
        );
        assert_eq!(
            resolve_listening_address(Some(&bound), Some("  http://LOCALHOST:9000  ")).unwrap(),
            "http://localhost:9000"
        );
    }

    #[test]
    fn test_blank_override_means_auto_detect() {
        let bound = addrs(&["http://10.0.1.5:5000"]);
        assert_eq!(
            resolve_listening_address(Some(&bound), Some("   ")).unwrap(),
            "http://10.0.1.5:5000"
        );
    }

    #[test]
    fn test_invalid_override_is_an_error() {
        for bad in ["/relative", "ftp://files:21", "localhost:5000", "mailto:ops@example.com"] {
            let err = resolve_listening_address(None, Some(bad)).unwrap_err();
            assert!(err.is_config(), "{bad} should be rejected, got {err}");
        }
    }

    #[test]
    fn test_listener_addresses_records_bindings() {
        let listeners = ListenerAddresses::new();
        assert_eq!(listeners.addresses(), None);

        listeners.record("http", "0.0.0.0:5000".parse().unwrap());
        listeners.record("http", "[::1]:5001".parse().unwrap());

        assert_eq!(
            listeners.addresses(),
            Some(addrs(&["http://0.0.0.0:5000", "http://[::1]:5001"]))
        );
    }
}
