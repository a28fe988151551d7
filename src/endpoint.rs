//! Endpoint model: the `(protocol, address, port)` triples the listener
//! binds, plus the registration invariants enforced on the set.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// Wire protocols an endpoint can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Http,
    Https,
    Smtp,
    Tcp,
    Ws,
    Wss,
}

/// Protocols partition into families; the server runs exactly one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Web,
    Smtp,
    Tcp,
}

impl Protocol {
    pub fn family(self) -> ProtocolFamily {
        match self {
            Protocol::Http | Protocol::Https | Protocol::Ws | Protocol::Wss => ProtocolFamily::Web,
            Protocol::Smtp => ProtocolFamily::Smtp,
            Protocol::Tcp => ProtocolFamily::Tcp,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::Https | Protocol::Wss)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Smtp => "SMTP",
            Protocol::Tcp => "TCP",
            Protocol::Ws => "WS",
            Protocol::Wss => "WSS",
        };
        f.write_str(s)
    }
}

/// TLS material attached to a secure endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMaterial {
    #[default]
    None,
    /// PEM certificate chain and private key on disk.
    CertificatePair { cert: PathBuf, key: PathBuf },
    /// Reference to a certificate in an external store by thumbprint.
    Thumbprint(String),
    /// Generate a throwaway self-signed certificate at bind time.
    SelfSigned,
}

/// The host half of a bind address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// `0.0.0.0` — all interfaces.
    Any,
    Ip(IpAddr),
    /// A hostname, resolved at bind time.
    Name(String),
}

impl Host {
    /// The IP this host reports as its address. Hostname endpoints report
    /// the wildcard here; the listener resolves the name at bind time.
    pub fn bind_ip(&self) -> IpAddr {
        match self {
            Host::Any | Host::Name(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Host::Ip(ip) => *ip,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Any => f.write_str("0.0.0.0"),
            Host::Ip(ip) => write!(f, "{ip}"),
            Host::Name(n) => f.write_str(n),
        }
    }
}

fn looks_like_ipv4(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

fn valid_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|label| {
            !label.is_empty()
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

/// Parse the host half of an address string.
pub fn parse_host(raw: &str) -> Result<Host> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "all" || raw == "*" {
        return Ok(Host::Any);
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return inner
            .parse::<Ipv6Addr>()
            .map(|ip| Host::Ip(IpAddr::V6(ip)))
            .map_err(|_| Error::config(format!("invalid IP address: {raw}")));
    }
    if let Ok(ip) = raw.parse::<Ipv6Addr>() {
        return Ok(Host::Ip(IpAddr::V6(ip)));
    }
    if looks_like_ipv4(raw) {
        return raw
            .parse::<Ipv4Addr>()
            .map(|ip| Host::Ip(IpAddr::V4(ip)))
            .map_err(|_| Error::config(format!("invalid IP address: {raw}")));
    }
    if valid_hostname(raw) {
        return Ok(Host::Name(raw.to_string()));
    }
    Err(Error::config(format!("invalid address: {raw}")))
}

/// Parse a combined `host[:port]` address string.
///
/// Rules: `host:port` splits on the last colon; `host:` means port 0
/// (assign); `:port` means wildcard host; a bare integer is a port with
/// wildcard host; anything else is a bare host.
pub fn parse_address(raw: &str) -> Result<(Host, Option<u16>)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok((Host::Any, None));
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        let port = raw
            .parse::<u16>()
            .map_err(|_| Error::config(format!("invalid port: {raw}")))?;
        return Ok((Host::Any, Some(port)));
    }
    // Bracketed IPv6 may carry a port after the closing bracket.
    if raw.starts_with('[') {
        if let Some(end) = raw.find(']') {
            let host = parse_host(&raw[..=end])?;
            let rest = &raw[end + 1..];
            return match rest.strip_prefix(':') {
                None if rest.is_empty() => Ok((host, None)),
                Some("") => Ok((host, Some(0))),
                Some(p) => {
                    let port = p
                        .parse::<u16>()
                        .map_err(|_| Error::config(format!("invalid port: {p}")))?;
                    Ok((host, Some(port)))
                }
                None => Err(Error::config(format!("invalid address: {raw}"))),
            };
        }
        return Err(Error::config(format!("invalid address: {raw}")));
    }
    // An unbracketed IPv6 literal is a host on its own, not host:port.
    if let Ok(ip) = raw.parse::<Ipv6Addr>() {
        return Ok((Host::Ip(IpAddr::V6(ip)), None));
    }
    match raw.rfind(':') {
        Some(idx) => {
            let host = parse_host(&raw[..idx])?;
            let port_str = &raw[idx + 1..];
            if port_str.is_empty() {
                return Ok((host, Some(0)));
            }
            let port = port_str
                .parse::<u16>()
                .map_err(|_| Error::config(format!("invalid port: {port_str}")))?;
            Ok((host, Some(port)))
        }
        None => Ok((parse_host(raw)?, None)),
    }
}

/// A bound endpoint: protocol, address, port, plus TLS material and flags.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: Option<String>,
    pub protocol: Protocol,
    pub host: Host,
    pub port: u16,
    pub tls: TlsMaterial,
    pub allow_client_certificate: bool,
}

impl Endpoint {
    pub fn new(protocol: Protocol, address: &str, port: u16) -> Result<Self> {
        let host = parse_host(address)?;
        Ok(Self {
            name: None,
            protocol,
            host,
            port,
            tls: TlsMaterial::None,
            allow_client_certificate: false,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = tls;
        self
    }

    pub fn allow_client_certificate(mut self, allow: bool) -> Self {
        self.allow_client_certificate = allow;
        self
    }

    /// The IP address the listener binds for this endpoint, as a string.
    pub fn address(&self) -> String {
        self.host.bind_ip().to_string()
    }

    /// The hostname filter, when the endpoint was declared with one.
    pub fn hostname(&self) -> Option<&str> {
        match &self.host {
            Host::Name(n) => Some(n.as_str()),
            _ => None,
        }
    }

    /// Binding a port below 1024 needs elevated privileges on most systems.
    pub fn requires_elevation(&self) -> bool {
        self.port != 0 && self.port < 1024
    }

    /// Does an incoming Host header match this endpoint's hostname filter?
    pub fn matches_hostname(&self, header_host: Option<&str>) -> bool {
        match self.hostname() {
            None => true,
            Some(name) => header_host
                .map(|h| h.split(':').next().unwrap_or(h).eq_ignore_ascii_case(name))
                .unwrap_or(false),
        }
    }

    fn same_binding(&self, other: &Endpoint) -> bool {
        self.protocol == other.protocol && self.host == other.host && self.port == other.port
    }

    /// Secure endpoints must carry TLS material.
    fn validate(&self) -> Result<()> {
        if self.protocol.is_secure() && self.tls == TlsMaterial::None {
            return Err(Error::config(format!(
                "{} endpoint {}:{} requires TLS material",
                self.protocol, self.host, self.port
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// The registered endpoint set, with uniqueness and family invariants.
///
/// A failed registration leaves the set unchanged.
#[derive(Debug, Clone, Default)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint.
    ///
    /// Returns `Ok(true)` when added, `Ok(false)` when the identical
    /// `(protocol, address, port)` binding already exists (a no-op).
    pub fn add(&mut self, endpoint: Endpoint) -> Result<bool> {
        endpoint.validate()?;

        if self.endpoints.iter().any(|e| e.same_binding(&endpoint)) {
            return Ok(false);
        }

        if let Some(name) = &endpoint.name {
            if self
                .endpoints
                .iter()
                .any(|e| e.name.as_deref() == Some(name.as_str()))
            {
                return Err(Error::config(format!(
                    "an endpoint named '{name}' is already defined"
                )));
            }
        }

        let family = endpoint.protocol.family();
        if let Some(existing) = self
            .endpoints
            .iter()
            .find(|e| e.protocol.family() != family)
        {
            return Err(Error::config(format!(
                "cannot add {} endpoint: the server already has {} endpoints",
                endpoint.protocol, existing.protocol
            )));
        }

        // SMTP and TCP servers are single-endpoint.
        if matches!(family, ProtocolFamily::Smtp | ProtocolFamily::Tcp) && !self.endpoints.is_empty()
        {
            return Err(Error::config(format!(
                "cannot add {} endpoint: the server already has one",
                endpoint.protocol
            )));
        }

        tracing::info!(endpoint = %endpoint, name = ?endpoint.name, "endpoint registered");
        self.endpoints.push(endpoint);
        Ok(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name.as_deref() == Some(name))
    }

    /// The family currently served, when any endpoint is registered.
    pub fn family(&self) -> Option<ProtocolFamily> {
        self.endpoints.first().map(|e| e.protocol.family())
    }
}
