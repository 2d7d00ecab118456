#![forbid(unsafe_code)]

//! Outbound-safety validation for webhook targets.
//!
//! Two stages: `validate_webhook_url` checks what can be known from the URL
//! alone (scheme, literal IPs, well-known local names) and is used when a
//! rule is created and when it is matched. `resolve_vetted_target` resolves
//! the host and checks every address the connection could use; dispatch
//! must connect only to the addresses it returns.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboundViolation {
    #[error("webhook url is not parseable: {0}")]
    Unparseable(String),
    #[error("scheme `{0}` is not allowed (http/https only)")]
    SchemeNotAllowed(String),
    #[error("webhook url has no host")]
    MissingHost,
    #[error("webhook url must not embed credentials")]
    EmbeddedCredentials,
    #[error("host `{0}` names a local-only endpoint")]
    LocalHostname(String),
    #[error("host `{host}` maps to forbidden address {addr}")]
    ForbiddenAddress { host: String, addr: IpAddr },
    #[error("host `{host}` could not be resolved: {reason}")]
    ResolutionFailed { host: String, reason: String },
    #[error("host `{0}` resolved to no addresses")]
    NoAddresses(String),
}

impl OutboundViolation {
    pub fn class(&self) -> &'static str {
        match self {
            OutboundViolation::Unparseable(_) => "unparseable_url",
            OutboundViolation::SchemeNotAllowed(_) => "scheme_not_allowed",
            OutboundViolation::MissingHost => "missing_host",
            OutboundViolation::EmbeddedCredentials => "embedded_credentials",
            OutboundViolation::LocalHostname(_) => "local_hostname",
            OutboundViolation::ForbiddenAddress { .. } => "forbidden_address",
            OutboundViolation::ResolutionFailed { .. } => "resolution_failed",
            OutboundViolation::NoAddresses(_) => "no_addresses",
        }
    }
}

/// A URL that passed the static checks. Carries the parsed form so later
/// stages never re-parse the raw string differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedWebhookUrl {
    url: Url,
}

impl ValidatedWebhookUrl {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(443)
    }
}

pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => is_forbidden_v6(v6),
    }
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 0.0.0.0/8 routes to the local host on most stacks.
        || ip.octets()[0] == 0
        // Carrier-grade NAT, 100.64.0.0/10.
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    // IPv4-mapped, IPv4-compatible (::a.b.c.d) and NAT64 (64:ff9b::/96)
    // addresses are judged by the IPv4 address they carry.
    if let Some(v4) = ip.to_ipv4() {
        return is_forbidden_v4(v4);
    }
    let seg = ip.segments();
    if seg[..6] == [0x64, 0xff9b, 0, 0, 0, 0] {
        let o = ip.octets();
        return is_forbidden_v4(Ipv4Addr::new(o[12], o[13], o[14], o[15]));
    }
    let first = seg[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

pub fn validate_webhook_url(raw: &str) -> Result<ValidatedWebhookUrl, OutboundViolation> {
    let url = Url::parse(raw.trim()).map_err(|e| OutboundViolation::Unparseable(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(OutboundViolation::SchemeNotAllowed(other.to_string())),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(OutboundViolation::EmbeddedCredentials);
    }
    match url.host() {
        None => return Err(OutboundViolation::MissingHost),
        Some(Host::Ipv4(v4)) => check_literal(&url, IpAddr::V4(v4))?,
        Some(Host::Ipv6(v6)) => check_literal(&url, IpAddr::V6(v6))?,
        Some(Host::Domain(domain)) => {
            let name = domain.trim_end_matches('.').to_ascii_lowercase();
            if name.is_empty() {
                return Err(OutboundViolation::MissingHost);
            }
            if name == "localhost"
                || name.ends_with(".localhost")
                || name.ends_with(".local")
                || name.ends_with(".internal")
            {
                return Err(OutboundViolation::LocalHostname(name));
            }
        }
    }
    Ok(ValidatedWebhookUrl { url })
}

fn check_literal(url: &Url, ip: IpAddr) -> Result<(), OutboundViolation> {
    if is_forbidden_ip(ip) {
        return Err(OutboundViolation::ForbiddenAddress {
            host: url.host_str().unwrap_or_default().to_string(),
            addr: ip,
        });
    }
    Ok(())
}

/// Name resolution seam so dispatch can be exercised without real DNS.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Fixed host table; IP literals resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: BTreeMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.hosts
            .insert(host.to_ascii_lowercase(), addrs.to_vec());
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        self.hosts
            .get(&bare.to_ascii_lowercase())
            .map(|ips| ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host not in static table"))
    }
}

/// Resolves the target and refuses it if any resolved address is forbidden.
pub fn resolve_vetted_target(
    target: &ValidatedWebhookUrl,
    resolver: &dyn HostResolver,
) -> Result<Vec<SocketAddr>, OutboundViolation> {
    let host = target.host().to_string();
    let addrs = resolver
        .resolve(&host, target.port())
        .map_err(|e| OutboundViolation::ResolutionFailed {
            host: host.clone(),
            reason: e.to_string(),
        })?;
    if addrs.is_empty() {
        return Err(OutboundViolation::NoAddresses(host));
    }
    if let Some(bad) = addrs.iter().find(|a| is_forbidden_ip(a.ip())) {
        return Err(OutboundViolation::ForbiddenAddress {
            host,
            addr: bad.ip(),
        });
    }
    Ok(addrs)
}
