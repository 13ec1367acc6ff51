//! Client address resolution and CIDR matching shared by the guards.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! With `TRUST_PROXY=true` the resolver believes the leftmost entry of the
//! configured forwarding header. A client talking to this service directly
//! can put anything there. Enabling trust-proxy is only safe when:
//!
//! 1. The service is deployed behind a reverse proxy that **overwrites**
//!    (not appends to) the header
//! 2. Direct access from the internet is blocked
//! 3. Ideally, `TRUSTED_PROXIES` lists the proxy networks so the header is
//!    ignored on connections that did not come through them
//!
//! ```nginx
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! # The "unknown" Key
//!
//! When no address can be determined at all, the rate limiter keys the
//! request as `ip:unknown`, so such requests are limited collectively. The
//! admission filter rejects them outright.

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::config::IpFilterConfig;
use crate::context::RequestContext;

/// Fallback key when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
///
/// The stored network address has its host bits cleared, so `10.1.2.3/8`
/// and `10.0.0.0/8` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is accepted as a host route (/32 or /128). Returns
    /// `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let ip: IpAddr = addr.parse().ok()?;
        let max_prefix = max_prefix(&ip);
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok()?,
            None => max_prefix,
        };

        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network: mask_address(ip, prefix_len),
            prefix_len,
        })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask_address(*ip, self.prefix_len) == self.network
            }
            // IPv4 and IPv6 don't match
            _ => false,
        }
    }
}

impl std::fmt::Display for CidrRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_address(ip: IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(addr) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len))
            };
            IpAddr::V4((u32::from(addr) & mask).into())
        }
        IpAddr::V6(addr) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len))
            };
            IpAddr::V6((u128::from(addr) & mask).into())
        }
    }
}

// =============================================================================
// Trusted Proxies
// =============================================================================

/// Configuration for trusted proxy validation.
///
/// When configured, the forwarding header is only trusted on connections
/// whose peer address falls within one of the ranges.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Create a new trusted proxy configuration from CIDR strings.
    ///
    /// Invalid CIDR strings are logged as warnings and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    /// Check if trusted proxy validation is enabled (any ranges configured).
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Check if a peer is a trusted proxy.
    ///
    /// Returns `true` if no ranges are configured (trust all mode).
    pub fn is_trusted(&self, peer: Option<IpAddr>) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        match peer {
            Some(ip) => self.ranges.iter().any(|range| range.contains(&ip)),
            None => false,
        }
    }
}

// =============================================================================
// Client IP Resolution
// =============================================================================

/// Resolves the address a request should be attributed to.
#[derive(Debug, Clone)]
pub struct ClientIpResolver {
    trust_proxy: bool,
    proxy_header: String,
    trusted_proxies: TrustedProxyConfig,
}

impl ClientIpResolver {
    pub fn new(config: &IpFilterConfig) -> Self {
        Self {
            trust_proxy: config.trust_proxy,
            proxy_header: config.proxy_header.to_ascii_lowercase(),
            trusted_proxies: TrustedProxyConfig::new(&config.trusted_proxies),
        }
    }

    /// Resolve the client address.
    ///
    /// With trust-proxy enabled, the leftmost entry of the forwarding header
    /// wins, provided the peer is a trusted proxy. Otherwise, or when the
    /// header is absent or unparsable, the transport peer address is used.
    pub fn resolve(&self, ctx: &RequestContext) -> Option<IpAddr> {
        let peer = ctx.peer_addr().map(|addr| addr.ip().to_canonical());

        if self.trust_proxy
            && let Some(forwarded) = ctx.header(&self.proxy_header)
        {
            if !self.trusted_proxies.is_trusted(peer) {
                warn!(
                    peer = ?peer,
                    header = %self.proxy_header,
                    "Forwarding header received from untrusted peer, ignoring"
                );
            } else if let Some(ip) = leftmost_address(forwarded) {
                return Some(ip);
            } else {
                debug!(header = %self.proxy_header, "Unparsable forwarding header");
            }
        }

        peer
    }

    /// The address already annotated on the context, resolving it if absent.
    pub fn client_ip(&self, ctx: &RequestContext) -> Option<IpAddr> {
        ctx.client_ip.or_else(|| self.resolve(ctx))
    }
}

/// Leftmost address in a comma-separated forwarding header.
fn leftmost_address(value: &str) -> Option<IpAddr> {
    let first = value.split(',').next()?.trim();
    parse_address(first)
}

/// Parse an address, tolerating a port suffix and IPv6 brackets.
pub fn parse_address(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip.to_canonical());
    }
    value
        .parse::<std::net::SocketAddr>()
        .ok()
        .map(|addr| addr.ip().to_canonical())
}
