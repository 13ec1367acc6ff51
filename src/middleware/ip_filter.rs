//! IP admission control with allow/deny lists and CIDR ranges.
//!
//! # Modes
//!
//! - **Allow-list** (default deny): only addresses matching an allow entry
//!   pass, plus private and loopback ranges when `IP_ALLOW_PRIVATE=true`.
//! - **Deny-list** (default allow): addresses matching a deny entry are
//!   rejected, everything else passes.
//!
//! Rules can be added and removed at runtime. Lookups take the read lock,
//! mutations take the write lock, so admin changes never race lookups.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ip::{CidrRange, ClientIpResolver, parse_address};
use crate::config::IpFilterConfig;
use crate::context::RequestContext;
use crate::error::AppError;
use crate::pipeline::{Guard, Verdict};

/// Private and loopback ranges admitted by the allow-list carve-out.
const PRIVATE_RANGES: [&str; 6] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "::1/128",
    "fc00::/7",
];

/// Filtering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    AllowList,
    #[default]
    DenyList,
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" | "allowlist" | "allow_list" | "whitelist" => Ok(Self::AllowList),
            "deny" | "denylist" | "deny_list" | "blacklist" => Ok(Self::DenyList),
            other => Err(format!(
                "unknown IP filter mode '{other}' (expected allow_list or deny_list)"
            )),
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllowList => f.write_str("allow_list"),
            Self::DenyList => f.write_str("deny_list"),
        }
    }
}

/// Which rule list an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleList {
    Allow,
    Deny,
}

impl fmt::Display for RuleList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny => f.write_str("deny"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid IP rule '{0}': expected an address or CIDR block")]
pub struct RuleParseError(pub String);

/// A single admission rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRule {
    Exact(IpAddr),
    Range(CidrRange),
}

impl FromStr for IpRule {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('/') {
            CidrRange::parse(s)
                .map(IpRule::Range)
                .ok_or_else(|| RuleParseError(s.to_string()))
        } else {
            s.parse::<IpAddr>()
                .map(|ip| IpRule::Exact(ip.to_canonical()))
                .map_err(|_| RuleParseError(s.to_string()))
        }
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(ip) => write!(f, "{ip}"),
            Self::Range(range) => write!(f, "{range}"),
        }
    }
}

/// Exact-match and range-match rules of one list.
#[derive(Debug, Default)]
struct RuleSet {
    exact: HashSet<IpAddr>,
    ranges: Vec<CidrRange>,
}

impl RuleSet {
    fn matches(&self, ip: &IpAddr) -> bool {
        self.exact.contains(ip) || self.ranges.iter().any(|range| range.contains(ip))
    }

    fn insert(&mut self, rule: IpRule) -> bool {
        match rule {
            IpRule::Exact(ip) => self.exact.insert(ip),
            IpRule::Range(range) => {
                if self.ranges.contains(&range) {
                    false
                } else {
                    self.ranges.push(range);
                    true
                }
            }
        }
    }

    fn remove(&mut self, rule: &IpRule) -> bool {
        match rule {
            IpRule::Exact(ip) => self.exact.remove(ip),
            IpRule::Range(range) => {
                let before = self.ranges.len();
                self.ranges.retain(|r| r != range);
                before != self.ranges.len()
            }
        }
    }

    fn to_strings(&self) -> Vec<String> {
        let mut rules: Vec<String> = self
            .exact
            .iter()
            .map(ToString::to_string)
            .chain(self.ranges.iter().map(ToString::to_string))
            .collect();
        rules.sort();
        rules
    }
}

#[derive(Debug, Default)]
struct RuleBook {
    allow: RuleSet,
    deny: RuleSet,
}

impl RuleBook {
    fn list_mut(&mut self, list: RuleList) -> &mut RuleSet {
        match list {
            RuleList::Allow => &mut self.allow,
            RuleList::Deny => &mut self.deny,
        }
    }
}

/// Point-in-time copy of the rule lists, for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSnapshot {
    pub mode: FilterMode,
    pub allow_private: bool,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Allow/deny admission filter with runtime-mutable rules.
#[derive(Debug)]
pub struct IpFilter {
    mode: FilterMode,
    allow_private: bool,
    private_ranges: Vec<CidrRange>,
    rules: RwLock<RuleBook>,
}

impl IpFilter {
    /// Build a filter from configuration.
    ///
    /// # Errors
    ///
    /// Returns `RuleParseError` for the first allow or deny entry that is
    /// neither an address nor a CIDR block.
    pub fn new(config: &IpFilterConfig) -> Result<Self, RuleParseError> {
        let mut book = RuleBook::default();
        for rule in &config.allow {
            book.allow.insert(rule.parse()?);
        }
        for rule in &config.deny {
            book.deny.insert(rule.parse()?);
        }

        Ok(Self {
            mode: config.mode,
            allow_private: config.allow_private,
            private_ranges: PRIVATE_RANGES
                .iter()
                .filter_map(|r| CidrRange::parse(r))
                .collect(),
            rules: RwLock::new(book),
        })
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Whether a textual address is admitted. Unparsable input is rejected.
    pub fn is_allowed(&self, address: &str) -> bool {
        parse_address(address).is_some_and(|ip| self.is_allowed_ip(ip))
    }

    pub fn is_allowed_ip(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        let rules = self.rules.read();
        match self.mode {
            FilterMode::AllowList => {
                rules.allow.matches(&ip)
                    || (self.allow_private && self.private_ranges.iter().any(|r| r.contains(&ip)))
            }
            FilterMode::DenyList => !rules.deny.matches(&ip),
        }
    }

    /// Add a rule. Returns `false` when it was already present.
    ///
    /// # Errors
    ///
    /// Returns `RuleParseError` if `rule` is not an address or CIDR block.
    pub fn add(&self, list: RuleList, rule: &str) -> Result<bool, RuleParseError> {
        let parsed: IpRule = rule.parse()?;
        let added = self.rules.write().list_mut(list).insert(parsed);
        info!(%list, rule = %parsed, added, "IP rule added");
        Ok(added)
    }

    /// Remove a rule. Returns `false` when it was not present.
    ///
    /// # Errors
    ///
    /// Returns `RuleParseError` if `rule` is not an address or CIDR block.
    pub fn remove(&self, list: RuleList, rule: &str) -> Result<bool, RuleParseError> {
        let parsed: IpRule = rule.parse()?;
        let removed = self.rules.write().list_mut(list).remove(&parsed);
        info!(%list, rule = %parsed, removed, "IP rule removed");
        Ok(removed)
    }

    pub fn add_allow(&self, rule: &str) -> Result<bool, RuleParseError> {
        self.add(RuleList::Allow, rule)
    }

    pub fn add_deny(&self, rule: &str) -> Result<bool, RuleParseError> {
        self.add(RuleList::Deny, rule)
    }

    pub fn remove_allow(&self, rule: &str) -> Result<bool, RuleParseError> {
        self.remove(RuleList::Allow, rule)
    }

    pub fn remove_deny(&self, rule: &str) -> Result<bool, RuleParseError> {
        self.remove(RuleList::Deny, rule)
    }

    pub fn snapshot(&self) -> RuleSnapshot {
        let rules = self.rules.read();
        RuleSnapshot {
            mode: self.mode,
            allow_private: self.allow_private,
            allow: rules.allow.to_strings(),
            deny: rules.deny.to_strings(),
        }
    }
}

// =============================================================================
// Admission Guard
// =============================================================================

/// First stage of the pipeline: resolves the client address, annotates the
/// context with it and rejects blocked or unresolvable clients with 403.
pub struct IpAdmission {
    filter: Arc<IpFilter>,
    resolver: Arc<ClientIpResolver>,
}

impl IpAdmission {
    pub fn new(filter: Arc<IpFilter>, resolver: Arc<ClientIpResolver>) -> Self {
        Self { filter, resolver }
    }
}

impl Guard for IpAdmission {
    fn name(&self) -> &'static str {
        "ip_filter"
    }

    fn inspect(&self, ctx: &mut RequestContext) -> Verdict {
        let Some(ip) = self.resolver.resolve(ctx) else {
            warn!(path = %ctx.path(), "Client address could not be resolved");
            return Verdict::Reject(AppError::Forbidden(
                "Client address could not be determined".to_string(),
            ));
        };
        ctx.client_ip = Some(ip);

        if self.filter.is_allowed_ip(ip) {
            debug!(client_ip = %ip, "IP admitted");
            Verdict::Continue
        } else {
            warn!(client_ip = %ip, path = %ctx.path(), mode = %self.filter.mode(), "IP blocked");
            Verdict::Reject(AppError::Forbidden("IP address not allowed".to_string()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::thread;

    fn filter(mode: FilterMode, allow: &[&str], deny: &[&str], allow_private: bool) -> IpFilter {
        IpFilter::new(&IpFilterConfig {
            mode,
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            allow_private,
            ..IpFilterConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_allow_list_cidr_and_exact() {
        let f = filter(
            FilterMode::AllowList,
            &["203.0.113.0/24", "198.51.100.7"],
            &[],
            false,
        );

        assert!(f.is_allowed("203.0.113.200"));
        assert!(f.is_allowed("198.51.100.7"));
        assert!(!f.is_allowed("198.51.100.8"));
        assert!(!f.is_allowed("8.8.8.8"));
    }

    #[test]
    fn test_allow_list_private_carve_out() {
        let strict = filter(FilterMode::AllowList, &[], &[], false);
        assert!(!strict.is_allowed("10.1.2.3"));
        assert!(!strict.is_allowed("127.0.0.1"));

        let relaxed = filter(FilterMode::AllowList, &[], &[], true);
        for ip in ["10.1.2.3", "172.20.0.1", "192.168.1.1", "127.0.0.1", "::1", "fd00::1"] {
            assert!(relaxed.is_allowed(ip), "{ip} should be admitted");
        }
        assert!(!relaxed.is_allowed("172.32.0.1"));
        assert!(!relaxed.is_allowed("8.8.8.8"));
    }

    #[test]
    fn test_deny_list_blocks_matches_only() {
        let f = filter(FilterMode::DenyList, &[], &["192.0.2.0/24", "2001:db8::1"], false);

        assert!(!f.is_allowed("192.0.2.55"));
        assert!(!f.is_allowed("2001:db8::1"));
        assert!(f.is_allowed("2001:db8::2"));
        assert!(f.is_allowed("198.51.100.1"));
    }

    #[test]
    fn test_unparsable_address_is_rejected() {
        let f = filter(FilterMode::DenyList, &[], &[], false);
        assert!(!f.is_allowed("not-an-ip"));
        assert!(!f.is_allowed(""));
    }

    #[test]
    fn test_mapped_address_matches_ipv4_rule() {
        let f = filter(FilterMode::DenyList, &[], &["192.0.2.1"], false);
        assert!(!f.is_allowed("::ffff:192.0.2.1"));
    }

    #[test]
    fn test_dynamic_add_and_remove() {
        let f = filter(FilterMode::DenyList, &[], &[], false);
        assert!(f.is_allowed("192.0.2.9"));

        assert!(f.add_deny("192.0.2.0/24").unwrap());
        assert!(!f.add_deny("192.0.2.0/24").unwrap());
        assert!(!f.is_allowed("192.0.2.9"));

        // Host bits are ignored when removing a range
        assert!(f.remove_deny("192.0.2.77/24").unwrap());
        assert!(f.is_allowed("192.0.2.9"));
        assert!(!f.remove_deny("192.0.2.0/24").unwrap());
    }

    #[test]
    fn test_invalid_rule_is_an_error() {
        let f = filter(FilterMode::AllowList, &[], &[], false);
        assert!(f.add_allow("300.1.1.1").is_err());
        assert!(f.add_allow("10.0.0.0/40").is_err());
        assert!(
            IpFilter::new(&IpFilterConfig {
                deny: vec!["garbage".into()],
                ..IpFilterConfig::default()
            })
            .is_err()
        );
    }

    #[test]
    fn test_snapshot_lists_rules() {
        let f = filter(FilterMode::AllowList, &["10.0.0.0/8"], &["192.0.2.1"], true);
        let snap = f.snapshot();
        assert_eq!(snap.mode, FilterMode::AllowList);
        assert!(snap.allow_private);
        assert_eq!(snap.allow, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(snap.deny, vec!["192.0.2.1".to_string()]);
    }

    #[test]
    fn test_concurrent_lookups_and_mutations() {
        let f = Arc::new(filter(FilterMode::AllowList, &["198.51.100.0/24"], &[], false));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let f = Arc::clone(&f);
                thread::spawn(move || {
                    for n in 0..200u32 {
                        let rule = format!("203.0.{i}.{}", n % 250);
                        f.add_allow(&rule).unwrap();
                        assert!(f.is_allowed("198.51.100.10"));
                        f.remove_allow(&rule).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(f.snapshot().allow, vec!["198.51.100.0/24".to_string()]);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("whitelist".parse::<FilterMode>().unwrap(), FilterMode::AllowList);
        assert_eq!("deny_list".parse::<FilterMode>().unwrap(), FilterMode::DenyList);
        assert!("maybe".parse::<FilterMode>().is_err());
    }
}
