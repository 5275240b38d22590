//! Access-control engine: classifies a destination as bypass (connect
//! direct), proxy (send to the relay) or block (refuse outright).
//!
//! The rule file is line oriented. Bracketed section headers select the
//! active set; entries are either `host[/cidr]` IP literals, collected
//! into per-family prefix sets, or regex patterns matched against
//! hostnames. `[bypass_all]`/`[proxy_all]` (and their aliases) pick the
//! default for unmatched destinations.

mod ipset;

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::warn;

use crate::error::{ProxyError, Result};
pub use ipset::PrefixSet;

/// Longest accepted rule line, matching the loader's historical cap.
const MAX_RULE_LINE: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclMode {
    /// Unmatched destinations go to the relay.
    ProxyAll,
    /// Unmatched destinations connect direct.
    BypassAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclClass {
    Bypass,
    Proxy,
    Block,
}

impl fmt::Display for AclClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclClass::Bypass => f.write_str("bypass"),
            AclClass::Proxy => f.write_str("proxy"),
            AclClass::Block => f.write_str("block"),
        }
    }
}

#[derive(Default)]
pub struct RuleSet {
    nets: PrefixSet,
    patterns: Vec<Regex>,
}

impl RuleSet {
    fn add_line(&mut self, line: &str) {
        let (host, cidr) = split_addr_cidr(line);
        if let Ok(ip) = host.parse::<IpAddr>() {
            if let Err(e) = self.nets.add(ip, cidr) {
                warn!(rule = line, error = %e, "discarding acl entry");
            }
            return;
        }
        // Not an IP literal: the whole line is a hostname pattern.
        match Regex::new(line) {
            Ok(re) => self.patterns.push(re),
            Err(e) => warn!(rule = line, error = %e, "discarding unparsable acl pattern"),
        }
    }

    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.nets.contains(ip)
    }

    pub fn matches_name(&self, host: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(host))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty() && self.patterns.is_empty()
    }
}

/// Split `host[/cidr]` at the last slash, the way the rule loader
/// always has. A non-numeric suffix means the line was never a CIDR to
/// begin with and falls through to pattern handling.
fn split_addr_cidr(line: &str) -> (&str, Option<u8>) {
    match line.rfind('/') {
        Some(pos) => match line[pos + 1..].parse::<u8>() {
            Ok(cidr) => (&line[..pos], Some(cidr)),
            Err(_) => (line, None),
        },
        None => (line, None),
    }
}

pub struct Acl {
    bypass: RuleSet,
    proxy: RuleSet,
    outbound_block: RuleSet,
    mode: AclMode,
}

impl Acl {
    pub fn load(path: &Path) -> Result<Acl> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read acl file {}: {e}", path.display()))
        })?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Acl {
        let mut acl = Acl {
            bypass: RuleSet::default(),
            proxy: RuleSet::default(),
            outbound_block: RuleSet::default(),
            mode: AclMode::ProxyAll,
        };

        // Entries belong to the bypass set until a header says otherwise.
        let mut active = Section::Bypass;

        for raw in text.lines() {
            if raw.len() > MAX_RULE_LINE {
                warn!(len = raw.len(), "discarding overlong acl line");
                continue;
            }
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match line {
                "[outbound_block_list]" => active = Section::OutboundBlock,
                "[black_list]" | "[bypass_list]" => active = Section::Bypass,
                "[white_list]" | "[proxy_list]" => active = Section::Proxy,
                "[reject_all]" | "[bypass_all]" => acl.mode = AclMode::BypassAll,
                "[accept_all]" | "[proxy_all]" => acl.mode = AclMode::ProxyAll,
                _ if line.starts_with('[') && line.ends_with(']') => {
                    // Unknown header: following lines keep the previous
                    // section.
                    warn!(section = line, "ignoring unknown acl section");
                }
                entry => {
                    let set = match active {
                        Section::Bypass => &mut acl.bypass,
                        Section::Proxy => &mut acl.proxy,
                        Section::OutboundBlock => &mut acl.outbound_block,
                    };
                    set.add_line(entry);
                }
            }
        }
        acl
    }

    pub fn mode(&self) -> AclMode {
        self.mode
    }

    /// Outbound-block check: IP sets for literals, patterns for names.
    pub fn blocked(&self, host: &str) -> bool {
        match host.parse::<IpAddr>() {
            Ok(ip) => self.outbound_block.contains_ip(ip),
            Err(_) => self.outbound_block.matches_name(host),
        }
    }

    /// `+1` in the bypass set, `-1` in the proxy set, `0` unmatched;
    /// bypass wins when both match.
    pub fn match_host(&self, host: &str) -> i8 {
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                if self.bypass.contains_ip(ip) {
                    1
                } else if self.proxy.contains_ip(ip) {
                    -1
                } else {
                    0
                }
            }
            Err(_) => {
                if self.bypass.matches_name(host) {
                    1
                } else if self.proxy.matches_name(host) {
                    -1
                } else {
                    0
                }
            }
        }
    }

    pub fn classify(&self, host: &str) -> AclClass {
        if self.blocked(host) {
            return AclClass::Block;
        }
        match self.match_host(host) {
            1 => AclClass::Bypass,
            -1 => AclClass::Proxy,
            _ => match self.mode {
                AclMode::BypassAll => AclClass::Bypass,
                AclMode::ProxyAll => AclClass::Proxy,
            },
        }
    }
}

enum Section {
    Bypass,
    Proxy,
    OutboundBlock,
}

/// Swap-able ACL snapshot shared between the accept loops and the
/// reload watcher. `None` means the ACL is disabled and every
/// destination is relayed.
#[derive(Clone, Default)]
pub struct AclHandle {
    inner: Arc<RwLock<Option<Arc<Acl>>>>,
}

impl AclHandle {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(acl: Acl) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(Arc::new(acl)))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.read().is_some()
    }

    pub fn snapshot(&self) -> Option<Arc<Acl>> {
        self.inner.read().clone()
    }

    pub fn replace(&self, acl: Acl) {
        *self.inner.write() = Some(Arc::new(acl));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_and_aliases() {
        let acl = Acl::parse(
            "[bypass_list]\n10.0.0.0/8\n[proxy_list]\n8.8.8.8\n[outbound_block_list]\nfacebook\\.com\n",
        );
        assert_eq!(acl.match_host("10.1.2.3"), 1);
        assert_eq!(acl.match_host("8.8.8.8"), -1);
        assert!(acl.blocked("graph.facebook.com"));
        assert!(!acl.blocked("example.com"));

        let aliased = Acl::parse("[black_list]\n192.168.0.0/16\n[white_list]\n1.1.1.1\n");
        assert_eq!(aliased.match_host("192.168.4.4"), 1);
        assert_eq!(aliased.match_host("1.1.1.1"), -1);
    }

    #[test]
    fn default_mode_headers() {
        assert_eq!(Acl::parse("").mode(), AclMode::ProxyAll);
        assert_eq!(Acl::parse("[bypass_all]\n").mode(), AclMode::BypassAll);
        assert_eq!(Acl::parse("[reject_all]\n").mode(), AclMode::BypassAll);
        assert_eq!(
            Acl::parse("[bypass_all]\n[accept_all]\n").mode(),
            AclMode::ProxyAll
        );
    }

    #[test]
    fn classify_follows_default_mode() {
        let proxy_all = Acl::parse("[proxy_all]\n[bypass_list]\n10.0.0.0/8\n");
        assert_eq!(proxy_all.classify("10.9.9.9"), AclClass::Bypass);
        assert_eq!(proxy_all.classify("203.0.113.7"), AclClass::Proxy);

        let bypass_all = Acl::parse("[bypass_all]\n[proxy_list]\nexample\\.org\n");
        assert_eq!(bypass_all.classify("anything.net"), AclClass::Bypass);
        assert_eq!(bypass_all.classify("example.org"), AclClass::Proxy);
    }

    #[test]
    fn hostname_entries_become_patterns() {
        let acl = Acl::parse("[bypass_list]\nexample.com$\n");
        assert_eq!(acl.match_host("example.com"), 1);
        assert_eq!(acl.match_host("www.example.com"), 1);
        assert_eq!(acl.match_host("example.com.evil.net"), 0);
    }

    #[test]
    fn ipv6_networks() {
        let acl = Acl::parse("[bypass_list]\n2001:db8::/32\nfe80::1\n");
        assert_eq!(acl.match_host("2001:db8::42"), 1);
        assert_eq!(acl.match_host("fe80::1"), 1);
        assert_eq!(acl.match_host("2001:db9::1"), 0);
    }

    #[test]
    fn comments_and_blank_lines() {
        let acl = Acl::parse("# header comment\n\n[bypass_list]\n10.0.0.1 # trailing\n   \n");
        assert_eq!(acl.match_host("10.0.0.1"), 1);
    }

    #[test]
    fn overlong_line_discarded() {
        let long = format!("[bypass_list]\n{}\n10.0.0.1\n", "a".repeat(300));
        let acl = Acl::parse(&long);
        assert_eq!(acl.match_host("10.0.0.1"), 1);
        assert_eq!(acl.match_host("aaaa"), 0);
    }

    #[test]
    fn unknown_section_falls_through() {
        let acl = Acl::parse("[proxy_list]\n[future_list]\n4.4.4.4\n");
        assert_eq!(acl.match_host("4.4.4.4"), -1);
    }

    #[test]
    fn invalid_cidr_suffix_is_pattern() {
        // "example.com/questionable" is not host/cidr, the whole line is
        // treated as a pattern.
        let acl = Acl::parse("[bypass_list]\nexample.com/x\n");
        assert_eq!(acl.match_host("example.com/x"), 1);
    }

    #[test]
    fn handle_swaps_snapshots() {
        let handle = AclHandle::disabled();
        assert!(!handle.is_enabled());
        handle.replace(Acl::parse("[bypass_list]\n10.0.0.0/8\n"));
        assert!(handle.is_enabled());
        let snap = handle.snapshot().unwrap();
        assert_eq!(snap.match_host("10.0.0.1"), 1);
    }
}
