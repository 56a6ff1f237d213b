//! The compiled, group-scoped rule index (C2). Built once at startup
//! from parsed rule records and consulted read-only by the query
//! pipeline for the lifetime of the process.

use crate::glob::glob_match;
use crate::records::{
    AllowedIp, AllowedName, BlockedIp, BlockedName, CloakingRecordType, CloakingRule,
    ForwardingName,
};

const MAX_CLOAKING_HOPS: usize = 5;

/// A name or IP rule record: something with a group, a pattern, and a
/// glob flag, which is all the generic matcher needs.
trait Pattern {
    fn group(&self) -> &str;
    fn pattern_text(&self) -> &str;
    fn use_glob(&self) -> bool;
    fn is_universal_group(&self) -> bool;
}

macro_rules! impl_pattern {
    ($ty:ty, $field:ident) => {
        impl Pattern for $ty {
            fn group(&self) -> &str {
                &self.group
            }
            fn pattern_text(&self) -> &str {
                &self.$field
            }
            fn use_glob(&self) -> bool {
                self.use_glob
            }
            fn is_universal_group(&self) -> bool {
                Self::is_universal_group(self)
            }
        }
    };
}

impl_pattern!(AllowedIp, ip);
impl_pattern!(BlockedIp, ip);
impl_pattern!(AllowedName, name);
impl_pattern!(BlockedName, name);
impl_pattern!(ForwardingName, name);
impl_pattern!(CloakingRule, name);

fn group_applies(rec: &impl Pattern, client_ip: &str) -> bool {
    rec.is_universal_group() || glob_match(rec.group(), client_ip)
}

/// Name-side pattern match: literal suffix/exact/`=exact`, or glob
/// against the pattern itself and against `*.pattern`.
fn name_matches(rec: &impl Pattern, query: &str) -> bool {
    let pattern = rec.pattern_text();
    if rec.use_glob() {
        glob_match(pattern, query) || glob_match(&format!("*.{pattern}"), query)
    } else if let Some(exact) = pattern.strip_prefix('=') {
        query == exact
    } else {
        query == pattern || query.ends_with(&format!(".{pattern}"))
    }
}

/// IP-side pattern match: literal equality, or glob against the
/// pattern text.
fn ip_matches(rec: &impl Pattern, query: &str) -> bool {
    let pattern = rec.pattern_text();
    if rec.use_glob() {
        glob_match(pattern, query)
    } else {
        query == pattern
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScopeTieBreak {
    /// Prefer a client-scoped (non-universal) group over a universal one.
    PreferClientScoped,
    /// Prefer the longest pattern text (most specific suffix/glob).
    PreferLongestPattern,
}

/// Apply the shared tie-break order: exact-marker wins, then exact
/// string equality, then the scope-specific rule, then first-inserted.
fn pick_best<'a, R: Pattern>(
    candidates: Vec<&'a R>,
    query: &str,
    scope_rule: ScopeTieBreak,
) -> Option<&'a R> {
    if candidates.is_empty() {
        return None;
    }
    if let Some(r) = candidates
        .iter()
        .find(|r| r.pattern_text().starts_with('='))
    {
        return Some(r);
    }
    if let Some(r) = candidates.iter().find(|r| r.pattern_text() == query) {
        return Some(r);
    }
    match scope_rule {
        ScopeTieBreak::PreferClientScoped => {
            if let Some(r) = candidates.iter().find(|r| !r.is_universal_group()) {
                return Some(r);
            }
        }
        ScopeTieBreak::PreferLongestPattern => {
            if let Some(r) = candidates
                .iter()
                .max_by_key(|r| r.pattern_text().len())
            {
                return Some(r);
            }
        }
    }
    candidates.into_iter().next()
}

/// Decision produced by a combined allow/block lookup: allowed always
/// wins over blocked when both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// An allow rule matched (and wins regardless of any block match).
    Allowed,
    /// A block rule matched and no allow rule did.
    Blocked,
}

/// The compiled rule index. Construction is append-only; lookups are
/// read-only and safe to share behind an `Arc`.
#[derive(Debug, Default, Clone)]
pub struct RuleStore {
    allowed_ips: Vec<AllowedIp>,
    blocked_ips: Vec<BlockedIp>,
    allowed_names: Vec<AllowedName>,
    blocked_names: Vec<BlockedName>,
    cloaking_rules: Vec<CloakingRule>,
    forwarding_rules: Vec<ForwardingName>,
}

impl RuleStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one allowed-IP rule, preserving insertion order.
    pub fn insert_allowed_ip(&mut self, rec: AllowedIp) {
        self.allowed_ips.push(rec);
    }
    /// Insert one blocked-IP rule, preserving insertion order.
    pub fn insert_blocked_ip(&mut self, rec: BlockedIp) {
        self.blocked_ips.push(rec);
    }
    /// Insert one allowed-name rule, preserving insertion order.
    pub fn insert_allowed_name(&mut self, rec: AllowedName) {
        self.allowed_names.push(rec);
    }
    /// Insert one blocked-name rule, preserving insertion order.
    pub fn insert_blocked_name(&mut self, rec: BlockedName) {
        self.blocked_names.push(rec);
    }
    /// Insert one cloaking rule, preserving insertion order.
    pub fn insert_cloaking_rule(&mut self, rec: CloakingRule) {
        self.cloaking_rules.push(rec);
    }
    /// Insert one forwarding rule, preserving insertion order.
    pub fn insert_forwarding_rule(&mut self, rec: ForwardingName) {
        self.forwarding_rules.push(rec);
    }

    /// Best-matching allowed-name rule for `(client_ip, name)`.
    pub fn match_allowed_name(&self, client_ip: &str, name: &str) -> Option<&AllowedName> {
        let candidates: Vec<&AllowedName> = self
            .allowed_names
            .iter()
            .filter(|r| group_applies(r, client_ip) && name_matches(r, name))
            .collect();
        pick_best(candidates, name, ScopeTieBreak::PreferClientScoped)
    }

    /// Best-matching blocked-name rule for `(client_ip, name)`.
    pub fn match_blocked_name(&self, client_ip: &str, name: &str) -> Option<&BlockedName> {
        let candidates: Vec<&BlockedName> = self
            .blocked_names
            .iter()
            .filter(|r| group_applies(r, client_ip) && name_matches(r, name))
            .collect();
        pick_best(candidates, name, ScopeTieBreak::PreferClientScoped)
    }

    /// Best-matching allowed-IP rule for `(client_ip, ip)`.
    pub fn match_allowed_ip(&self, client_ip: &str, ip: &str) -> Option<&AllowedIp> {
        let candidates: Vec<&AllowedIp> = self
            .allowed_ips
            .iter()
            .filter(|r| group_applies(r, client_ip) && ip_matches(r, ip))
            .collect();
        pick_best(candidates, ip, ScopeTieBreak::PreferClientScoped)
    }

    /// Best-matching blocked-IP rule for `(client_ip, ip)`.
    pub fn match_blocked_ip(&self, client_ip: &str, ip: &str) -> Option<&BlockedIp> {
        let candidates: Vec<&BlockedIp> = self
            .blocked_ips
            .iter()
            .filter(|r| group_applies(r, client_ip) && ip_matches(r, ip))
            .collect();
        pick_best(candidates, ip, ScopeTieBreak::PreferClientScoped)
    }

    /// Combined name decision: allowed wins over blocked.
    pub fn match_name_decision(&self, client_ip: &str, name: &str) -> Option<Decision> {
        if self.match_allowed_name(client_ip, name).is_some() {
            Some(Decision::Allowed)
        } else if self.match_blocked_name(client_ip, name).is_some() {
            Some(Decision::Blocked)
        } else {
            None
        }
    }

    /// Combined IP decision: allowed wins over blocked.
    pub fn match_ip_decision(&self, client_ip: &str, ip: &str) -> Option<Decision> {
        if self.match_allowed_ip(client_ip, ip).is_some() {
            Some(Decision::Allowed)
        } else if self.match_blocked_ip(client_ip, ip).is_some() {
            Some(Decision::Blocked)
        } else {
            None
        }
    }

    /// Best-matching forwarding rule for `name` (no client scoping).
    pub fn match_forwarding(&self, name: &str) -> Option<&ForwardingName> {
        let candidates: Vec<&ForwardingName> = self
            .forwarding_rules
            .iter()
            .filter(|r| name_matches(r, name))
            .collect();
        pick_best(candidates, name, ScopeTieBreak::PreferLongestPattern)
    }

    /// All cloaking rules sharing the single winning pattern for `name`.
    pub fn match_cloaking(&self, name: &str) -> Vec<&CloakingRule> {
        let candidates: Vec<&CloakingRule> = self
            .cloaking_rules
            .iter()
            .filter(|r| name_matches(r, name))
            .collect();
        let winner = match pick_best(candidates.clone(), name, ScopeTieBreak::PreferLongestPattern)
        {
            Some(w) => w,
            None => return Vec::new(),
        };
        candidates
            .into_iter()
            .filter(|r| r.name == winner.name)
            .collect()
    }

    /// Follow a cloaking CNAME chain up to [`MAX_CLOAKING_HOPS`] hops,
    /// returning the records matched at the final name.
    pub fn match_cloaking_resolved(&self, name: &str) -> Vec<&CloakingRule> {
        let mut current = name.to_string();
        let mut result = self.match_cloaking(&current);

        for _ in 0..MAX_CLOAKING_HOPS {
            let cname = result
                .iter()
                .find(|r| r.record_type == CloakingRecordType::Cname);
            let next_name = match cname {
                Some(r) => r.mapped.clone(),
                None => break,
            };
            let next = self.match_cloaking(&next_name);
            if next.is_empty() {
                break;
            }
            current = next_name;
            result = next;
        }
        let _ = current;
        result.truncate(MAX_CLOAKING_HOPS);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_scenario_1() -> RuleStore {
        let mut s = RuleStore::new();
        s.insert_allowed_ip(AllowedIp::new("default", "10.10.10.1[1-2]"));
        s
    }

    #[test]
    fn scenario_1_allowed_ip_glob_range() {
        let s = store_with_scenario_1();
        let m = s.match_allowed_ip("192.168.0.100", "10.10.10.11").unwrap();
        assert_eq!(m.ip, "10.10.10.1[1-2]");
        assert!(s.match_allowed_ip("192.168.0.100", "10.10.10.13").is_none());
    }

    #[test]
    fn scenario_2_client_scoped_beats_universal() {
        let mut s = RuleStore::new();
        s.insert_allowed_name(AllowedName::new("default", "co"));
        s.insert_allowed_name(AllowedName::new("192.168.1.100", "def.co"));
        let m = s
            .match_allowed_name("192.168.1.100", "www.def.co")
            .unwrap();
        assert_eq!(m.group, "192.168.1.100");
        assert_eq!(m.name, "def.co");
    }

    #[test]
    fn scenario_3_allowed_wins_over_blocked() {
        let mut s = RuleStore::new();
        s.insert_blocked_ip(BlockedIp::new("default", "10.10.10.10"));
        s.insert_allowed_ip(AllowedIp::new("192.168.1.100", "10.10.10.10"));
        let decision = s.match_ip_decision("192.168.1.100", "10.10.10.10").unwrap();
        assert_eq!(decision, Decision::Allowed);
    }

    #[test]
    fn scenario_4_cloaking_chase_prefers_matching_qtype() {
        let mut s = RuleStore::new();
        s.insert_cloaking_rule(CloakingRule::new("default", "=epicgames.com", "1.1.1.1"));
        s.insert_cloaking_rule(CloakingRule::new("default", "=epicgames.com", "1.1.1.2"));
        s.insert_cloaking_rule(CloakingRule::new("default", "=epicgames.com", "1.1.1.3"));
        s.insert_cloaking_rule(CloakingRule::new(
            "default",
            "www.epicgames.com",
            "epicgames.com",
        ));
        let resolved = s.match_cloaking_resolved("www.epicgames.com");
        assert_eq!(resolved.len(), 3);
        assert!(resolved
            .iter()
            .all(|r| r.record_type == CloakingRecordType::A));
    }

    #[test]
    fn scenario_5_forwarding_longest_match_wins() {
        let mut s = RuleStore::new();
        s.insert_forwarding_rule(ForwardingName::new("somewhere", "xyz.com"));
        s.insert_forwarding_rule(ForwardingName::new("google", "abc*.xyz.com"));
        let m = s.match_forwarding("abc2.xyz.com").unwrap();
        assert_eq!(m.group, "google");
    }

    #[test]
    fn exact_marker_dominates() {
        let mut s = RuleStore::new();
        s.insert_blocked_name(BlockedName::new("default", "foo.com"));
        s.insert_blocked_name(BlockedName::new("default", "=foo.com"));
        let m = s.match_blocked_name("1.2.3.4", "foo.com").unwrap();
        assert_eq!(m.name, "=foo.com");
    }

    #[test]
    fn group_scope_hides_rule_from_other_clients() {
        let mut s = RuleStore::new();
        s.insert_blocked_name(BlockedName::new("192.168.1.*", "ads.example.com"));
        assert!(s
            .match_blocked_name("192.168.1.50", "ads.example.com")
            .is_some());
        assert!(s.match_blocked_name("10.0.0.1", "ads.example.com").is_none());
    }
}
