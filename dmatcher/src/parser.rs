//! Turns raw rule-file text into typed rule records (C1). Never fails
//! the whole file: malformed lines are skipped with a `log::warn!`.

use crate::records::{
    AllowedIp, AllowedName, BlockedIp, BlockedName, CloakingRule, ForwardingName,
};
use hashbrown::HashSet;

/// Strip `#` comments, drop blank lines, lowercase, dedupe and sort.
///
/// Mirrors the rule-file tokenizer: a comment consumes the rest of its
/// line, tokens may not contain internal whitespace.
pub fn parse_line(text: &str) -> Vec<String> {
    let mut set: HashSet<String> = HashSet::new();
    for raw in text.lines() {
        let without_comment = match raw.find('#') {
            Some(idx) => &raw[..idx],
            None => raw,
        };
        let token = without_comment.trim();
        if token.is_empty() {
            continue;
        }
        if token.split_whitespace().count() != 1 {
            log::warn!("skipping rule line with internal whitespace: {:?}", raw);
            continue;
        }
        set.insert(token.to_lowercase());
    }
    let mut out: Vec<String> = set.into_iter().collect();
    out.sort();
    out
}

macro_rules! parse_pattern_file {
    ($fn_name:ident, $record:ident) => {
        #[doc = concat!("Parse a rule file into a list of `", stringify!($record), "`.")]
        pub fn $fn_name(group: &str, text: &str) -> Vec<$record> {
            parse_line(text)
                .into_iter()
                .map(|pattern| $record::new(group, pattern))
                .collect()
        }
    };
}

parse_pattern_file!(parse_allowed_ips, AllowedIp);
parse_pattern_file!(parse_blocked_ips, BlockedIp);
parse_pattern_file!(parse_allowed_names, AllowedName);
parse_pattern_file!(parse_blocked_names, BlockedName);
parse_pattern_file!(parse_forwarding_rules, ForwardingName);

/// Parse a cloaking rule file: `<name> <mapped>` per line, two
/// whitespace-separated tokens after comment/blank stripping.
pub fn parse_cloaking_rules(group: &str, text: &str) -> Vec<CloakingRule> {
    let mut set: HashSet<(String, String)> = HashSet::new();

    for raw in text.lines() {
        let without_comment = match raw.find('#') {
            Some(idx) => &raw[..idx],
            None => raw,
        };
        let line = without_comment.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 2 {
            log::warn!("skipping cloaking rule with != 2 tokens: {:?}", raw);
            continue;
        }
        let name = tokens[0].to_lowercase();
        let mapped = tokens[1].to_lowercase();
        if name == mapped {
            log::warn!("skipping cloaking rule mapping a name to itself: {:?}", raw);
            continue;
        }
        set.insert((name, mapped));
    }

    let mut pairs: Vec<(String, String)> = set.into_iter().collect();
    pairs.sort();

    let mut out = Vec::with_capacity(pairs.len());
    for (name, mapped) in pairs {
        let rule = CloakingRule::new(group, name, mapped);
        let mapped_is_glob_non_ip =
            matches!(rule.record_type, crate::records::CloakingRecordType::Cname) && crate::glob::is_glob(&rule.mapped);
        if mapped_is_glob_non_ip {
            log::warn!(
                "skipping cloaking rule with a glob-like CNAME target: {} -> {}",
                rule.name,
                rule.mapped
            );
            continue;
        }
        out.push(rule);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_and_blanks() {
        let text = "\n\n123 # x\n  # y\n1234  #z\n12345\n";
        assert_eq!(parse_line(text), vec!["123", "1234", "12345"]);
    }

    #[test]
    fn dedupes_case_insensitively() {
        let rules = parse_cloaking_rules(
            "default",
            "www.abc.com abc.com\nWWW.ABC.COM ABC.COM\n",
        );
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "www.abc.com");
        assert_eq!(rules[0].mapped, "abc.com");
    }

    #[test]
    fn classifies_glob_allowed_ip() {
        let rules = parse_allowed_ips("default", "10.10.10.1[1-2]\n10.10.10.10\n");
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().any(|r| r.use_glob && r.ip == "10.10.10.1[1-2]"));
        assert!(rules.iter().any(|r| !r.use_glob && r.ip == "10.10.10.10"));
    }

    #[test]
    fn skips_self_mapped_cloaking_rule() {
        let rules = parse_cloaking_rules("default", "abc.com abc.com\n");
        assert!(rules.is_empty());
    }

    #[test]
    fn cloaking_classifies_ip_and_cname() {
        let rules = parse_cloaking_rules(
            "default",
            "a.example.com 1.2.3.4\nb.example.com ::1\nc.example.com upstream.example.com\n",
        );
        assert_eq!(rules.len(), 3);
        use crate::records::CloakingRecordType::*;
        assert_eq!(rules[0].record_type, A);
        assert_eq!(rules[1].record_type, Aaaa);
        assert_eq!(rules[2].record_type, Cname);
    }
}
