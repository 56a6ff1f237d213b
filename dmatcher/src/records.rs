//! Typed rule records. Every record carries the group it was loaded
//! into and whether its pattern should be interpreted as a glob.

use crate::glob::is_glob;

/// `default` and `temp` apply to every client; anything else is itself
/// a glob matched against the querying client's IP address.
pub const UNIVERSAL_GROUPS: [&str; 2] = ["default", "temp"];

fn is_universal(group: &str) -> bool {
    UNIVERSAL_GROUPS.contains(&group)
}

macro_rules! pattern_record {
    ($name:ident, $field:ident) => {
        #[doc = concat!("A parsed `", stringify!($name), "` rule.")]
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            /// Group this rule was loaded into.
            pub group: String,
            /// The rule's pattern, already lowercased.
            pub $field: String,
            /// True if `pattern` contains a glob metacharacter.
            pub use_glob: bool,
        }

        impl $name {
            /// Build a record, inferring `use_glob` from the pattern text.
            pub fn new(group: impl Into<String>, pattern: impl Into<String>) -> Self {
                let pattern = pattern.into();
                let use_glob = is_glob(&pattern);
                Self {
                    group: group.into(),
                    $field: pattern,
                    use_glob,
                }
            }

            /// True if this record's group applies regardless of client.
            pub fn is_universal_group(&self) -> bool {
                is_universal(&self.group)
            }
        }
    };
}

pattern_record!(AllowedIp, ip);
pattern_record!(BlockedIp, ip);
pattern_record!(AllowedName, name);
pattern_record!(BlockedName, name);
pattern_record!(ForwardingName, name);

/// The kind of answer a cloaking rule synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloakingRecordType {
    /// `mapped` is an IPv4 literal; synthesize an A record.
    A,
    /// `mapped` is an IPv6 literal; synthesize an AAAA record.
    Aaaa,
    /// `mapped` is another domain name; chase it as a CNAME.
    Cname,
}

/// A parsed cloaking rule: `name -> mapped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloakingRule {
    /// Group this rule was loaded into.
    pub group: String,
    /// The queried name pattern, already lowercased.
    pub name: String,
    /// True if `name` contains a glob metacharacter.
    pub use_glob: bool,
    /// What `mapped` represents.
    pub record_type: CloakingRecordType,
    /// The synthesized target: an IP literal or a CNAME target.
    pub mapped: String,
}

impl CloakingRule {
    /// Build a cloaking record, classifying `mapped` by attempting to
    /// parse it as an IPv4 or IPv6 literal; anything else is a CNAME.
    pub fn new(group: impl Into<String>, name: impl Into<String>, mapped: impl Into<String>) -> Self {
        let name = name.into();
        let mapped = mapped.into();
        let record_type = classify_mapped(&mapped);
        let use_glob = is_glob(&name);
        Self {
            group: group.into(),
            name,
            use_glob,
            record_type,
            mapped,
        }
    }

    /// True if this record's group applies regardless of client.
    pub fn is_universal_group(&self) -> bool {
        is_universal(&self.group)
    }
}

fn classify_mapped(mapped: &str) -> CloakingRecordType {
    if mapped.parse::<std::net::Ipv4Addr>().is_ok() {
        CloakingRecordType::A
    } else if mapped.parse::<std::net::Ipv6Addr>().is_ok() {
        CloakingRecordType::Aaaa
    } else {
        CloakingRecordType::Cname
    }
}
