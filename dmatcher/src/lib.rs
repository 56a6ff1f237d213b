#![deny(missing_docs)]
// Documentation
//! Rule parsing and matching for the resolver's filtering layer.
//!
//! This crate owns the bits that used to be a pure domain-suffix trie:
//! it now classifies rule text into typed records (`records`), parses
//! rule files into those records (`parser`), implements the glob
//! dialect the rule files use (`glob`), and holds the compiled,
//! read-mostly index the query pipeline consults at serve time
//! (`store`).
//!
//! # Getting Started
//!
//! ```
//! use dmatcher::records::BlockedName;
//! use dmatcher::store::RuleStore;
//!
//! let mut store = RuleStore::new();
//! store.insert_blocked_name(BlockedName::new("default", "ads.example.com"));
//! assert!(store.match_blocked_name("192.168.0.5", "ads.example.com").is_some());
//! ```

/// Glob matching dialect used by rule patterns (`*`, `?`, `[...]`).
pub mod glob;
/// Rule-file text parsing (comment stripping, tokenizing, classification).
pub mod parser;
/// Typed rule records shared by the parser and the store.
pub mod records;
/// The compiled, group-scoped rule index consulted by the query pipeline.
pub mod store;

pub use records::{
    AllowedIp, AllowedName, BlockedIp, BlockedName, CloakingRecordType, CloakingRule,
    ForwardingName,
};
pub use store::RuleStore;
