//! Domain blocklist evaluation
//!
//! Blocklists are consulted twice per transaction: on the question's qname
//! before any transport is contacted, and on CNAME targets in the real
//! answer. The filter itself is pluggable; [`StaticDomainFilter`] is an
//! in-memory implementation with parent-domain matching.

use dashmap::DashMap;

/// Evaluates domains against a set of named blocklists.
pub trait DomainFilter: Send + Sync {
    /// Blocklist names (csv) matched by `qname`, or `None` when unblocked.
    fn block_question(&self, qname: &str, qtype: u16) -> Option<String>;

    /// Blocklist names (csv) matched by any answer-side CNAME target.
    fn block_answer(&self, targets: &[String]) -> Option<String> {
        targets
            .iter()
            .find_map(|t| self.block_question(t, 0))
    }
}

/// In-memory blocklist: exact domains and their parents.
///
/// A domain blocks itself and every subdomain: adding `ads.example` to a
/// list blocks `ads.example` and `track.ads.example`.
#[derive(Debug, Default)]
pub struct StaticDomainFilter {
    domains: DashMap<String, Vec<String>>,
}

impl StaticDomainFilter {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `domain` to the named blocklist.
    pub fn add(&self, domain: &str, blocklist: &str) {
        let key = domain.trim_end_matches('.').to_ascii_lowercase();
        let mut lists = self.domains.entry(key).or_default();
        if !lists.iter().any(|l| l == blocklist) {
            lists.push(blocklist.to_string());
        }
    }

    /// Number of blocked domains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// True when no domains are blocked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    fn lists_for(&self, domain: &str) -> Option<String> {
        // Exact match, then walk up the parents.
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let mut candidate = domain.as_str();
        loop {
            if let Some(lists) = self.domains.get(candidate) {
                return Some(lists.join(","));
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return None,
            }
        }
    }
}

impl DomainFilter for StaticDomainFilter {
    fn block_question(&self, qname: &str, _qtype: u16) -> Option<String> {
        self.lists_for(qname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let f = StaticDomainFilter::new();
        f.add("ads.example", "OISD");
        assert_eq!(f.block_question("ads.example", 1), Some("OISD".into()));
        assert_eq!(f.block_question("good.example", 1), None);
    }

    #[test]
    fn test_subdomain_match() {
        let f = StaticDomainFilter::new();
        f.add("ads.example", "OISD");
        assert_eq!(
            f.block_question("track.ads.example", 1),
            Some("OISD".into())
        );
        // Suffix of a label is not a parent domain.
        assert_eq!(f.block_question("badads.example", 1), None);
    }

    #[test]
    fn test_multiple_lists_join() {
        let f = StaticDomainFilter::new();
        f.add("ads.example", "OISD");
        f.add("ads.example", "StevenBlack");
        f.add("ads.example", "OISD");
        assert_eq!(
            f.block_question("ads.example", 1),
            Some("OISD,StevenBlack".into())
        );
    }

    #[test]
    fn test_block_answer_walks_targets() {
        let f = StaticDomainFilter::new();
        f.add("cdn.tracker.example", "EasyPrivacy");
        let targets = vec!["alias.example".to_string(), "x.cdn.tracker.example".to_string()];
        assert_eq!(f.block_answer(&targets), Some("EasyPrivacy".into()));
        assert_eq!(f.block_answer(&["clean.example".to_string()]), None);
    }

    #[test]
    fn test_case_and_dot_normalization() {
        let f = StaticDomainFilter::new();
        f.add("Ads.Example.", "OISD");
        assert!(f.block_question("ADS.EXAMPLE.", 1).is_some());
    }
}
