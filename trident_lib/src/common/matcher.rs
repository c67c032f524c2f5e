use regex::Regex;

use crate::Error;

/// A single domain rule. Suffix rules match the domain itself and any
/// sub-domain of it; keyword rules match anywhere in the name.
#[derive(Debug, Clone)]
pub enum DomainRule {
    Full(String),
    Suffix(String),
    Keyword(String),
    Regex(Regex),
}

impl DomainRule {
    /// Parses `full:`, `domain:`, `keyword:` and `regexp:` prefixed rules,
    /// falling back to `default_kind` for bare patterns.
    pub fn parse(rule: &str, default_kind: RuleKind) -> Result<Self, Error> {
        let (kind, pattern) = match rule.split_once(':') {
            Some(("full", p)) => (RuleKind::Full, p),
            Some(("domain", p)) => (RuleKind::Suffix, p),
            Some(("keyword", p)) => (RuleKind::Keyword, p),
            Some(("regexp", p)) => (RuleKind::Regex, p),
            Some((k, _)) => {
                return Err(Error::InvalidConfig(format!("unknown rule kind: {}", k)))
            }
            None => (default_kind, rule),
        };
        if pattern.is_empty() {
            return Err(Error::InvalidConfig(format!("empty domain rule: {}", rule)));
        }
        Ok(match kind {
            RuleKind::Full => DomainRule::Full(pattern.to_ascii_lowercase()),
            RuleKind::Suffix => DomainRule::Suffix(pattern.to_ascii_lowercase()),
            RuleKind::Keyword => DomainRule::Keyword(pattern.to_ascii_lowercase()),
            RuleKind::Regex => DomainRule::Regex(
                Regex::new(pattern)
                    .map_err(|e| Error::InvalidConfig(format!("bad regexp rule: {}", e)))?,
            ),
        })
    }

    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainRule::Full(p) => domain == p,
            DomainRule::Suffix(p) => {
                domain == p || (domain.len() > p.len() && domain.ends_with(p) && {
                    let boundary = domain.len() - p.len() - 1;
                    domain.as_bytes()[boundary] == b'.'
                })
            }
            DomainRule::Keyword(p) => domain.contains(p.as_str()),
            DomainRule::Regex(re) => re.is_match(domain),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Full,
    Suffix,
    Keyword,
    Regex,
}

/// An ordered set of domain rules. Match indices come back ascending, so
/// rule declaration order doubles as priority.
#[derive(Debug, Default)]
pub struct MatcherGroup {
    rules: Vec<DomainRule>,
}

impl MatcherGroup {
    pub fn new(rules: Vec<DomainRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matched(&self, domain: &str) -> Vec<usize> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.matches(domain))
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_parse_and_match() {
        let full = DomainRule::parse("full:example.com", RuleKind::Suffix).unwrap();
        assert!(full.matches("example.com"));
        assert!(!full.matches("www.example.com"));

        let suffix = DomainRule::parse("example.com", RuleKind::Suffix).unwrap();
        assert!(suffix.matches("example.com"));
        assert!(suffix.matches("www.example.com"));
        assert!(!suffix.matches("badexample.com"));

        let keyword = DomainRule::parse("keyword:tracker", RuleKind::Suffix).unwrap();
        assert!(keyword.matches("tracker.example.com"));
        assert!(keyword.matches("ads-tracker.net"));

        let re = DomainRule::parse(r"regexp:^cdn\d+\.", RuleKind::Suffix).unwrap();
        assert!(re.matches("cdn1.example.com"));
        assert!(!re.matches("cdn.example.com"));
    }

    #[test]
    fn test_rule_parse_rejects_garbage() {
        assert!(DomainRule::parse("geosite:cn", RuleKind::Suffix).is_err());
        assert!(DomainRule::parse("regexp:[", RuleKind::Suffix).is_err());
        assert!(DomainRule::parse("", RuleKind::Full).is_err());
    }

    #[test]
    fn test_matched_indices_ascending() {
        let group = MatcherGroup::new(vec![
            DomainRule::parse("keyword:goo", RuleKind::Suffix).unwrap(),
            DomainRule::parse("example.com", RuleKind::Suffix).unwrap(),
            DomainRule::parse("google.com", RuleKind::Suffix).unwrap(),
        ]);
        assert_eq!(group.matched("www.google.com"), vec![0, 2]);
        assert_eq!(group.matched("example.com"), vec![1]);
        assert!(group.matched("rust-lang.org").is_empty());
    }
}
