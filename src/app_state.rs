use std::sync::Arc;

use clap::ValueEnum;
use regex::Regex;

use crate::pipeline::ConversionPipeline;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DomainMatchMode {
    Whitelist,
    Blacklist,
}

/// Host allow/deny list. Patterns may contain `*` wildcards and must match
/// the whole host.
#[derive(Clone, Debug)]
pub struct DomainPolicy {
    domains: Vec<Regex>,
    mode: DomainMatchMode,
}

impl Default for DomainPolicy {
    fn default() -> Self {
        DomainPolicy {
            domains: Vec::new(),
            mode: DomainMatchMode::Blacklist,
        }
    }
}

impl DomainPolicy {
    pub fn new<S: AsRef<str>>(mode: DomainMatchMode, patterns: &[S]) -> Result<Self, regex::Error> {
        let domains = patterns
            .iter()
            .map(|pattern| pattern.as_ref().trim())
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| {
                let pattern = regex::escape(pattern).replace(r"\*", ".*");
                Regex::new(&format!("(?i)^{pattern}$"))
            })
            .collect::<Result<_, _>>()?;

        Ok(DomainPolicy { domains, mode })
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        let contains = self.domains.iter().any(|domain| domain.is_match(host));

        match self.mode {
            DomainMatchMode::Whitelist => contains,
            DomainMatchMode::Blacklist => !contains,
        }
    }
}

/// Shared handles passed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ConversionPipeline>,
}

impl AppState {
    pub fn new(pipeline: ConversionPipeline) -> Self {
        AppState {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blacklist_allows_everything() {
        let policy = DomainPolicy::default();
        assert!(policy.is_allowed("example.com"));
    }

    #[test]
    fn wildcards_match_whole_host() {
        let policy = DomainPolicy::new(DomainMatchMode::Whitelist, &["*.example.com"]).unwrap();
        assert!(policy.is_allowed("cdn.example.com"));
        assert!(policy.is_allowed("CDN.Example.com"));
        assert!(!policy.is_allowed("example.com.evil.org"));
        assert!(!policy.is_allowed("examplexcom"));
    }

    #[test]
    fn blacklist_denies_listed_hosts() {
        let policy =
            DomainPolicy::new(DomainMatchMode::Blacklist, &["internal.local", " "]).unwrap();
        assert!(!policy.is_allowed("internal.local"));
        assert!(policy.is_allowed("example.com"));
    }
}
