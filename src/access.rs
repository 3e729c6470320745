use crate::error::ProxyError;
use log::debug;

/// Host allow/deny lists applied before any origin connection is opened.
///
/// Patterns:
/// - `example.com` matches the domain itself and any subdomain
/// - `.example.com` and `*.example.com` match subdomains only
/// - `*` matches every host
#[derive(Debug, Clone, Default)]
pub struct AccessRules {
    allowed: Vec<String>,
    denied: Vec<String>,
}

impl AccessRules {
    pub fn new(allowed: &[String], denied: &[String]) -> Self {
        Self {
            allowed: normalize(allowed),
            denied: normalize(denied),
        }
    }

    /// Rules that admit every host.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_restricted(&self) -> bool {
        !self.allowed.is_empty() || !self.denied.is_empty()
    }

    /// Deny wins over allow; a non-empty allow list admits only matching hosts.
    pub fn is_allowed(&self, host: &str) -> bool {
        if !self.is_restricted() {
            return true;
        }
        let host = host.trim_start_matches('[').trim_end_matches(']').to_lowercase();
        if matches_host_pattern(&host, &self.denied) {
            return false;
        }
        self.allowed.is_empty() || matches_host_pattern(&host, &self.allowed)
    }

    pub fn check(&self, host: &str) -> Result<(), ProxyError> {
        if self.is_allowed(host) {
            Ok(())
        } else {
            debug!("Host {} rejected by access rules", host);
            Err(ProxyError::Forbidden(host.to_string()))
        }
    }
}

fn normalize(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

fn matches_host_pattern(host: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if pattern == "*" {
            true
        } else if let Some(domain) = pattern.strip_prefix("*.").or_else(|| pattern.strip_prefix('.')) {
            // subdomains only
            host.len() > domain.len() && host.ends_with(domain) && host[..host.len() - domain.len()].ends_with('.')
        } else {
            host == pattern || host.ends_with(&format!(".{}", pattern))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(allowed: &[&str], denied: &[&str]) -> AccessRules {
        let to_vec = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        AccessRules::new(&to_vec(allowed), &to_vec(denied))
    }

    #[test]
    fn test_empty_rules_allow_everything() {
        let rules = AccessRules::allow_all();
        assert!(!rules.is_restricted());
        assert!(rules.is_allowed("example.com"));
        assert!(rules.is_allowed("127.0.0.1"));
    }

    #[test]
    fn test_pattern_forms() {
        let patterns = vec!["example.com".to_string()];
        assert!(matches_host_pattern("example.com", &patterns));
        assert!(matches_host_pattern("api.example.com", &patterns));
        assert!(!matches_host_pattern("badexample.com", &patterns));

        let patterns = vec!["*.example.com".to_string()];
        assert!(!matches_host_pattern("example.com", &patterns));
        assert!(matches_host_pattern("a.b.example.com", &patterns));
        assert!(!matches_host_pattern("notexample.com", &patterns));

        let patterns = vec![".internal".to_string()];
        assert!(matches_host_pattern("db.internal", &patterns));
        assert!(!matches_host_pattern("internal", &patterns));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let rules = rules(&["example.com"], &["admin.example.com"]);
        assert!(rules.is_allowed("www.example.com"));
        assert!(!rules.is_allowed("admin.example.com"));
        assert!(!rules.is_allowed("other.org"));
        assert!(matches!(rules.check("other.org"), Err(ProxyError::Forbidden(_))));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let rules = rules(&[], &["Blocked.COM"]);
        assert!(!rules.is_allowed("WWW.blocked.com"));
        assert!(rules.is_allowed("open.com"));
    }

    #[test]
    fn test_bracketed_ipv6() {
        let rules = rules(&[], &["::1"]);
        assert!(!rules.is_allowed("[::1]"));
    }
}
