use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::Result;

/// Registration facts about a domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Whois {
    pub domain: String,
    /// Name servers
    pub nserver: Vec<String>,
    pub state: String,
    pub person: String,
    pub email: String,
    pub registrar: String,
    pub created: Option<DateTime<Utc>>,
    pub paid_till: Option<DateTime<Utc>>,
}

impl Whois {
    /// True when any name server contains `pattern` (case-insensitive)
    pub fn has_nameserver_matching(&self, pattern: &str) -> bool {
        let pattern = pattern.to_ascii_lowercase();
        self.nserver
            .iter()
            .any(|ns| ns.to_ascii_lowercase().contains(&pattern))
    }
}

/// Source of WHOIS facts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WhoisService: Send + Sync {
    /// Look up registration facts for `domain`
    async fn lookup(&self, domain: &str) -> Result<Whois>;
}

/// WHOIS answers from configuration.
///
/// A sub-domain resolves to the closest configured parent.
#[derive(Debug, Default)]
pub struct StaticWhois {
    entries: HashMap<String, Whois>,
}

impl StaticWhois {
    pub fn new(entries: impl IntoIterator<Item = Whois>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|w| (w.domain.to_ascii_lowercase(), w))
                .collect(),
        }
    }
}

#[async_trait]
impl WhoisService for StaticWhois {
    async fn lookup(&self, domain: &str) -> Result<Whois> {
        let mut current = domain.trim_end_matches('.').to_ascii_lowercase();
        loop {
            if let Some(whois) = self.entries.get(&current) {
                return Ok(whois.clone());
            }
            match current.split_once('.') {
                Some((_, parent)) if parent.contains('.') => current = parent.to_string(),
                _ => return Err(Error::NotFound(format!("WHOIS record for '{}'", domain))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(domain: &str, ns: &[&str]) -> Whois {
        Whois {
            domain: domain.into(),
            nserver: ns.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_static_lookup_walks_parents() {
        let whois = StaticWhois::new(vec![entry("example.test", &["hydrogen.ns.hetzner.com"])]);

        let found = tokio_test::block_on(whois.lookup("a.b.Example.test."));
        assert_eq!(tokio_test::assert_ok!(found).domain, "example.test");
        assert_eq!(
            tokio_test::block_on(whois.lookup("example.test")).unwrap().domain,
            "example.test"
        );
        assert!(matches!(
            tokio_test::block_on(whois.lookup("other.test")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_nameserver_matching_ignores_case() {
        let whois = entry("example.test", &["NS1.Your-Server.DE"]);
        assert!(whois.has_nameserver_matching("your-server.de"));
        assert!(!whois.has_nameserver_matching("cloudflare.com"));
    }

    #[tokio::test]
    async fn test_mocked_lookup() {
        let mut mock = MockWhoisService::new();
        mock.expect_lookup()
            .withf(|domain| domain.to_string() == "example.test")
            .times(1)
            .returning(|_| Ok(entry("example.test", &["ns.example.test"])));

        let whois = mock.lookup("example.test").await.unwrap();
        assert_eq!(whois.nserver, vec!["ns.example.test".to_string()]);
    }
}
