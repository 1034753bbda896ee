//! Memoizing reverse-DNS cache
//!
//! Successful lookups are cached for the life of the process (bounded by an
//! LRU so a long-running monitor cannot grow without limit). Failures are
//! never cached: an address that did not resolve is looked up again the
//! next time it shows up.

use crate::config::DnsConfig;
use crate::traffic_classifier::is_local_traffic;
use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Blocking reverse lookup backend
pub trait ReverseLookup: Send + Sync {
    /// Hostnames for `ip`, best match first
    fn reverse(&self, ip: IpAddr) -> Result<Vec<String>>;
}

/// The operating system resolver (getnameinfo)
pub struct SystemResolver;

impl ReverseLookup for SystemResolver {
    fn reverse(&self, ip: IpAddr) -> Result<Vec<String>> {
        let name = dns_lookup::lookup_addr(&ip)?;
        Ok(vec![name])
    }
}

pub struct DnsCache {
    resolver: Arc<dyn ReverseLookup>,
    cache: Mutex<LruCache<IpAddr, String>>,
    lookup_timeout: Duration,
    resolve_private: bool,
    lookups: AtomicU64,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn ReverseLookup>, config: &DnsConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver,
            cache: Mutex::new(LruCache::new(capacity)),
            lookup_timeout: Duration::from_millis(config.lookup_timeout_ms),
            resolve_private: config.resolve_private,
            lookups: AtomicU64::new(0),
        }
    }

    /// Cache backed by the OS resolver
    pub fn system(config: &DnsConfig) -> Self {
        Self::new(Arc::new(SystemResolver), config)
    }

    /// Resolve `ip` to a hostname, consulting the cache first.
    ///
    /// Returns `None` when the lookup fails, times out, or only echoes the
    /// numeric address back. None of those outcomes are cached.
    pub async fn resolve(&self, ip: IpAddr) -> Option<String> {
        if let Some(name) = self.cache.lock().get(&ip) {
            return Some(name.clone());
        }

        if ip.is_unspecified() || (!self.resolve_private && is_local_traffic(&ip)) {
            return None;
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);

        let resolver = Arc::clone(&self.resolver);
        let lookup = tokio::task::spawn_blocking(move || resolver.reverse(ip));

        let names = match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(Ok(names))) => names,
            Ok(Ok(Err(e))) => {
                log::debug!("DNS reverse lookup failed for {}: {}", ip, e);
                return None;
            }
            Ok(Err(e)) => {
                log::debug!("DNS lookup task for {} did not complete: {}", ip, e);
                return None;
            }
            Err(_) => {
                log::debug!("DNS lookup timeout ({:?}) for {}", self.lookup_timeout, ip);
                return None;
            }
        };

        let name = names.into_iter().next()?;
        let name = name.trim_end_matches('.');

        // getnameinfo hands back the numeric form when there is no PTR record
        if name.is_empty() || name.parse::<IpAddr>().is_ok() {
            log::debug!("No PTR record for {}", ip);
            return None;
        }

        log::debug!("DNS resolved {} -> {}", ip, name);
        self.cache.lock().put(ip, name.to_string());
        Some(name.to_string())
    }

    /// Number of cached hostnames
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Number of lookups sent to the resolver so far
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Resolver that replays scripted answers and counts calls
    pub(crate) struct ScriptedResolver {
        answers: Mutex<VecDeque<Result<Vec<String>>>>,
        fallback: Option<String>,
    }

    impl ScriptedResolver {
        pub(crate) fn new(answers: Vec<Result<Vec<String>>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                fallback: None,
            }
        }

        /// Answers every lookup with `name`
        pub(crate) fn always(name: &str) -> Self {
            Self {
                answers: Mutex::new(VecDeque::new()),
                fallback: Some(name.to_string()),
            }
        }
    }

    impl ReverseLookup for ScriptedResolver {
        fn reverse(&self, _ip: IpAddr) -> Result<Vec<String>> {
            match self.answers.lock().pop_front() {
                Some(answer) => answer,
                None => match &self.fallback {
                    Some(name) => Ok(vec![name.clone()]),
                    None => anyhow::bail!("NXDOMAIN"),
                },
            }
        }
    }

    fn cache_with(resolver: ScriptedResolver, config: DnsConfig) -> DnsCache {
        DnsCache::new(Arc::new(resolver), &config)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_hit_after_success_survives_later_failures() {
        let cache = cache_with(
            ScriptedResolver::new(vec![
                Ok(vec!["dns.google".to_string()]),
                Err(anyhow::anyhow!("SERVFAIL")),
            ]),
            DnsConfig::default(),
        );

        assert_eq!(cache.resolve(ip("8.8.8.8")).await.as_deref(), Some("dns.google"));
        assert_eq!(cache.resolve(ip("8.8.8.8")).await.as_deref(), Some("dns.google"));
        assert_eq!(cache.lookups(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_retried() {
        let cache = cache_with(
            ScriptedResolver::new(vec![
                Err(anyhow::anyhow!("timeout")),
                Ok(vec!["one.one.one.one.".to_string()]),
            ]),
            DnsConfig::default(),
        );

        assert_eq!(cache.resolve(ip("1.1.1.1")).await, None);
        assert_eq!(cache.len(), 0);
        assert_eq!(
            cache.resolve(ip("1.1.1.1")).await.as_deref(),
            Some("one.one.one.one")
        );
        assert_eq!(cache.lookups(), 2);
    }

    #[tokio::test]
    async fn test_numeric_echo_is_not_a_name() {
        let cache = cache_with(
            ScriptedResolver::new(vec![Ok(vec!["8.8.4.4".to_string()])]),
            DnsConfig::default(),
        );

        assert_eq!(cache.resolve(ip("8.8.4.4")).await, None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_private_addresses_skipped_when_disabled() {
        let config = DnsConfig {
            resolve_private: false,
            ..DnsConfig::default()
        };
        let cache = cache_with(ScriptedResolver::always("router.lan"), config);

        assert_eq!(cache.resolve(ip("192.168.1.1")).await, None);
        assert_eq!(cache.lookups(), 0);
        assert_eq!(
            cache.resolve(ip("140.82.112.4")).await.as_deref(),
            Some("router.lan")
        );
    }

    #[tokio::test]
    async fn test_unspecified_is_never_looked_up() {
        let cache = cache_with(ScriptedResolver::always("x"), DnsConfig::default());
        assert_eq!(cache.resolve(ip("0.0.0.0")).await, None);
        assert_eq!(cache.resolve(ip("::")).await, None);
        assert_eq!(cache.lookups(), 0);
    }

    #[tokio::test]
    async fn test_capacity_bounds_cache() {
        let config = DnsConfig {
            cache_capacity: 2,
            ..DnsConfig::default()
        };
        let cache = cache_with(ScriptedResolver::always("host.example"), config);

        for addr in ["9.9.9.9", "9.9.9.10", "9.9.9.11"] {
            cache.resolve(ip(addr)).await;
        }
        assert_eq!(cache.len(), 2);

        // Oldest entry was evicted and has to be looked up again
        cache.resolve(ip("9.9.9.9")).await;
        assert_eq!(cache.lookups(), 4);
    }
}
