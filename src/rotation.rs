//! Proxy rotation
//!
//! [`ProxyRotator`] owns the proxy pool and the current selection and pushes
//! every new selection into a [`Transport`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::request::{ProxyConfig, Transport};
use crate::Result;

/// How the next proxy is picked from the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationPolicy {
    /// Next index, wrapping to 0 past the end
    Sequential,
    /// Uniform index in `[0, pool_size)`
    #[default]
    Random,
    /// Always index 0
    Fixed,
}

impl RotationPolicy {
    /// Unrecognized names fall back to `Fixed`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "sequential" | "round_robin" | "roundrobin" | "round-robin" => Self::Sequential,
            "random" => Self::Random,
            _ => Self::Fixed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Random => "random",
            Self::Fixed => "fixed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RotationConfig {
    /// Master switch. When off, no rotation ever reaches the transport.
    pub enabled: bool,
    /// Allows the probabilistic rotation done before every page request
    pub random_enabled: bool,
    /// Chance of a probabilistic rotation actually happening
    pub rand_rate: f64,
    pub policy: RotationPolicy,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            random_enabled: true,
            rand_rate: 0.15,
            policy: RotationPolicy::Random,
        }
    }
}

/// Pool of proxies plus the index of the one in use.
///
/// An empty pool behaves as a pool holding a single direct connection, so the
/// index is always `0..max(pool.len(), 1)`.
pub struct ProxyRotator<R = StdRng> {
    pool: Vec<ProxyConfig>,
    index: usize,
    config: RotationConfig,
    rng: R,
}

impl ProxyRotator<StdRng> {
    pub fn new(pool: Vec<ProxyConfig>, config: RotationConfig) -> Self {
        Self::with_rng(pool, config, StdRng::from_entropy())
    }
}

impl<R: Rng> ProxyRotator<R> {
    pub fn with_rng(pool: Vec<ProxyConfig>, config: RotationConfig, rng: R) -> Self {
        Self {
            pool,
            index: 0,
            config,
            rng,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pool(&self) -> &[ProxyConfig] {
        &self.pool
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// The proxy at the current index.
    pub fn current(&self) -> ProxyConfig {
        self.proxy_at(self.index)
    }

    fn proxy_at(&self, index: usize) -> ProxyConfig {
        self.pool.get(index).cloned().unwrap_or_default()
    }

    fn slots(&self) -> usize {
        self.pool.len().max(1)
    }

    /// Replaces the pool, keeping the index inside the new bounds.
    pub fn set_pool(&mut self, pool: Vec<ProxyConfig>) {
        self.pool = pool;
        self.index %= self.slots();
    }

    fn next_index(&mut self) -> usize {
        let slots = self.slots();
        match self.config.policy {
            RotationPolicy::Sequential => (self.index + 1) % slots,
            RotationPolicy::Random => self.rng.gen_range(0..slots),
            RotationPolicy::Fixed => 0,
        }
    }

    /// Probabilistic rotations only happen when random rotation is allowed,
    /// and then with chance `rand_rate`.
    fn should_rotate(&mut self, probabilistic: bool) -> bool {
        if !self.config.enabled {
            return false;
        }
        if !probabilistic {
            return true;
        }
        if !self.config.random_enabled || self.config.rand_rate.is_nan() {
            return false;
        }
        self.rng.gen_bool(self.config.rand_rate.clamp(0.0, 1.0))
    }

    /// Selects a new proxy and applies it to `client`.
    ///
    /// `explicit_pool` replaces the pool before selection. `explicit_proxy` is
    /// applied as is and bypasses the policy. Returns the applied proxy, or
    /// `None` when nothing happened.
    pub fn rotate<T: Transport + ?Sized>(
        &mut self,
        client: &mut T,
        explicit_proxy: Option<ProxyConfig>,
        explicit_pool: Option<Vec<ProxyConfig>>,
        probabilistic: bool,
    ) -> Result<Option<ProxyConfig>> {
        if !self.should_rotate(probabilistic) {
            return Ok(None);
        }
        info!(
            random = probabilistic,
            policy = self.config.policy.as_str(),
            "Rotating proxies"
        );

        if let Some(pool) = explicit_pool {
            self.set_pool(pool);
        }

        let (index, proxy) = match explicit_proxy {
            Some(proxy) => (self.index, proxy),
            None => {
                let index = self.next_index();
                (index, self.proxy_at(index))
            }
        };

        info!(index, %proxy, "Setting new proxies");
        // The selection only moves once the transport has taken the proxy.
        client.set_proxy(&proxy)?;
        self.index = index;
        Ok(Some(proxy))
    }

    /// Policy based rotation, applied regardless of `random_enabled`.
    pub fn rotate_now<T: Transport + ?Sized>(
        &mut self,
        client: &mut T,
    ) -> Result<Option<ProxyConfig>> {
        self.rotate(client, None, None, false)
    }

    /// The per request rotation attempt.
    pub fn maybe_rotate<T: Transport + ?Sized>(
        &mut self,
        client: &mut T,
    ) -> Result<Option<ProxyConfig>> {
        self.rotate(client, None, None, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{GraphqlRequest, Response};
    use crate::Error;
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;

    /// Transport that only records the proxies it was given.
    #[derive(Default)]
    struct ProxySink {
        applied: Vec<ProxyConfig>,
        /// Proxies `set_proxy` refuses
        rejected: Vec<ProxyConfig>,
    }

    #[async_trait]
    impl Transport for ProxySink {
        async fn query(&mut self, _: &GraphqlRequest, _: &HeaderMap) -> Result<Response> {
            unreachable!("rotation never sends requests")
        }

        async fn product_activity(
            &mut self,
            _: &str,
            _: &[(&'static str, String)],
            _: &HeaderMap,
        ) -> Result<Response> {
            unreachable!("rotation never sends requests")
        }

        fn set_proxy(&mut self, proxy: &ProxyConfig) -> Result<()> {
            if self.rejected.contains(proxy) {
                return Err(Error::InvalidProxy(proxy.to_string()));
            }
            self.applied.push(proxy.clone());
            Ok(())
        }
    }

    fn pool(n: usize) -> Vec<ProxyConfig> {
        (0..n)
            .map(|i| ProxyConfig::from_url(format!("http://10.0.0.{i}:8080")))
            .collect()
    }

    fn rotator(n: usize, policy: RotationPolicy) -> ProxyRotator {
        let config = RotationConfig {
            enabled: true,
            policy,
            ..RotationConfig::default()
        };
        ProxyRotator::with_rng(pool(n), config, StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_rotation_policy_parse() {
        assert_eq!(RotationPolicy::parse("sequential"), RotationPolicy::Sequential);
        assert_eq!(RotationPolicy::parse("Round-Robin"), RotationPolicy::Sequential);
        assert_eq!(RotationPolicy::parse("random"), RotationPolicy::Random);
        assert_eq!(RotationPolicy::parse("fixed"), RotationPolicy::Fixed);
        assert_eq!(RotationPolicy::parse("whatever"), RotationPolicy::Fixed);
    }

    #[test]
    fn test_sequential_wraps_around() {
        let mut rotator = rotator(3, RotationPolicy::Sequential);
        let mut sink = ProxySink::default();
        for _ in 0..3 {
            rotator.rotate_now(&mut sink).unwrap();
        }
        let expected = pool(3);
        assert_eq!(
            sink.applied,
            vec![expected[1].clone(), expected[2].clone(), expected[0].clone()]
        );
        assert_eq!(rotator.index(), 0);
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let mut rotator = rotator(4, RotationPolicy::Random);
        let mut sink = ProxySink::default();
        for _ in 0..50 {
            rotator.rotate_now(&mut sink).unwrap();
            assert!(rotator.index() < 4);
        }
        assert_eq!(sink.applied.len(), 50);
    }

    #[test]
    fn test_random_is_reproducible_with_seed() {
        let mut a = rotator(10, RotationPolicy::Random);
        let mut b = rotator(10, RotationPolicy::Random);
        let (mut sink_a, mut sink_b) = (ProxySink::default(), ProxySink::default());
        for _ in 0..10 {
            a.rotate_now(&mut sink_a).unwrap();
            b.rotate_now(&mut sink_b).unwrap();
        }
        assert_eq!(sink_a.applied, sink_b.applied);
    }

    #[test]
    fn test_fixed_always_selects_first() {
        let mut rotator = rotator(3, RotationPolicy::Fixed);
        let mut sink = ProxySink::default();
        for _ in 0..3 {
            rotator.rotate_now(&mut sink).unwrap();
            assert_eq!(rotator.index(), 0);
        }
        assert!(sink.applied.iter().all(|p| *p == pool(3)[0]));
    }

    #[test]
    fn test_disabled_never_touches_transport() {
        let config = RotationConfig {
            enabled: false,
            rand_rate: 1.0,
            policy: RotationPolicy::Sequential,
            ..RotationConfig::default()
        };
        let mut rotator = ProxyRotator::with_rng(pool(3), config, StdRng::seed_from_u64(1));
        let mut sink = ProxySink::default();

        assert_eq!(rotator.rotate_now(&mut sink).unwrap(), None);
        assert_eq!(rotator.maybe_rotate(&mut sink).unwrap(), None);
        let explicit = Some(ProxyConfig::from_url("http://10.9.9.9:1"));
        assert_eq!(rotator.rotate(&mut sink, explicit, Some(pool(5)), false).unwrap(), None);

        assert!(sink.applied.is_empty());
        assert_eq!(rotator.index(), 0);
        assert_eq!(rotator.pool().len(), 3);
    }

    #[test]
    fn test_probabilistic_follows_rate() {
        let mut sink = ProxySink::default();

        let never = RotationConfig {
            enabled: true,
            rand_rate: 0.0,
            ..RotationConfig::default()
        };
        let mut rotator = ProxyRotator::with_rng(pool(3), never, StdRng::seed_from_u64(3));
        for _ in 0..20 {
            assert_eq!(rotator.maybe_rotate(&mut sink).unwrap(), None);
        }

        let always = RotationConfig {
            enabled: true,
            rand_rate: 1.0,
            ..RotationConfig::default()
        };
        let mut rotator = ProxyRotator::with_rng(pool(3), always, StdRng::seed_from_u64(3));
        for _ in 0..20 {
            assert!(rotator.maybe_rotate(&mut sink).unwrap().is_some());
        }
        assert_eq!(sink.applied.len(), 20);
    }

    #[test]
    fn test_probabilistic_needs_random_enabled() {
        let config = RotationConfig {
            enabled: true,
            random_enabled: false,
            rand_rate: 1.0,
            policy: RotationPolicy::Sequential,
        };
        let mut rotator = ProxyRotator::with_rng(pool(3), config, StdRng::seed_from_u64(3));
        let mut sink = ProxySink::default();

        assert_eq!(rotator.maybe_rotate(&mut sink).unwrap(), None);
        assert!(rotator.rotate_now(&mut sink).unwrap().is_some());
        assert_eq!(sink.applied, vec![pool(3)[1].clone()]);
    }

    #[test]
    fn test_explicit_proxy_bypasses_policy() {
        let mut rotator = rotator(3, RotationPolicy::Sequential);
        let mut sink = ProxySink::default();
        let explicit = ProxyConfig::from_url("http://10.9.9.9:1");

        let applied = rotator
            .rotate(&mut sink, Some(explicit.clone()), None, false)
            .unwrap();
        assert_eq!(applied, Some(explicit.clone()));
        assert_eq!(sink.applied, vec![explicit]);
        assert_eq!(rotator.index(), 0);
    }

    #[test]
    fn test_explicit_pool_replaces_pool() {
        let mut rotator = rotator(5, RotationPolicy::Sequential);
        let mut sink = ProxySink::default();
        for _ in 0..4 {
            rotator.rotate_now(&mut sink).unwrap();
        }
        assert_eq!(rotator.index(), 4);

        let replacement = pool(2);
        rotator
            .rotate(&mut sink, None, Some(replacement.clone()), false)
            .unwrap();
        // 4 % 2 == 0, then advance
        assert_eq!(rotator.index(), 1);
        assert_eq!(sink.applied.last(), Some(&replacement[1]));
        assert_eq!(rotator.pool(), replacement.as_slice());
    }

    #[test]
    fn test_failed_apply_keeps_selection() {
        let mut rotator = rotator(3, RotationPolicy::Sequential);
        let mut sink = ProxySink {
            rejected: vec![pool(3)[1].clone()],
            ..ProxySink::default()
        };

        let result = rotator.rotate_now(&mut sink);

        assert!(matches!(result, Err(Error::InvalidProxy(_))));
        assert_eq!(rotator.index(), 0);
        assert_eq!(rotator.current(), pool(3)[0]);
        assert!(sink.applied.is_empty());

        sink.rejected.clear();
        rotator.rotate_now(&mut sink).unwrap();
        assert_eq!(rotator.index(), 1);
        assert_eq!(sink.applied, vec![pool(3)[1].clone()]);
    }

    #[test]
    fn test_empty_pool_falls_back_to_direct() {
        for policy in [
            RotationPolicy::Sequential,
            RotationPolicy::Random,
            RotationPolicy::Fixed,
        ] {
            let mut rotator = rotator(0, policy);
            let mut sink = ProxySink::default();
            let applied = rotator.rotate_now(&mut sink).unwrap();
            assert_eq!(applied, Some(ProxyConfig::default()));
            assert_eq!(rotator.index(), 0);
            assert!(sink.applied[0].is_direct());
        }
    }
}
