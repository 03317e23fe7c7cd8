//! Fallback strategies and their standard tiers.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulwark_common::duration_millis;
use bulwark_common::error::OperationError;
use serde::Serialize;

use crate::endpoint::EndpointKey;

pub const DEFAULT_STRATEGY_TIMEOUT: Duration = Duration::from_secs(30);

/// One way of fulfilling a logical operation.
///
/// Strategies registered for the same operation are tried in descending
/// `priority` order until one yields a valid result.
#[async_trait]
pub trait Strategy<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Higher runs first
    fn priority(&self) -> i32;

    fn timeout(&self) -> Duration {
        DEFAULT_STRATEGY_TIMEOUT
    }

    /// Advertised retry budget; reported in stats, not enforced
    fn retry_count(&self) -> u32 {
        0
    }

    fn is_available(&self) -> bool {
        true
    }

    /// Key under which the circuit breaker and rate limiter track this strategy
    fn endpoint(&self) -> EndpointKey {
        EndpointKey::new(self.name())
    }

    async fn execute(&self, query: &str) -> Result<T, OperationError>;
}

/// Name, priority and limits of a standard strategy tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyTier {
    pub name: String,
    pub priority: i32,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub retry_count: u32,
}

impl StrategyTier {
    pub fn new(name: impl Into<String>, priority: i32, timeout: Duration, retry_count: u32) -> Self {
        Self { name: name.into(), priority, timeout, retry_count }
    }
}

/// The standard tiers, highest priority first.
pub fn default_strategy_profile() -> Vec<StrategyTier> {
    vec![
        StrategyTier::new("primary", 100, Duration::from_secs(10), 2),
        StrategyTier::new("alternative", 80, Duration::from_secs(15), 2),
        StrategyTier::new("legacy", 60, Duration::from_secs(20), 1),
        StrategyTier::new("browser", 40, Duration::from_secs(30), 1),
    ]
}

/// Adapts an async closure and a tier into a [`Strategy`].
pub struct ProfiledStrategy<F> {
    tier: StrategyTier,
    endpoint: Option<EndpointKey>,
    available: Arc<AtomicBool>,
    call: F,
}

impl<F> fmt::Debug for ProfiledStrategy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfiledStrategy")
            .field("tier", &self.tier)
            .field("endpoint", &self.endpoint)
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<F> ProfiledStrategy<F> {
    pub fn new(tier: StrategyTier, call: F) -> Self {
        Self { tier, endpoint: None, available: Arc::new(AtomicBool::new(true)), call }
    }

    /// Track the strategy under `endpoint` instead of its name.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<EndpointKey>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Shared switch controlling [`Strategy::is_available`].
    pub fn availability(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.available)
    }

    pub fn tier(&self) -> &StrategyTier {
        &self.tier
    }
}

#[async_trait]
impl<T, F, Fut> Strategy<T> for ProfiledStrategy<F>
where
    T: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.tier.name
    }

    fn priority(&self) -> i32 {
        self.tier.priority
    }

    fn timeout(&self) -> Duration {
        self.tier.timeout
    }

    fn retry_count(&self) -> u32 {
        self.tier.retry_count
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn endpoint(&self) -> EndpointKey {
        self.endpoint.clone().unwrap_or_else(|| EndpointKey::new(&self.tier.name))
    }

    async fn execute(&self, query: &str) -> Result<T, OperationError> {
        (self.call)(query.to_string()).await
    }
}

/// Registry entry as reported by [`super::FallbackOrchestrator::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct StrategyInfo {
    pub name: String,
    pub priority: i32,
    pub available: bool,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub retry_count: u32,
    pub endpoint: EndpointKey,
}

impl StrategyInfo {
    pub(crate) fn of<T>(strategy: &dyn Strategy<T>) -> Self {
        Self {
            name: strategy.name().to_string(),
            priority: strategy.priority(),
            available: strategy.is_available(),
            timeout: strategy.timeout(),
            retry_count: strategy.retry_count(),
            endpoint: strategy.endpoint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_is_ordered() {
        let tiers = default_strategy_profile();
        let names: Vec<_> = tiers.iter().map(|tier| tier.name.as_str()).collect();
        assert_eq!(names, ["primary", "alternative", "legacy", "browser"]);
        assert!(tiers.windows(2).all(|pair| pair[0].priority > pair[1].priority));
        assert_eq!(tiers[0].timeout, Duration::from_secs(10));
        assert_eq!(tiers[3].retry_count, 1);
    }

    #[tokio::test]
    async fn test_profiled_strategy_delegates() {
        let tier = default_strategy_profile().remove(1);
        let strategy = ProfiledStrategy::new(tier, |query: String| async move {
            Ok::<_, OperationError>(query.len())
        })
        .with_endpoint("/api/search");

        assert_eq!(Strategy::<usize>::name(&strategy), "alternative");
        assert_eq!(Strategy::<usize>::endpoint(&strategy).as_str(), "/api/search");
        assert_eq!(strategy.execute("abcd").await.ok(), Some(4));

        strategy.availability().store(false, Ordering::Relaxed);
        assert!(!Strategy::<usize>::is_available(&strategy));
    }
}
