//! Core admission engine.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::backend::WindowBackend;
use super::clock::{Clock, SystemClock};
use super::key::{ClientKey, KeyExtractor, RequestContext};
use super::policy::{FailureMode, Policy, PolicyRegistry};
use super::window::{Decision, WindowKey, WindowStore};
use crate::error::Result;

/// The admission engine that resolves policies and consults the window store.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Validated, read-only policy set
    registry: Arc<PolicyRegistry>,
    /// Where window records live
    backend: Arc<dyn WindowBackend>,
    /// Derives client keys from request context
    extractor: KeyExtractor,
    /// Time source for checks without an explicit timestamp
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter with an in-process store and the system clock.
    pub fn new(registry: PolicyRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            backend: Arc::new(WindowStore::new()),
            extractor: KeyExtractor::new(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Replace the window store.
    pub fn with_backend(mut self, backend: Arc<dyn WindowBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the key extractor.
    pub fn with_key_extractor(mut self, extractor: KeyExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Check a request described by `ctx` against `policy_name`.
    pub async fn check_request(&self, ctx: &RequestContext, policy_name: &str) -> Result<Decision> {
        let key = self.extractor.extract(ctx);
        self.check(&key, policy_name).await
    }

    /// Check `key` against `policy_name` at the current time.
    pub async fn check(&self, key: &ClientKey, policy_name: &str) -> Result<Decision> {
        self.check_at(key, policy_name, self.clock.now_ms()).await
    }

    /// Check `key` against `policy_name` at `now_ms`.
    ///
    /// Fails only when the policy is unknown. Backend failures are resolved
    /// through the policy's [`FailureMode`].
    pub async fn check_at(&self, key: &ClientKey, policy_name: &str, now_ms: u64) -> Result<Decision> {
        let policy = self.registry.lookup(policy_name)?;
        let window_key = WindowKey::new(key.clone(), &policy.name);

        trace!(key = %window_key, now_ms, "Checking admission");

        let decision = match self.backend.admit(&window_key, policy, now_ms).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    key = %window_key,
                    backend = self.backend.name(),
                    error = %e,
                    mode = ?policy.on_backend_failure,
                    "Window backend failed; applying failure mode"
                );
                Self::degraded(policy)
            }
        };

        if !decision.admitted {
            debug!(
                key = %window_key,
                limit = policy.limit,
                retry_after_ms = decision.retry_after_ms,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// The decision to use when the backend cannot answer.
    fn degraded(policy: &Policy) -> Decision {
        match policy.on_backend_failure {
            FailureMode::Open => Decision::admit(0),
            FailureMode::Closed => Decision::deny(policy.window_ms),
        }
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn WindowBackend> {
        &self.backend
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn key_extractor(&self) -> &KeyExtractor {
        &self.extractor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;
    use crate::ratelimit::clock::ManualClock;
    use async_trait::async_trait;

    /// A backend that is always down.
    struct UnreachableBackend;

    #[async_trait]
    impl WindowBackend for UnreachableBackend {
        async fn admit(&self, _key: &WindowKey, _policy: &Policy, _now_ms: u64) -> Result<Decision> {
            Err(TollgateError::BackendUnavailable("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "unreachable"
        }
    }

    fn limiter() -> RateLimiter {
        let registry = PolicyRegistry::from_policies([Policy::new("ai", 2, 1_000)]).unwrap();
        RateLimiter::new(registry)
    }

    #[tokio::test]
    async fn test_check_admits_then_denies() {
        let limiter = limiter();
        let key = ClientKey::principal("u1");

        assert_eq!(limiter.check_at(&key, "ai", 0).await.unwrap(), Decision::admit(1));
        assert_eq!(limiter.check_at(&key, "ai", 10).await.unwrap(), Decision::admit(0));
        assert_eq!(limiter.check_at(&key, "ai", 20).await.unwrap(), Decision::deny(980));
    }

    #[tokio::test]
    async fn test_unknown_policy_is_config_error() {
        let limiter = limiter();
        let err = limiter
            .check_at(&ClientKey::anonymous(), "ultra", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
    }

    #[tokio::test]
    async fn test_check_uses_injected_clock() {
        let clock = ManualClock::new(0);
        let limiter = limiter().with_clock(Arc::new(clock.clone()));
        let key = ClientKey::principal("u1");

        limiter.check(&key, "ai").await.unwrap();
        limiter.check(&key, "ai").await.unwrap();
        assert!(!limiter.check(&key, "ai").await.unwrap().admitted);

        clock.advance(1_000);
        assert!(limiter.check(&key, "ai").await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_check_request_extracts_key() {
        let limiter = limiter().with_clock(Arc::new(ManualClock::new(5_000)));
        let ctx = RequestContext::new().with_principal("u1");

        limiter.check_request(&ctx, "ai").await.unwrap();
        limiter.check_request(&ctx, "ai").await.unwrap();
        assert!(!limiter.check_request(&ctx, "ai").await.unwrap().admitted);

        // Same principal via the direct key API shares the window.
        let decision = limiter
            .check_at(&ClientKey::principal("u1"), "ai", 5_000)
            .await
            .unwrap();
        assert!(!decision.admitted);
    }

    #[tokio::test]
    async fn test_backend_failure_fail_open() {
        let registry = PolicyRegistry::with_default_tiers();
        let limiter = RateLimiter::new(registry).with_backend(Arc::new(UnreachableBackend));

        let decision = limiter
            .check_at(&ClientKey::anonymous(), "general", 0)
            .await
            .unwrap();
        assert!(decision.admitted);
    }

    #[tokio::test]
    async fn test_backend_failure_fail_closed() {
        let registry = PolicyRegistry::with_default_tiers();
        let limiter = RateLimiter::new(registry).with_backend(Arc::new(UnreachableBackend));

        let decision = limiter
            .check_at(&ClientKey::anonymous(), "ai", 0)
            .await
            .unwrap();
        assert_eq!(decision, Decision::deny(60_000));
    }
}
