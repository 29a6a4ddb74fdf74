//! Rate limit policies and the registry that validates them.
//!
//! A policy is a named `(limit, window)` pair. Policies are registered once at
//! startup; after that the registry is only read.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{Result, TollgateError};

/// Name of the high-limit tier for ordinary reads and writes.
pub const GENERAL_POLICY: &str = "general";
/// Name of the low-limit tier for AI-backed calls.
pub const AI_POLICY: &str = "ai";

/// What to do when the window store itself cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request.
    #[default]
    Open,
    /// Deny the request.
    Closed,
}

/// A named rate limit tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Identifier used by callers to select this tier
    pub name: String,
    /// Maximum admissions per window
    pub limit: u64,
    /// Window length in milliseconds
    #[serde(alias = "windowMs")]
    pub window_ms: u64,
    /// Behavior when the backend is unavailable
    #[serde(default)]
    pub on_backend_failure: FailureMode,
}

impl Policy {
    /// Create a fail-open policy. Parameters are checked on registration.
    pub fn new(name: impl Into<String>, limit: u64, window_ms: u64) -> Self {
        Self {
            name: name.into(),
            limit,
            window_ms,
            on_backend_failure: FailureMode::Open,
        }
    }

    /// Set the backend failure mode.
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.on_backend_failure = mode;
        self
    }

    /// The default tier for ordinary operations: 100 per minute, fail-open.
    pub fn general() -> Self {
        Self::new(GENERAL_POLICY, 100, 60_000)
    }

    /// The default tier for AI-backed operations: 5 per minute, fail-closed.
    pub fn ai() -> Self {
        Self::new(AI_POLICY, 5, 60_000).with_failure_mode(FailureMode::Closed)
    }

    /// Check the policy parameters.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TollgateError::Config(
                "policy name must not be empty".to_string(),
            ));
        }
        if self.limit < 1 {
            return Err(TollgateError::Config(format!(
                "policy '{}': limit must be at least 1",
                self.name
            )));
        }
        if self.window_ms == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}': window_ms must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// The set of policies known to the service.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, Policy>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the `general` and `ai` tiers.
    pub fn with_default_tiers() -> Self {
        let mut registry = Self::new();
        for policy in [Policy::general(), Policy::ai()] {
            registry.policies.insert(policy.name.clone(), policy);
        }
        registry
    }

    /// Build a registry from a list of policies, failing on the first bad one.
    pub fn from_policies<I>(policies: I) -> Result<Self>
    where
        I: IntoIterator<Item = Policy>,
    {
        let mut registry = Self::new();
        for policy in policies {
            registry.register(policy)?;
        }
        Ok(registry)
    }

    /// Register a policy.
    ///
    /// Registering an identical policy again is a no-op; reusing a name with
    /// different parameters is a configuration error.
    pub fn register(&mut self, policy: Policy) -> Result<()> {
        policy.validate()?;

        if let Some(existing) = self.policies.get(&policy.name) {
            if *existing == policy {
                debug!(policy = %policy.name, "Policy already registered");
                return Ok(());
            }
            return Err(TollgateError::Config(format!(
                "policy '{}' already registered with different parameters \
                 (limit={}, window_ms={}, on_backend_failure={:?})",
                existing.name, existing.limit, existing.window_ms, existing.on_backend_failure
            )));
        }

        debug!(
            policy = %policy.name,
            limit = policy.limit,
            window_ms = policy.window_ms,
            on_backend_failure = ?policy.on_backend_failure,
            "Registered rate limit policy"
        );
        self.policies.insert(policy.name.clone(), policy);
        Ok(())
    }

    /// Look up a policy by name.
    pub fn lookup(&self, name: &str) -> Result<&Policy> {
        self.policies
            .get(name)
            .ok_or_else(|| TollgateError::Config(format!("unknown policy '{}'", name)))
    }

    /// The largest window among all policies, or 0 when empty.
    pub fn max_window_ms(&self) -> u64 {
        self.policies.values().map(|p| p.window_ms).max().unwrap_or(0)
    }

    /// Iterate over the registered policies in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
