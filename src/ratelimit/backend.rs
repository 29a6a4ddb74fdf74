//! Window store trait for abstracting in-process and shared implementations.

use async_trait::async_trait;

use super::policy::Policy;
use super::window::{Decision, WindowKey};
use crate::error::Result;

/// Trait for window store implementations.
///
/// This trait abstracts over the in-process [`WindowStore`](super::WindowStore)
/// and shared stores so the admission engine works with either. Every
/// implementation must apply prune, count and append for one key as a single
/// atomic step.
#[async_trait]
pub trait WindowBackend: Send + Sync {
    /// Admit or deny one request for `key` under `policy` at `now_ms`.
    async fn admit(&self, key: &WindowKey, policy: &Policy, now_ms: u64) -> Result<Decision>;

    /// Drop windows with no admission newer than `now_ms - horizon_ms`.
    ///
    /// Returns the number of windows removed. Backends that expire keys on
    /// their own keep the default.
    async fn sweep(&self, _now_ms: u64, _horizon_ms: u64) -> usize {
        0
    }

    /// Number of windows currently held, if the backend can tell cheaply.
    fn tracked_windows(&self) -> Option<usize> {
        None
    }

    /// Short name for logs and health output.
    fn name(&self) -> &'static str;
}
