//! Admission control: policies, window state and the decision engine.

mod backend;
mod clock;
mod key;
mod limiter;
mod policy;
#[cfg(feature = "redis")]
mod redis_store;
mod sweeper;
mod window;

pub use backend::WindowBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{ClientKey, KeyExtractor, RequestContext, ANONYMOUS_CLIENT_KEY};
pub use limiter::RateLimiter;
pub use policy::{FailureMode, Policy, PolicyRegistry, AI_POLICY, GENERAL_POLICY};
#[cfg(feature = "redis")]
pub use redis_store::{RedisWindowStore, DEFAULT_KEY_PREFIX};
pub use sweeper::{Sweeper, SweeperHandle, DEFAULT_SWEEP_INTERVAL};
pub use window::{Decision, WindowKey, WindowRecord, WindowStore};
