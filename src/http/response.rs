//! Translation of admission decisions into caller-facing responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ratelimit::Decision;

/// Body text of every throttling response.
pub const TOO_MANY_REQUESTS: &str = "Too many requests";

/// What the caller should do with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Go ahead with the protected operation.
    Proceed { remaining: u64 },
    /// Decline the operation and surface the rejection.
    Reject(Rejection),
}

impl From<Decision> for Verdict {
    fn from(decision: Decision) -> Self {
        if decision.admitted {
            Verdict::Proceed {
                remaining: decision.remaining,
            }
        } else {
            Verdict::Reject(Rejection {
                retry_after_ms: decision.retry_after_ms,
            })
        }
    }
}

/// A throttling rejection, rendered as HTTP 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub retry_after_ms: u64,
}

impl Rejection {
    /// Value for the `Retry-After` header: whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1_000)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody {
    error: &'static str,
    retry_after_ms: u64,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = RejectionBody {
            error: TOO_MANY_REQUESTS,
            retry_after_ms: self.retry_after_ms,
        };
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, self.retry_after_secs().to_string())],
            Json(body),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admitted_decision_proceeds() {
        assert_eq!(
            Verdict::from(Decision::admit(3)),
            Verdict::Proceed { remaining: 3 }
        );
    }

    #[test]
    fn test_denied_decision_rejects() {
        assert_eq!(
            Verdict::from(Decision::deny(55_000)),
            Verdict::Reject(Rejection {
                retry_after_ms: 55_000
            })
        );
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(Rejection { retry_after_ms: 0 }.retry_after_secs(), 0);
        assert_eq!(Rejection { retry_after_ms: 1 }.retry_after_secs(), 1);
        assert_eq!(Rejection { retry_after_ms: 1_000 }.retry_after_secs(), 1);
        assert_eq!(Rejection { retry_after_ms: 55_001 }.retry_after_secs(), 56);
    }

    #[test]
    fn test_rejection_response() {
        let response = Rejection {
            retry_after_ms: 55_000,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "55");
    }
}
