use std::sync::RwLock;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    /// Set until the relay loop reports for the first time
    Starting,
    /// Recently reported healthy, will need to report again before the deadline
    HealthyUntil(Instant),
    /// The relay loop exited
    Stopped,
}

impl LivenessStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            LivenessStatus::HealthyUntil(until) => *until > Instant::now(),
            _ => false,
        }
    }
}

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.is_healthy() {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

/// Liveness of the relay loop.
///
/// The loop must report at least once per `deadline`, otherwise the liveness check fails
/// and the orchestrator restarts the process.
pub struct Liveness {
    deadline: Duration,
    status: RwLock<LivenessStatus>,
}

impl Liveness {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            status: RwLock::new(LivenessStatus::Starting),
        }
    }

    pub fn report_healthy(&self) {
        self.set(LivenessStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_stopped(&self) {
        self.set(LivenessStatus::Stopped);
    }

    pub fn status(&self) -> LivenessStatus {
        match self.status.read() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set(&self, status: LivenessStatus) {
        match self.status.write() {
            Ok(mut current) => *current = status,
            Err(poisoned) => {
                warn!("liveness lock was poisoned, overwriting status");
                *poisoned.into_inner() = status;
            }
        }
    }
}
