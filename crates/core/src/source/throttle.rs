//! Request spacing for rate-limited sources.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::metrics;

#[derive(Debug)]
struct ThrottleState {
    last_request: Option<Instant>,
    interval: Duration,
}

/// Enforces a minimum spacing between requests.
///
/// The spacing doubles on every rate-limit response, up to `max_interval`,
/// and drops back to `min_interval` after a successful request.
#[derive(Debug)]
pub struct RequestThrottle {
    service: String,
    min_interval: Duration,
    max_interval: Duration,
    state: Mutex<ThrottleState>,
}

impl RequestThrottle {
    pub fn new(service: impl Into<String>, min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            service: service.into(),
            min_interval,
            max_interval: max_interval.max(min_interval),
            state: Mutex::new(ThrottleState {
                last_request: None,
                interval: min_interval,
            }),
        }
    }

    /// Wait until the next request may be sent, then record it.
    ///
    /// Callers are serialized, so concurrent fetches queue up behind each other.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_request {
            let ready_at = last + state.interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        state.last_request = Some(Instant::now());
    }

    pub async fn on_rate_limited(&self) {
        let mut state = self.state.lock().await;
        state.interval = (state.interval * 2).min(self.max_interval);
        metrics::THROTTLE_BACKOFFS
            .with_label_values(&[self.service.as_str()])
            .inc();
        warn!(
            service = %self.service,
            interval_ms = state.interval.as_millis() as u64,
            "Rate limited, widening request interval"
        );
    }

    pub async fn on_success(&self) {
        self.state.lock().await.interval = self.min_interval;
    }

    pub async fn current_interval(&self) -> Duration {
        self.state.lock().await.interval
    }
}
