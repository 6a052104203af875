//! Outbound reconnection with exponential backoff.
//!
//! [`ReconnectState`] computes exponentially increasing delays with jitter.
//! [`reconnect_loop`] drives [`Connection::reconnect`] with those delays, and
//! [`ReconnectPolicy`] starts the loop whenever a connection finds itself
//! offline with packets to send.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::connection::{Connection, ConnectionPolicy};

/// Configuration for outbound reconnection behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Maximum delay between reconnection attempts. Default: 30 s.
    pub max_delay: Duration,
    /// Maximum number of reconnection attempts before giving up. Default: 20.
    pub max_attempts: u32,
    /// Jitter factor (0.0–1.0). Applied as ±jitter to the delay. Default: 0.25.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 20,
            jitter: 0.25,
        }
    }
}

/// Tracks reconnection attempt count and computes the next backoff delay.
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectState {
    /// Create a new state from the given config.
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    /// Returns `None` if max attempts have been exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }

        let base = self.current_delay;
        self.attempts += 1;

        // Uniform in [base * (1 - jitter), base * (1 + jitter)]
        let jittered = if self.config.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.backoff_multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    /// Reset the reconnection state (called after a successful reconnection).
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Return the number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Reconnect `connection` to its armed endpoint using exponential backoff.
///
/// Returns as soon as the connection is up, including when another task
/// brought it up first.
pub async fn reconnect_loop(
    connection: &Arc<Connection>,
    config: ReconnectConfig,
) -> Result<(), ReconnectError> {
    let mut state = ReconnectState::new(config);

    loop {
        let Some(delay) = state.next_delay() else {
            return Err(ReconnectError::MaxAttemptsExhausted);
        };
        tracing::info!(
            "[{}] reconnection attempt {} in {:?}",
            connection.id(),
            state.attempts(),
            delay
        );
        tokio::time::sleep(delay).await;

        let outcome = connection.reconnect().await;
        if outcome.is_ok() {
            tracing::info!(
                "[{}] reconnected after {} attempts",
                connection.id(),
                state.attempts()
            );
            return Ok(());
        }
        tracing::warn!(
            "[{}] reconnection attempt {} failed: {outcome}",
            connection.id(),
            state.attempts()
        );
    }
}

/// Errors produced by the reconnection system.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// All configured attempts were used without success.
    #[error("maximum reconnection attempts exhausted")]
    MaxAttemptsExhausted,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// [`ConnectionPolicy`] that reconnects in the background when a send finds
/// the connection offline. At most one loop runs per policy.
#[derive(Debug, Clone, Default)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    in_flight: Arc<AtomicBool>,
}

impl ReconnectPolicy {
    /// Create a policy using `config` for every reconnection loop.
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a reconnection loop is running.
    pub fn is_reconnecting(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl ConnectionPolicy for ReconnectPolicy {
    fn prepare_offline_send(&self, connection: &Arc<Connection>) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("[{}] no tokio runtime to reconnect on", connection.id());
            self.in_flight.store(false, Ordering::Release);
            return;
        };

        let connection = Arc::clone(connection);
        let config = self.config.clone();
        let in_flight = Arc::clone(&self.in_flight);
        runtime.spawn(async move {
            if let Err(e) = reconnect_loop(&connection, config).await {
                tracing::error!("[{}] giving up: {e}", connection.id());
            }
            in_flight.store(false, Ordering::Release);
        });
    }
}
