//! Connection timers and the shared heartbeat scheduler.
//!
//! Every connection owns a [`LogicTimer`] describing its heartbeat interval.
//! One [`HeartbeatScheduler`] task per [`NetContext`](crate::NetContext)
//! wakes roughly once per tick, and calls
//! [`Connection::process_timer`](crate::Connection::process_timer) for each
//! connection whose timer has expired.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::sync::lock;

/// Interval timer polled by the heartbeat scheduler.
#[derive(Debug)]
pub struct LogicTimer {
    interval: Duration,
    active: bool,
    last: Instant,
}

impl LogicTimer {
    /// Create an inactive timer.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            active: false,
            last: Instant::now(),
        }
    }

    /// Change the interval.
    pub fn set_timer(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Interval between expiries.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start counting from now.
    pub fn activate(&mut self) {
        self.active = true;
        self.last = Instant::now();
    }

    /// Stop the timer.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Whether the timer is running.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether a full interval has elapsed since the last expiry.
    ///
    /// An expiry restarts the interval.
    pub fn expired(&mut self) -> bool {
        if !self.active || self.last.elapsed() < self.interval {
            return false;
        }
        self.last += self.interval;
        // Skip missed intervals instead of firing a burst.
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
        }
        true
    }
}

/// One background task driving the heartbeat timers of many connections.
pub struct HeartbeatScheduler {
    tick: Duration,
    connections: Arc<Mutex<Vec<Weak<Connection>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatScheduler {
    /// Create a scheduler checking timers every `tick`. Default tick: 1 s.
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            connections: Arc::new(Mutex::new(Vec::new())),
            worker: Mutex::new(None),
        }
    }

    /// Service `connection` until it is dropped or its timer is stopped.
    ///
    /// The worker task starts on the first registration.
    pub fn register(&self, connection: &Arc<Connection>) {
        {
            let mut connections = lock(&self.connections);
            let already = connections
                .iter()
                .any(|c| std::ptr::eq(c.as_ptr(), Arc::as_ptr(connection)));
            if !already {
                connections.push(Arc::downgrade(connection));
            }
        }

        let mut worker = lock(&self.worker);
        if worker.as_ref().is_none_or(JoinHandle::is_finished) {
            *worker = Some(self.spawn_worker());
        }
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let tick = self.tick;
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;

                let due: Vec<Arc<Connection>> = {
                    let mut connections = lock(&connections);
                    connections.retain(|weak| {
                        weak.upgrade().is_some_and(|c| c.heartbeat_timer_active())
                    });
                    connections.iter().filter_map(Weak::upgrade).collect()
                };

                for connection in due {
                    connection.process_timer();
                }
            }
        })
    }

    /// Number of connections being serviced.
    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Whether no connection is being serviced.
    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }

    /// Stop the worker task and forget every connection.
    pub fn shutdown(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
        lock(&self.connections).clear();
    }
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_inactive_timer_never_expires() {
        let mut timer = LogicTimer::new(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!timer.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expires_once_per_interval() {
        let mut timer = LogicTimer::new(Duration::from_secs(10));
        timer.activate();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!timer.expired());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(timer.expired());
        assert!(!timer.expired(), "Expiry restarts the interval");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(timer.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_intervals_fire_once() {
        let mut timer = LogicTimer::new(Duration::from_secs(1));
        timer.activate();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(timer.expired());
        assert!(!timer.expired());
    }

    #[tokio::test]
    async fn test_dropping_scheduler_stops_worker() {
        use crate::connection::ConnectionBuilder;
        use crate::context::NetContext;
        use crate::testing::{MockTransport, settle};

        let peer = MockTransport::pair();
        let connection = ConnectionBuilder::new(NetContext::new(Duration::from_secs(1)))
            .accepted(peer.as_transport());
        let scheduler = HeartbeatScheduler::new(Duration::from_millis(10));
        scheduler.register(&connection);
        let worker = lock(&scheduler.worker)
            .as_ref()
            .map(JoinHandle::abort_handle)
            .unwrap();
        assert!(!worker.is_finished());

        drop(scheduler);
        settle().await;
        assert!(worker.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_stops_expiry() {
        let mut timer = LogicTimer::new(Duration::from_secs(1));
        timer.activate();
        timer.deactivate();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!timer.is_active());
        assert!(!timer.expired());
    }
}
