//! Events published by the session.
//!
//! Consumers subscribe to a broadcast channel. Exec status, stats and log
//! line updates can arrive in bursts, so they pass through a
//! [`RateLimited`] token bucket. When throttled, exec status and stats
//! deliver only the latest payload; log lines are held back and flushed
//! together, keeping at most a scrollback's worth.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{DebuggerError, Result};
use crate::ratelimit::RateLimited;
use crate::session::{BasicInfo, Breakpoint, CallFrame, DebugStats, ExecStatus, Local, LogLine};

/// Something that changed in the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum DebuggerEvent {
    /// Handshake accepted.
    Attached,
    /// Connection gone.
    Detached,
    ExecStatusChanged(ExecStatus),
    BreakpointsChanged(Vec<Breakpoint>),
    LocalsChanged(Vec<Local>),
    CallStackChanged(Vec<CallFrame>),
    BasicInfoChanged(BasicInfo),
    StatsChanged(DebugStats),
    LogLine(LogLine),
}

/// Payload-free discriminant of [`DebuggerEvent`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Attached,
    Detached,
    ExecStatusChanged,
    BreakpointsChanged,
    LocalsChanged,
    CallStackChanged,
    BasicInfoChanged,
    StatsChanged,
    LogLine,
}

impl DebuggerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DebuggerEvent::Attached => EventKind::Attached,
            DebuggerEvent::Detached => EventKind::Detached,
            DebuggerEvent::ExecStatusChanged(_) => EventKind::ExecStatusChanged,
            DebuggerEvent::BreakpointsChanged(_) => EventKind::BreakpointsChanged,
            DebuggerEvent::LocalsChanged(_) => EventKind::LocalsChanged,
            DebuggerEvent::CallStackChanged(_) => EventKind::CallStackChanged,
            DebuggerEvent::BasicInfoChanged(_) => EventKind::BasicInfoChanged,
            DebuggerEvent::StatsChanged(_) => EventKind::StatsChanged,
            DebuggerEvent::LogLine(_) => EventKind::LogLine,
        }
    }
}

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Burst size.
    pub capacity: u32,
    /// One token is added per period.
    pub period: Duration,
}

impl RateLimit {
    pub const fn new(capacity: u32, period: Duration) -> Self {
        Self { capacity, period }
    }
}

/// A rate limited, latest-wins slot for one event kind.
struct Throttled<T> {
    latest: Arc<Mutex<Option<T>>>,
    limiter: RateLimited,
}

impl<T: Send + 'static> Throttled<T> {
    fn new(
        tx: broadcast::Sender<DebuggerEvent>,
        limit: RateLimit,
        wrap: fn(T) -> DebuggerEvent,
    ) -> Self {
        let latest: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let slot = latest.clone();
        let limiter = RateLimited::spawn(limit.capacity, limit.period, move || {
            let value = lock(&slot).take();
            if let Some(value) = value {
                let _ = tx.send(wrap(value));
            }
        });
        Self { latest, limiter }
    }

    fn publish(&self, value: T) {
        *lock(&self.latest) = Some(value);
        self.limiter.trigger();
    }
}

/// A rate limited queue of log lines, flushed whole on each callback.
struct Buffered {
    queue: Arc<Mutex<VecDeque<LogLine>>>,
    backlog: usize,
    limiter: RateLimited,
}

impl Buffered {
    fn new(tx: broadcast::Sender<DebuggerEvent>, limit: RateLimit, backlog: usize) -> Self {
        let queue: Arc<Mutex<VecDeque<LogLine>>> = Arc::new(Mutex::new(VecDeque::new()));
        let pending = queue.clone();
        let limiter = RateLimited::spawn(limit.capacity, limit.period, move || {
            let lines = std::mem::take(&mut *lock(&pending));
            for line in lines {
                let _ = tx.send(DebuggerEvent::LogLine(line));
            }
        });
        Self {
            queue,
            backlog: backlog.max(1),
            limiter,
        }
    }

    fn publish(&self, line: LogLine) {
        {
            let mut queue = lock(&self.queue);
            queue.push_back(line);
            while queue.len() > self.backlog {
                queue.pop_front();
            }
        }
        self.limiter.trigger();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fans session events out to subscribers.
pub(crate) struct Publisher {
    tx: broadcast::Sender<DebuggerEvent>,
    exec_status: Throttled<ExecStatus>,
    stats: Throttled<DebugStats>,
    log_lines: Buffered,
}

impl Publisher {
    /// Create a publisher. Must be called from within a tokio runtime.
    ///
    /// At most `backlog` throttled log lines are held back between flushes.
    pub(crate) fn new(
        capacity: usize,
        exec_status: RateLimit,
        stats: RateLimit,
        log_lines: RateLimit,
        backlog: usize,
    ) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            exec_status: Throttled::new(tx.clone(), exec_status, DebuggerEvent::ExecStatusChanged),
            stats: Throttled::new(tx.clone(), stats, DebuggerEvent::StatsChanged),
            log_lines: Buffered::new(tx.clone(), log_lines, backlog),
            tx,
        }
    }

    pub(crate) fn publish(&self, event: DebuggerEvent) {
        match event {
            DebuggerEvent::ExecStatusChanged(status) => self.exec_status.publish(status),
            DebuggerEvent::StatsChanged(stats) => self.stats.publish(stats),
            DebuggerEvent::LogLine(line) => self.log_lines.publish(line),
            other => {
                // No subscribers is fine
                let _ = self.tx.send(other);
            }
        }
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<DebuggerEvent> {
        self.tx.clone()
    }
}

/// A receiver of session events, optionally filtered by kind.
pub struct Subscription {
    rx: broadcast::Receiver<DebuggerEvent>,
    kinds: Option<Vec<EventKind>>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<DebuggerEvent>, kinds: Option<Vec<EventKind>>) -> Self {
        Self { rx, kinds }
    }

    /// Wait for the next matching event.
    ///
    /// A slow subscriber skips events it lagged behind on. Returns
    /// `SessionClosed` once the debugger is gone.
    pub async fn recv(&mut self) -> Result<DebuggerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event subscriber lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(DebuggerError::SessionClosed),
            }
        }
    }

    fn matches(&self, event: &DebuggerEvent) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&event.kind()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ExecState;

    fn status(line: u32) -> ExecStatus {
        ExecStatus {
            attached: true,
            state: ExecState::Running,
            line,
            ..ExecStatus::default()
        }
    }

    fn publisher() -> Publisher {
        Publisher::new(
            64,
            RateLimit::new(2, Duration::from_millis(500)),
            RateLimit::new(1, Duration::from_secs(2)),
            RateLimit::new(3, Duration::from_secs(1)),
            4,
        )
    }

    fn line(n: u32) -> DebuggerEvent {
        DebuggerEvent::LogLine(LogLine::info(format!("line {}", n)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_exec_status_latest_wins() {
        let publisher = publisher();
        let mut sub = Subscription::new(publisher.sender().subscribe(), None);

        for line in 1..=5 {
            publisher.publish(DebuggerEvent::ExecStatusChanged(status(line)));
        }

        assert_eq!(sub.recv().await.unwrap(), DebuggerEvent::ExecStatusChanged(status(1)));
        assert_eq!(sub.recv().await.unwrap(), DebuggerEvent::ExecStatusChanged(status(2)));

        // Lines 3 and 4 are superseded; 5 arrives after one refill period
        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(sub.recv().await.unwrap(), DebuggerEvent::ExecStatusChanged(status(5)));
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unthrottled_events_pass_through() {
        let publisher = publisher();
        let mut sub = Subscription::new(publisher.sender().subscribe(), None);

        for _ in 0..10 {
            publisher.publish(DebuggerEvent::Attached);
        }
        for _ in 0..10 {
            assert_eq!(sub.recv().await.unwrap(), DebuggerEvent::Attached);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_log_lines_flush_backlog() {
        let publisher = publisher();
        let mut sub = Subscription::new(publisher.sender().subscribe(), None);

        for n in 1..=10 {
            publisher.publish(line(n));
        }

        // Burst of three goes straight through
        for n in 1..=3 {
            assert_eq!(sub.recv().await.unwrap(), line(n));
        }
        assert!(sub.rx.try_recv().is_err());

        // The held back lines flush together, oldest trimmed to the backlog
        tokio::time::sleep(Duration::from_millis(1001)).await;
        for n in 7..=10 {
            assert_eq!(sub.recv().await.unwrap(), line(n));
        }
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_subscription() {
        let publisher = publisher();
        let mut sub = Subscription::new(
            publisher.sender().subscribe(),
            Some(vec![EventKind::Detached]),
        );

        publisher.publish(DebuggerEvent::Attached);
        publisher.publish(DebuggerEvent::LogLine(LogLine::info("x")));
        publisher.publish(DebuggerEvent::Detached);

        assert_eq!(sub.recv().await.unwrap(), DebuggerEvent::Detached);
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let publisher = publisher();
        let mut sub = Subscription::new(publisher.sender().subscribe(), None);
        drop(publisher);

        assert!(matches!(sub.recv().await, Err(DebuggerError::SessionClosed)));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(DebuggerEvent::Attached).unwrap();
        assert_eq!(json["event"], "attached");
    }
}
