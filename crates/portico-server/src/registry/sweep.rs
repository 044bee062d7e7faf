//! Liveness sweeping.
//!
//! A sweep pings every session, tears down the ones that did not answer and
//! drops them from the table. Sessions stuck in `Closing` get
//! `closing_timeout` to finish their handshake before they are forced.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use portico_core::{CloseFrame, ConnectionState, ServerState};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::SessionRegistry;
use crate::metrics::{WS_SESSIONS_ACTIVE, WS_SWEEP_EVICTIONS_TOTAL, WS_SWEEP_SKIPPED_TOTAL};
use crate::session::Session;

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep was running; nothing was done.
    pub skipped: bool,
    /// Sessions pinged.
    pub inspected: usize,
    /// Open sessions that missed the ping and were aborted.
    pub aborted: usize,
    /// Closing sessions that exceeded the closing timeout.
    pub forced: usize,
    /// Sessions dropped from the table.
    pub removed: usize,
}

/// Held for the duration of a sweep.
struct SweepGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl<'a> SweepGuard<'a> {
    fn try_acquire(flag: &'a Mutex<bool>) -> Option<Self> {
        let mut sweeping = flag.lock();
        if *sweeping {
            return None;
        }
        *sweeping = true;
        Some(Self { flag })
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        *self.flag.lock() = false;
    }
}

impl SessionRegistry {
    /// Ping everything and evict what did not answer.
    ///
    /// At most one sweep runs per registry; a concurrent call returns a
    /// report with `skipped` set.
    pub async fn sweep(&self) -> SweepReport {
        let Some(_guard) = SweepGuard::try_acquire(&self.sweeping) else {
            metrics::counter!(WS_SWEEP_SKIPPED_TOTAL, "path" => self.path.clone()).increment(1);
            trace!(path = %self.path, "sweep already running");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };
        if self.state() != ServerState::Start {
            return SweepReport::default();
        }

        let options = self.options();
        let liveness = self.broadping(Bytes::new(), options.wait_time).await;
        let mut report = SweepReport {
            inspected: liveness.len(),
            ..SweepReport::default()
        };

        let now = Instant::now();
        let mut doomed: Vec<Arc<Session>> = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state != ServerState::Start {
                return report;
            }
            for (id, alive) in &liveness {
                if *alive {
                    continue;
                }
                let Some(session) = inner.sessions.get(id) else {
                    continue;
                };
                match session.state() {
                    ConnectionState::Open => {
                        report.aborted += 1;
                        doomed.push(Arc::clone(session));
                    }
                    ConnectionState::Closing => {
                        if session.observe_closing(now) < options.closing_timeout {
                            continue;
                        }
                        report.forced += 1;
                        doomed.push(Arc::clone(session));
                    }
                    ConnectionState::Connecting | ConnectionState::Closed => {}
                }
                let _ = inner.sessions.remove(id);
                report.removed += 1;
            }
            if report.removed > 0 {
                metrics::gauge!(WS_SESSIONS_ACTIVE, "path" => self.path.clone())
                    .set(inner.sessions.len() as f64);
            }
        }

        let abnormal = CloseFrame::abnormal();
        let teardowns = doomed
            .iter()
            .map(|session| session.transport().close(&abnormal, options.wait_time));
        let _ = join_all(teardowns).await;

        if report.removed > 0 {
            metrics::counter!(WS_SWEEP_EVICTIONS_TOTAL, "path" => self.path.clone())
                .increment(report.removed as u64);
            info!(
                path = %self.path,
                inspected = report.inspected,
                aborted = report.aborted,
                forced = report.forced,
                removed = report.removed,
                "sweep evicted sessions"
            );
        } else {
            debug!(path = %self.path, inspected = report.inspected, "sweep found nothing to evict");
        }
        report
    }

    /// Whether a sweep is in progress.
    pub fn is_sweeping(&self) -> bool {
        *self.sweeping.lock()
    }
}

/// Start the periodic sweep, replacing any timer already armed.
///
/// The task holds only a weak reference and ends with the registry.
pub(super) fn arm_timer(registry: &Arc<SessionRegistry>, interval: Duration) {
    let token = CancellationToken::new();
    if let Some(previous) = registry.sweep_timer.lock().replace(token.clone()) {
        previous.cancel();
    }
    let weak = Arc::downgrade(registry);
    drop(tokio::spawn(run_timer(weak, interval, token)));
}

async fn run_timer(registry: Weak<SessionRegistry>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    let _ = ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(registry) = registry.upgrade() else {
            break;
        };
        drop(tokio::spawn(async move {
            let _ = registry.sweep().await;
        }));
    }
    trace!("sweep timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, test_context};
    use crate::transport::Transport;
    use portico_core::CloseCode;

    fn started(configure: impl FnOnce(&SessionRegistry)) -> Arc<SessionRegistry> {
        let registry = SessionRegistry::new("/chat");
        let _ = registry.set_keep_clean(false);
        let _ = registry.set_wait_time(Duration::from_millis(20)).unwrap();
        configure(registry.as_ref());
        registry.start();
        registry
    }

    fn add(registry: &Arc<SessionRegistry>, transport: &Arc<FakeTransport>) -> Arc<Session> {
        registry
            .add(Arc::clone(transport) as Arc<dyn Transport>, test_context("/chat"))
            .unwrap()
    }

    #[tokio::test]
    async fn silent_session_is_aborted() {
        let registry = started(|_| {});
        let alive = FakeTransport::new();
        let silent = FakeTransport::new();
        silent.set_answers_pings(false);
        let keep = add(&registry, &alive);
        let gone = add(&registry, &silent);

        let report = registry.sweep().await;

        assert_eq!(report.inspected, 2);
        assert_eq!(report.aborted, 1);
        assert_eq!(report.removed, 1);
        assert!(registry.get(keep.id()).is_some());
        assert!(registry.get(gone.id()).is_none());
        assert_eq!(silent.closes()[0].code(), CloseCode::ABNORMAL);
        assert_eq!(silent.state(), ConnectionState::Closed);
        assert!(alive.closes().is_empty());
    }

    #[tokio::test]
    async fn closed_session_is_dropped_without_close() {
        let registry = started(|_| {});
        let transport = FakeTransport::new();
        let session = add(&registry, &transport);
        transport.set_state(ConnectionState::Closed);

        let report = registry.sweep().await;

        assert_eq!(report.removed, 1);
        assert_eq!(report.aborted, 0);
        assert!(registry.get(session.id()).is_none());
        assert!(transport.closes().is_empty());
    }

    #[tokio::test]
    async fn closing_session_gets_its_timeout() {
        let registry = started(|registry| {
            let _ = registry.set_closing_timeout(Duration::from_millis(80));
        });
        let transport = FakeTransport::new();
        let session = add(&registry, &transport);
        transport.set_state(ConnectionState::Closing);

        let first = registry.sweep().await;
        assert_eq!(first.removed, 0);
        assert!(registry.get(session.id()).is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = registry.sweep().await;
        assert_eq!(second.forced, 1);
        assert_eq!(second.removed, 1);
        assert!(registry.get(session.id()).is_none());
        assert_eq!(transport.closes()[0].code(), CloseCode::ABNORMAL);
    }

    #[tokio::test]
    async fn unanswered_close_is_forced_after_timeout() {
        let registry = started(|registry| {
            let _ = registry.set_closing_timeout(Duration::from_millis(60));
        });
        let transport = FakeTransport::new();
        transport.set_completes_close(false);
        let session = add(&registry, &transport);

        registry.close_session(session.id(), 1000, "done").await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Closing);

        let first = registry.sweep().await;
        assert_eq!(first.removed, 0);
        assert!(registry.get(session.id()).is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = registry.sweep().await;
        assert_eq!(second.forced, 1);
        assert_eq!(second.removed, 1);
        assert!(registry.get(session.id()).is_none());
        let closes = transport.closes();
        assert_eq!(closes.len(), 2);
        assert_eq!(closes[0].code(), CloseCode::NORMAL);
        assert_eq!(closes[1].code(), CloseCode::ABNORMAL);
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn concurrent_sweep_is_skipped() {
        let registry = started(|_| {});
        let _ = add(&registry, &FakeTransport::new());

        let guard = SweepGuard::try_acquire(&registry.sweeping).unwrap();
        assert!(registry.is_sweeping());
        let report = registry.sweep().await;
        assert!(report.skipped);
        assert_eq!(report.inspected, 0);
        drop(guard);

        assert!(!registry.is_sweeping());
        let report = registry.sweep().await;
        assert!(!report.skipped);
        assert_eq!(report.inspected, 1);
    }

    #[tokio::test]
    async fn sweep_before_start_does_nothing() {
        let registry = SessionRegistry::new("/chat");
        assert_eq!(registry.sweep().await, SweepReport::default());
    }

    #[tokio::test]
    async fn timer_evicts_silent_sessions() {
        let registry = SessionRegistry::new("/chat");
        let _ = registry.set_wait_time(Duration::from_millis(20)).unwrap();
        let _ = registry.set_sweep_interval(Duration::from_millis(50));
        registry.start();

        let alive = FakeTransport::new();
        let silent = FakeTransport::new();
        silent.set_answers_pings(false);
        let _ = add(&registry, &alive);
        let _ = add(&registry, &silent);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(registry.count(), 1);
        assert!(alive.ping_count() >= 1);
        assert!(!silent.closes().is_empty());
    }

    #[tokio::test]
    async fn stop_disarms_timer() {
        let registry = SessionRegistry::new("/chat");
        let _ = registry.set_sweep_interval(Duration::from_millis(20));
        registry.start();
        let transport = FakeTransport::new();
        let _ = add(&registry, &transport);

        registry.stop(1000, "").await.unwrap();
        let pings = transport.ping_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.ping_count(), pings);
    }
}
