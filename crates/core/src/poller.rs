use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::api::CanonicalSource;
use crate::store::SyncStore;
use crate::view::ConversationView;

/// Shortest period a poller runs at; smaller intervals are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Periodic reconciliation loop. Fetches immediately, then once per interval,
/// until stopped. At most one loop per handle; dropping the handle stops it.
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Cancel the next tick. A fetch already in flight is abandoned and its
    /// result never applied.
    pub fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_loop<F, Fut>(interval: Duration, mut tick: F) -> PollerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let interval = interval.max(MIN_POLL_INTERVAL);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = tick() => {}
                _ = shutdown_rx.changed() => break,
            }
        }
    });
    PollerHandle {
        shutdown: shutdown_tx,
        task: Some(task),
    }
}

/// Keep a conversation view reconciled with the canonical history.
///
/// The view ticket is captured before each request, so a response for a
/// selection that has since changed is discarded by the view.
pub fn poll_view(
    view: Arc<Mutex<ConversationView>>,
    source: Arc<dyn CanonicalSource>,
    interval: Duration,
) -> PollerHandle {
    info!(interval_ms = interval.as_millis() as u64, "Starting view poller");
    spawn_loop(interval, move || {
        let view = view.clone();
        let source = source.clone();
        async move {
            let ticket = view.lock().ticket();
            match source.list_events().await {
                Ok(events) => {
                    view.lock().apply_fetch(ticket, &events);
                }
                Err(e) => view.lock().record_failure(ticket, &e),
            }
        }
    })
}

/// Keep the session event log reconciled for the global feed.
pub fn poll_feed(
    store: Arc<SyncStore>,
    source: Arc<dyn CanonicalSource>,
    interval: Duration,
) -> PollerHandle {
    info!(interval_ms = interval.as_millis() as u64, "Starting feed poller");
    spawn_loop(interval, move || {
        let store = store.clone();
        let source = source.clone();
        async move {
            if let Err(e) = store.reconcile_events(source.as_ref()).await {
                debug!(error = %e, "Feed reconciliation failed, keeping current log");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticLog;
    use crate::error::{SyncError, SyncResult};
    use crate::types::*;
    use crate::view::ViewScope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a growing history; fails on the calls listed in `fail_on`.
    struct CountingSource {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    impl CountingSource {
        fn new(fail_on: Vec<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl CanonicalSource for CountingSource {
        async fn list_events(&self) -> SyncResult<Vec<Event>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&n) {
                return Err(SyncError::fetch("/api/events", "unavailable"));
            }
            Ok((0..=n)
                .map(|i| {
                    serde_json::from_value(serde_json::json!({
                        "id": format!("e{i}"),
                        "actor_id": "a1",
                        "timestamp": format!("2025-01-01T00:00:{:02}Z", i),
                    }))
                    .unwrap()
                })
                .collect())
        }
        async fn list_agents(&self) -> SyncResult<Vec<Agent>> {
            Ok(vec![])
        }
        async fn list_relations(&self) -> SyncResult<Vec<Relation>> {
            Ok(vec![])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_poller_fetches_immediately_and_on_interval() {
        let view = Arc::new(Mutex::new(ConversationView::new(50)));
        view.lock().select_view(ViewScope::conversation("c1", ["a1"]));
        let source = Arc::new(CountingSource::new(vec![]));

        let mut handle = poll_view(view.clone(), source.clone(), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(view.lock().total(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(view.lock().total(), 2);

        handle.stop();
        assert!(!handle.is_running());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_poller_failure_keeps_last_good() {
        let view = Arc::new(Mutex::new(ConversationView::new(50)));
        view.lock().select_view(ViewScope::conversation("c1", ["a1"]));
        let source = Arc::new(CountingSource::new(vec![1]));

        let _handle = poll_view(view.clone(), source.clone(), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(view.lock().total(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(view.lock().total(), 1);
        assert!(!view.lock().project().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_poller_result_after_switch_is_discarded() {
        let view = Arc::new(Mutex::new(ConversationView::new(50)));
        view.lock().select_view(ViewScope::conversation("c1", ["a1"]));
        let source = Arc::new(CountingSource::new(vec![]));

        let mut handle = poll_view(view.clone(), source.clone(), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop();

        // Fetch issued for c1, applied after switching to c2
        let stale = view.lock().ticket();
        view.lock().select_view(ViewScope::conversation("c2", ["b1"]));
        let events = source.list_events().await.unwrap();
        assert!(!view.lock().apply_fetch(stale, &events));
        assert!(view.lock().project().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_poller_reconciles_store() {
        let store = Arc::new(SyncStore::new(200, Arc::new(DiagnosticLog::default())));
        let source = Arc::new(CountingSource::new(vec![]));

        let _handle = poll_feed(store.clone(), source.clone(), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.event_count(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.event_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised_to_minimum() {
        let view = Arc::new(Mutex::new(ConversationView::new(50)));
        view.lock().select_view(ViewScope::conversation("c1", ["a1"]));
        let source = Arc::new(CountingSource::new(vec![]));

        let handle = poll_view(view.clone(), source.clone(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(handle.is_running());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(MIN_POLL_INTERVAL).await;
        assert!(handle.is_running());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(view.lock().total(), 2);
    }
}
