//! Periodic background refresh of cached list membership.
//!
//! The scheduler starts its timer the first time a descriptor is inserted and
//! never starts a second one. Each tick snapshots the cached lists, fetches
//! their membership concurrently and swaps in the new member sets. A failed
//! fetch leaves that list's previous membership in place.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::coordinator::{lock_state, SharedState};
use crate::error::RefreshError;
use crate::tracker::ListResolver;
use crate::types::{ListKey, ListSummary};

/// Default refresh period: 6 hours.
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(6 * 60 * 60);

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Lists whose membership was replaced.
    pub refreshed: usize,
    /// Lists whose fetch failed; their stale membership was kept.
    pub failed: Vec<ListKey>,
    /// Lists evicted while their fetch was in flight.
    pub evicted: usize,
}

enum TimerState {
    Off,
    Scheduled(JoinHandle<()>),
    Stopped,
}

struct SchedulerInner {
    state: SharedState,
    resolver: Arc<dyn ListResolver>,
    period: Duration,
    timer: Mutex<TimerState>,
}

/// Owner of the repeating refresh timer.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<SchedulerInner>,
}

impl RefreshScheduler {
    pub fn new(state: SharedState, resolver: Arc<dyn ListResolver>, period: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state,
                resolver,
                period,
                timer: Mutex::new(TimerState::Off),
            }),
        }
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.inner.period
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        matches!(
            *self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner),
            TimerState::Scheduled(_)
        )
    }

    /// Starts the repeating timer unless it is already running or was stopped.
    ///
    /// The first tick fires one full period after this call. Returns `true`
    /// if this call started the timer.
    pub fn ensure_started(&self) -> bool {
        let mut timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !matches!(*timer, TimerState::Off) {
            return false;
        }

        let state = Arc::clone(&self.inner.state);
        let resolver = Arc::clone(&self.inner.resolver);
        let period = self.inner.period;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let report = refresh_descriptors(&state, resolver.as_ref()).await;
                info!(
                    refreshed = report.refreshed,
                    failed = report.failed.len(),
                    evicted = report.evicted,
                    "Refresh pass complete"
                );
            }
        });

        *timer = TimerState::Scheduled(handle);
        info!(period_secs = period.as_secs(), "Refresh timer scheduled");
        true
    }

    /// Runs one refresh pass immediately, independent of the timer.
    pub async fn refresh_all(&self) -> RefreshReport {
        refresh_descriptors(&self.inner.state, self.inner.resolver.as_ref()).await
    }

    /// Cancels the timer. The scheduler cannot be started again afterwards.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(
            &mut *self
                .inner
                .timer
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            TimerState::Stopped,
        );

        if let TimerState::Scheduled(handle) = previous {
            handle.abort();
            info!("Refresh timer cancelled");
        }
    }
}

/// Refreshes every cached list once.
pub async fn refresh_descriptors(state: &SharedState, resolver: &dyn ListResolver) -> RefreshReport {
    let summaries: Vec<ListSummary> = lock_state(state)
        .cache()
        .iter()
        .map(|descriptor| descriptor.summary().clone())
        .collect();

    if summaries.is_empty() {
        debug!("Nothing to refresh");
        return RefreshReport::default();
    }

    debug!(lists = summaries.len(), "Refreshing list membership");

    let results = join_all(summaries.iter().map(|summary| async move {
        (summary.key(), resolver.fetch_member_issue_keys(summary).await)
    }))
    .await;

    let mut report = RefreshReport::default();
    let mut guard = lock_state(state);

    for (key, result) in results {
        match result {
            Ok(members) => {
                if guard.cache_mut().replace_members(&key, members) {
                    report.refreshed += 1;
                } else {
                    report.evicted += 1;
                }
            }
            Err(source) => {
                let err = RefreshError {
                    key: key.clone(),
                    source,
                };
                warn!(list = %key, error = %err, "Keeping stale membership");
                report.failed.push(key);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::WatchState;
    use crate::test_support::{issue_keys, FakeResolver};
    use crate::types::{ListDescriptor, ListKind};

    fn cache_list(state: &SharedState, id: &str, members: &[&str]) {
        let summary = ListSummary {
            id: id.to_string(),
            kind: ListKind::Board,
            name: format!("Board {id}"),
            view_url: format!("https://jira.test/{id}"),
        };
        let mut descriptor = ListDescriptor::new(summary, issue_keys(members));
        descriptor.add_subscriber("S1".into());
        lock_state(state).cache_mut().upsert_descriptor(descriptor);
    }

    fn contains(state: &SharedState, id: &str, issue: &str) -> bool {
        lock_state(state)
            .cache()
            .get_descriptor(&ListKey::board(id))
            .is_some_and(|d| d.contains_issue(issue))
    }

    fn setup(resolver: FakeResolver) -> (SharedState, Arc<FakeResolver>, RefreshScheduler) {
        let state: SharedState = Arc::new(Mutex::new(WatchState::new()));
        let resolver = Arc::new(resolver);
        let scheduler = RefreshScheduler::new(
            Arc::clone(&state),
            Arc::clone(&resolver) as Arc<dyn ListResolver>,
            Duration::from_secs(60),
        );
        (state, resolver, scheduler)
    }

    #[tokio::test]
    async fn refresh_replaces_membership() {
        let (state, resolver, scheduler) = setup(FakeResolver::new());
        cache_list(&state, "1", &["A-1"]);
        resolver.set_list(ListKey::board("1"), "Board 1", &["A-2"]);

        let report = scheduler.refresh_all().await;

        assert_eq!(report.refreshed, 1);
        assert!(contains(&state, "1", "A-2"));
        assert!(!contains(&state, "1", "A-1"));
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let (state, resolver, scheduler) = setup(FakeResolver::new());
        cache_list(&state, "1", &["A-1"]);
        cache_list(&state, "2", &["B-1"]);
        resolver.set_list(ListKey::board("1"), "Board 1", &["A-1", "A-3"]);
        resolver.set_list(ListKey::board("2"), "Board 2", &["B-2"]);
        resolver.fail_fetches_for(ListKey::board("2"));

        let report = scheduler.refresh_all().await;

        assert_eq!(report.refreshed, 1);
        assert_eq!(report.failed, vec![ListKey::board("2")]);
        assert!(contains(&state, "1", "A-3"));
        assert!(contains(&state, "2", "B-1"));
        assert!(!contains(&state, "2", "B-2"));
    }

    #[tokio::test]
    async fn empty_cache_makes_no_calls() {
        let (_state, resolver, scheduler) = setup(FakeResolver::new());

        let report = scheduler.refresh_all().await;

        assert_eq!(report, RefreshReport::default());
        assert_eq!(resolver.fetch_count(), 0);
    }

    #[tokio::test]
    async fn timer_starts_only_once() {
        let (_state, _resolver, scheduler) = setup(FakeResolver::new());

        assert!(!scheduler.is_scheduled());
        assert!(scheduler.ensure_started());
        assert!(!scheduler.ensure_started());
        assert!(scheduler.is_scheduled());

        scheduler.shutdown();
        assert!(!scheduler.is_scheduled());
        assert!(!scheduler.ensure_started());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_refreshes_every_period() {
        let (state, resolver, scheduler) = setup(FakeResolver::new());
        cache_list(&state, "1", &["A-1"]);
        resolver.set_list(ListKey::board("1"), "Board 1", &["A-2"]);

        scheduler.ensure_started();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(resolver.fetch_count(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(resolver.fetch_count(), 1);
        assert!(contains(&state, "1", "A-2"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(resolver.fetch_count(), 2);

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(resolver.fetch_count(), 2);
    }
}
