//! The watch service: the single entry point used by the HTTP layer.
//!
//! [`WatchService`] owns the shared watch state and wires the coordinator,
//! refresh scheduler and matcher to the tracker and chat collaborators. It is
//! cheap to clone and every clone shares the same state. Tests construct as
//! many independent instances as they need.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{
    lock_state, PendingRequestCoordinator, PollPolicy, SharedState, SubscriptionRequest, WatchState,
};
use crate::delivery::ChatDelivery;
use crate::error::WatchError;
use crate::event::{Event, EventContext};
use crate::matcher::{EventMatcher, FanOut};
use crate::refresh::{RefreshReport, RefreshScheduler, DEFAULT_CACHE_DURATION};
use crate::tracker::ListResolver;
use crate::types::{ListKey, ListKind, ListStats, PublicListInfo, Stats, SubscriberId, WatchedList};

/// Construction options for [`WatchService`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub cache_duration: Duration,
    pub poll: PollPolicy,
    pub event_context: EventContext,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            cache_duration: DEFAULT_CACHE_DURATION,
            poll: PollPolicy::default(),
            event_context: EventContext::default(),
        }
    }
}

/// What happened to one inbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventOutcome {
    pub matched_lists: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Result of replaying a space's persisted watches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<PublicListInfo>,
    pub failed: Vec<(WatchedList, WatchError)>,
}

struct ServiceInner {
    state: SharedState,
    coordinator: PendingRequestCoordinator,
    scheduler: RefreshScheduler,
    matcher: EventMatcher,
    delivery: Arc<dyn ChatDelivery>,
    event_context: EventContext,
}

#[derive(Clone)]
pub struct WatchService {
    inner: Arc<ServiceInner>,
}

impl WatchService {
    pub fn new(
        resolver: Arc<dyn ListResolver>,
        delivery: Arc<dyn ChatDelivery>,
        options: ServiceOptions,
    ) -> Self {
        let state: SharedState = Arc::new(Mutex::new(WatchState::new()));
        let scheduler = RefreshScheduler::new(
            Arc::clone(&state),
            Arc::clone(&resolver),
            options.cache_duration,
        );
        let coordinator = PendingRequestCoordinator::new(
            Arc::clone(&state),
            resolver,
            scheduler.clone(),
            options.poll,
        );
        let matcher = EventMatcher::new(Arc::clone(&state));

        Self {
            inner: Arc::new(ServiceInner {
                state,
                coordinator,
                scheduler,
                matcher,
                delivery,
                event_context: options.event_context,
            }),
        }
    }

    /// Subscribes a space to a board or filter.
    ///
    /// # Errors
    ///
    /// Returns a [`WatchError`] if the reference is invalid, the list cannot
    /// be resolved, or the resolution vanished without a result.
    pub async fn watch_list(
        &self,
        subscriber: &SubscriberId,
        list_ref: &str,
        kind_hint: Option<ListKind>,
    ) -> Result<PublicListInfo, WatchError> {
        let request = SubscriptionRequest {
            subscriber_id: subscriber.clone(),
            list_ref: list_ref.to_string(),
            requested_kind: kind_hint,
        };
        self.inner.coordinator.request_resolution(request).await
    }

    /// Unsubscribes a space from the given lists. Lists left without any
    /// subscriber are evicted, and watch requests still waiting on a list's
    /// resolution are withdrawn. Returns how many lists were affected.
    pub fn unwatch_lists(&self, subscriber: &SubscriberId, lists: &[WatchedList]) -> usize {
        let removed = lists
            .iter()
            .filter(|list| self.inner.coordinator.unwatch(subscriber, &list.key()))
            .count();

        debug!(subscriber = %subscriber, requested = lists.len(), removed, "Unwatched lists");
        removed
    }

    /// Returns `true` while the list is being resolved for the first time.
    pub fn is_resolving(&self, key: &ListKey) -> bool {
        self.inner.coordinator.is_pending(key)
    }

    /// Snapshot of every cached list, sorted by key.
    pub fn get_stats(&self) -> Stats {
        let state = lock_state(&self.inner.state);
        let mut lists: Vec<ListStats> = state
            .cache()
            .iter()
            .map(|descriptor| ListStats {
                info: descriptor.to_public_info(),
                refreshed_at: descriptor.refreshed_at(),
            })
            .collect();
        lists.sort_by(|a, b| a.info.key().cmp(&b.info.key()));

        Stats {
            lists,
            cache_duration_secs: self.inner.scheduler.period().as_secs(),
        }
    }

    /// Number of lists currently cached.
    pub fn watched_count(&self) -> usize {
        lock_state(&self.inner.state).cache().len()
    }

    /// Computes the fan-out for an already parsed event.
    pub fn fan_out(&self, event: &Event) -> Vec<FanOut> {
        self.inner.matcher.match_event(event)
    }

    /// Processes one raw webhook payload end to end.
    ///
    /// Never fails: malformed payloads and delivery failures are logged and
    /// counted. Deliveries run concurrently so one slow or failing space does
    /// not hold up the others.
    pub async fn handle_event(&self, raw: &[u8]) -> EventOutcome {
        let event_id = Uuid::new_v4();

        let event = match Event::parse(raw, &self.inner.event_context) {
            Ok(event) => event,
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Ignoring malformed webhook payload");
                return EventOutcome::default();
            }
        };

        debug!(
            event_id = %event_id,
            issue = %event.issue_key,
            kind = ?event.kind,
            "Webhook event received"
        );

        let matches = self.fan_out(&event);
        if matches.is_empty() {
            return EventOutcome::default();
        }

        let issue_key = event.issue_key.as_str();
        let deliveries = matches.iter().flat_map(|fan_out| {
            fan_out.subscribers.iter().map(move |subscriber| async move {
                let result = self
                    .inner
                    .delivery
                    .deliver(subscriber, &fan_out.message)
                    .await;
                if let Err(e) = &result {
                    warn!(
                        event_id = %event_id,
                        issue = %issue_key,
                        list = %fan_out.list.key(),
                        subscriber = %subscriber,
                        error = %e,
                        "Failed to deliver notification"
                    );
                }
                result.is_ok()
            })
        });

        let results = join_all(deliveries).await;
        let delivered = results.iter().filter(|ok| **ok).count();

        let outcome = EventOutcome {
            matched_lists: matches.len(),
            delivered,
            failed: results.len() - delivered,
        };

        info!(
            event_id = %event_id,
            issue = %event.issue_key,
            lists = outcome.matched_lists,
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Event fanned out"
        );

        outcome
    }

    /// Replays a space's persisted watches through the watch path.
    ///
    /// Each list is watched independently; failures are logged and reported
    /// without affecting the others.
    pub async fn restore_space(&self, space: &SubscriberId, watched: &[WatchedList]) -> RestoreReport {
        let attempts = watched.iter().map(|list| async move {
            let result = self
                .inner
                .coordinator
                .watch_key(list.key(), space.clone())
                .await;
            (list.clone(), result)
        });

        let mut report = RestoreReport::default();
        for (list, result) in join_all(attempts).await {
            match result {
                Ok(info) => report.restored.push(info),
                Err(e) => {
                    warn!(space = %space, list = %list.key(), error = %e, "Failed to restore watch");
                    report.failed.push((list, e));
                }
            }
        }

        info!(
            space = %space,
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Space watches restored"
        );
        report
    }

    /// Runs one refresh pass immediately.
    pub async fn refresh_now(&self) -> RefreshReport {
        self.inner.scheduler.refresh_all().await
    }

    #[must_use]
    pub fn is_refresh_scheduled(&self) -> bool {
        self.inner.scheduler.is_scheduled()
    }

    /// Stops background work. Pending watch requests still complete.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }
}
