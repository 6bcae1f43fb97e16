//! Deduplication of concurrent watch requests.
//!
//! The first request for an uncached list becomes the leader: it registers a
//! [`PendingResolution`] and spawns one resolve task. Requests arriving while
//! that task runs queue behind it as waiters. When the task settles, the
//! pending entry is removed, the descriptor (if any) is inserted with every
//! waiter already subscribed, and the waiters are released in arrival order
//! with the same outcome. A subscriber that unwatches the list before then is
//! taken off the queue and released with [`WatchError::Cancelled`].
//!
//! The resolve task is spawned rather than driven by the leader's future, so a
//! leader that gives up does not strand the requests queued behind it.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::cache::{RemoveOutcome, WatchCache};
use crate::error::{ResolutionError, WatchError};
use crate::refresh::RefreshScheduler;
use crate::tracker::ListResolver;
use crate::types::{ListDescriptor, ListKey, ListKind, ListSummary, PublicListInfo, SubscriberId};

/// Default delay between cache checks in the fallback poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of cache checks before giving up with [`WatchError::NotReady`].
pub const DEFAULT_POLL_ATTEMPTS: u32 = 40;

type WaiterResult = Result<PublicListInfo, WatchError>;

/// Bounded wait used when a waiter's result channel closes without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_POLL_ATTEMPTS,
        }
    }
}

/// A request by one subscriber to watch one list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub subscriber_id: SubscriberId,
    pub list_ref: String,
    pub requested_kind: Option<ListKind>,
}

struct Waiter {
    subscriber: SubscriberId,
    reply: oneshot::Sender<WaiterResult>,
}

/// An in-flight resolution and the requests queued behind it, oldest first.
#[derive(Default)]
pub struct PendingResolution {
    waiters: Vec<Waiter>,
}

impl PendingResolution {
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Takes every request `subscriber` has queued, keeping the others in order.
    fn withdraw(&mut self, subscriber: &SubscriberId) -> Vec<Waiter> {
        let (withdrawn, kept) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|waiter| waiter.subscriber == *subscriber);
        self.waiters = kept;
        withdrawn
    }
}

/// Everything the watch path mutates, guarded by a single lock.
#[derive(Default)]
pub struct WatchState {
    cache: WatchCache,
    pending: HashMap<ListKey, PendingResolution>,
}

impl WatchState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cache(&self) -> &WatchCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut WatchCache {
        &mut self.cache
    }

    #[must_use]
    pub fn is_pending(&self, key: &ListKey) -> bool {
        self.pending.contains_key(key)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of requests queued on the resolution for `key`.
    #[must_use]
    pub fn waiter_count(&self, key: &ListKey) -> usize {
        self.pending.get(key).map_or(0, PendingResolution::waiter_count)
    }
}

pub type SharedState = Arc<Mutex<WatchState>>;

/// Locks the shared state.
///
/// No code path panics while holding the lock, so a poisoned mutex still
/// holds consistent data and is recovered rather than propagated.
pub fn lock_state(state: &SharedState) -> MutexGuard<'_, WatchState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Admission {
    Cached(PublicListInfo),
    Queued(oneshot::Receiver<WaiterResult>),
    Leader(oneshot::Receiver<WaiterResult>),
}

/// Removes the pending entry if the resolve task dies before settling.
///
/// Dropping the entry drops every waiter's sender, which wakes the waiters
/// with a closed channel and sends them to the fallback poll.
struct PendingGuard {
    state: SharedState,
    key: ListKey,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = lock_state(&self.state).pending.remove(&self.key);
        if let Some(pending) = removed {
            warn!(
                list = %self.key,
                waiters = pending.waiter_count(),
                "Resolution abandoned before settling"
            );
        }
    }
}

/// Coordinates list resolution so each list is resolved at most once at a time.
#[derive(Clone)]
pub struct PendingRequestCoordinator {
    state: SharedState,
    resolver: Arc<dyn ListResolver>,
    scheduler: RefreshScheduler,
    poll: PollPolicy,
}

impl PendingRequestCoordinator {
    pub fn new(
        state: SharedState,
        resolver: Arc<dyn ListResolver>,
        scheduler: RefreshScheduler,
        poll: PollPolicy,
    ) -> Self {
        Self {
            state,
            resolver,
            scheduler,
            poll,
        }
    }

    /// Normalizes the request's reference and watches the resulting list.
    ///
    /// Normalization is not deduplicated; only the resolution that follows is.
    ///
    /// # Errors
    ///
    /// - [`WatchError::Resolution`] if the reference is invalid or the list
    ///   cannot be resolved
    /// - [`WatchError::NotReady`] if the resolve task vanished and the list did
    ///   not appear in the cache within the poll policy
    /// - [`WatchError::Cancelled`] if the subscriber unwatched the list while
    ///   it was resolving
    pub async fn request_resolution(
        &self,
        request: SubscriptionRequest,
    ) -> Result<PublicListInfo, WatchError> {
        let key = self
            .resolver
            .normalize_reference(&request.list_ref, request.requested_kind)
            .await?;
        self.watch_key(key, request.subscriber_id).await
    }

    /// Subscribes `subscriber` to the list identified by `key`, resolving it
    /// first if nobody watches it yet.
    ///
    /// # Errors
    ///
    /// See [`request_resolution`](Self::request_resolution).
    pub async fn watch_key(
        &self,
        key: ListKey,
        subscriber: SubscriberId,
    ) -> Result<PublicListInfo, WatchError> {
        let reply = match self.admit(&key, subscriber.clone()) {
            Admission::Cached(info) => {
                debug!(list = %key, subscriber = %subscriber, "List already cached");
                return Ok(info);
            }
            Admission::Queued(reply) => {
                debug!(list = %key, subscriber = %subscriber, "Queued behind in-flight resolution");
                reply
            }
            Admission::Leader(reply) => {
                debug!(list = %key, subscriber = %subscriber, "Starting resolution");
                let coordinator = self.clone();
                let task_key = key.clone();
                tokio::spawn(async move { coordinator.run_resolution(task_key).await });
                reply
            }
        };

        match reply.await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    list = %key,
                    subscriber = %subscriber,
                    "Resolution ended without a result, polling the cache"
                );
                self.poll_until_cached(&key, subscriber).await
            }
        }
    }

    /// Returns `true` while a resolution for `key` is in flight.
    #[must_use]
    pub fn is_pending(&self, key: &ListKey) -> bool {
        lock_state(&self.state).is_pending(key)
    }

    /// Number of requests queued on the resolution for `key`.
    #[must_use]
    pub fn waiter_count(&self, key: &ListKey) -> usize {
        lock_state(&self.state).waiter_count(key)
    }

    /// Removes `subscriber` from the list identified by `key`, whether the
    /// list is cached or still resolving.
    ///
    /// Requests the subscriber has queued on an in-flight resolution are
    /// released with [`WatchError::Cancelled`] and will not be subscribed when
    /// it settles. Returns `true` if anything was removed.
    pub fn unwatch(&self, subscriber: &SubscriberId, key: &ListKey) -> bool {
        let (outcome, withdrawn) = {
            let mut guard = lock_state(&self.state);
            let state = &mut *guard;

            let outcome = state.cache.remove_subscriber(subscriber, key);
            let withdrawn = state
                .pending
                .get_mut(key)
                .map(|pending| pending.withdraw(subscriber))
                .unwrap_or_default();
            (outcome, withdrawn)
        };

        if !withdrawn.is_empty() {
            debug!(
                list = %key,
                subscriber = %subscriber,
                requests = withdrawn.len(),
                "Withdrew queued watch requests"
            );
        }
        let removed = !matches!(outcome, RemoveOutcome::NotWatching) || !withdrawn.is_empty();

        for waiter in withdrawn {
            // The requester may already have given up.
            let _ = waiter.reply.send(Err(WatchError::Cancelled { key: key.clone() }));
        }

        removed
    }

    fn admit(&self, key: &ListKey, subscriber: SubscriberId) -> Admission {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;

        if let Some(info) = state
            .cache
            .add_subscriber(key, subscriber.clone())
            .map(ListDescriptor::to_public_info)
        {
            return Admission::Cached(info);
        }

        let (reply, receiver) = oneshot::channel();
        let waiter = Waiter { subscriber, reply };

        match state.pending.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().waiters.push(waiter);
                Admission::Queued(receiver)
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingResolution {
                    waiters: vec![waiter],
                });
                Admission::Leader(receiver)
            }
        }
    }

    async fn run_resolution(self, key: ListKey) {
        let mut guard = PendingGuard {
            state: Arc::clone(&self.state),
            key: key.clone(),
            armed: true,
        };

        let outcome = self.fetch(&key).await;

        guard.disarm();
        self.settle(&key, outcome);
    }

    async fn fetch(
        &self,
        key: &ListKey,
    ) -> Result<(ListSummary, HashSet<String>), ResolutionError> {
        let mut summary = self.resolver.resolve_list(key).await?;

        // The descriptor is cached under the key callers asked for.
        if summary.key() != *key {
            debug!(
                requested = %key,
                resolved = %summary.key(),
                "Resolved list reported a different key"
            );
            summary.id.clone_from(&key.id);
            summary.kind = key.kind;
        }

        let members = self.resolver.fetch_member_issue_keys(&summary).await?;
        Ok((summary, members))
    }

    fn settle(&self, key: &ListKey, outcome: Result<(ListSummary, HashSet<String>), ResolutionError>) {
        let (waiters, result) = {
            let mut guard = lock_state(&self.state);
            let state = &mut *guard;

            let waiters = state
                .pending
                .remove(key)
                .map(|pending| pending.waiters)
                .unwrap_or_default();

            let result = match outcome {
                Ok((summary, members)) => {
                    let mut descriptor = ListDescriptor::new(summary, members);
                    for waiter in &waiters {
                        descriptor.add_subscriber(waiter.subscriber.clone());
                    }
                    let info = descriptor.to_public_info();
                    if waiters.is_empty() {
                        // Every requester unwatched while the resolution ran.
                        Ok(info)
                    } else {
                        state.cache.upsert_descriptor(descriptor);
                        Ok(state
                            .cache
                            .get_descriptor(key)
                            .map_or(info, ListDescriptor::to_public_info))
                    }
                }
                Err(err) => Err(err),
            };

            (waiters, result)
        };

        match &result {
            Ok(info) => {
                info!(
                    list = %key,
                    name = %info.name,
                    members = info.member_count,
                    waiters = waiters.len(),
                    "List resolved"
                );
                if waiters.is_empty() {
                    debug!(list = %key, "Resolved list has no subscribers left, not caching");
                } else {
                    self.scheduler.ensure_started();
                }
            }
            Err(err) if err.is_user_error() => {
                info!(list = %key, error = %err, waiters = waiters.len(), "List resolution rejected");
            }
            Err(err) => {
                error!(list = %key, error = ?err, waiters = waiters.len(), "List resolution failed");
            }
        }

        let result = result.map_err(WatchError::from);
        for waiter in waiters {
            if waiter.reply.send(result.clone()).is_err() {
                debug!(list = %key, subscriber = %waiter.subscriber, "Waiter went away before release");
            }
        }
    }

    async fn poll_until_cached(
        &self,
        key: &ListKey,
        subscriber: SubscriberId,
    ) -> Result<PublicListInfo, WatchError> {
        for attempt in 1..=self.poll.max_attempts {
            tokio::time::sleep(self.poll.interval).await;

            let info = lock_state(&self.state)
                .cache
                .add_subscriber(key, subscriber.clone())
                .map(ListDescriptor::to_public_info);

            if let Some(info) = info {
                debug!(list = %key, attempt, "List appeared in cache");
                return Ok(info);
            }
        }

        Err(WatchError::NotReady {
            key: key.clone(),
            attempts: self.poll.max_attempts,
        })
    }
}
