//! In-memory cache of watched lists.
//!
//! [`WatchCache`] is the single source of truth for which lists are watched and
//! by whom. It does no I/O and has no interior locking: it lives inside
//! [`WatchState`](crate::coordinator::WatchState), whose mutex serializes every
//! mutation, and no mutation ever spans an `.await`.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::types::{ListDescriptor, ListKey, SubscriberId};

/// Result of [`WatchCache::upsert_descriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No descriptor existed for the key.
    Inserted,
    /// A descriptor already existed; its subscribers were merged into the new one.
    Merged,
}

/// Result of [`WatchCache::remove_subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The list is not cached, or the subscriber was not watching it.
    NotWatching,
    /// The subscriber was removed; other subscribers remain.
    Removed,
    /// The subscriber was the last one and the descriptor was evicted.
    Evicted,
}

/// Store of resolved list descriptors keyed by [`ListKey`].
#[derive(Debug, Default)]
pub struct WatchCache {
    descriptors: HashMap<ListKey, ListDescriptor>,
}

impl WatchCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the descriptor for a list.
    #[must_use]
    pub fn get_descriptor(&self, key: &ListKey) -> Option<&ListDescriptor> {
        self.descriptors.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &ListKey) -> bool {
        self.descriptors.contains_key(key)
    }

    /// Inserts a descriptor, or replaces an existing one for the same key.
    ///
    /// On replacement the previously registered subscribers are carried over
    /// into the new descriptor and its membership wins. This only happens when
    /// two resolutions for the same list raced, so it is logged as a warning.
    pub fn upsert_descriptor(&mut self, mut descriptor: ListDescriptor) -> UpsertOutcome {
        let key = descriptor.key();

        match self.descriptors.remove(&key) {
            Some(existing) => {
                warn!(
                    list = %key,
                    existing_subscribers = existing.subscriber_count(),
                    incoming_subscribers = descriptor.subscriber_count(),
                    "Descriptor already cached, merging subscribers into newer resolution"
                );
                descriptor.absorb_subscribers(existing);
                self.descriptors.insert(key, descriptor);
                UpsertOutcome::Merged
            }
            None => {
                debug!(list = %key, members = descriptor.member_count(), "Descriptor cached");
                self.descriptors.insert(key, descriptor);
                UpsertOutcome::Inserted
            }
        }
    }

    /// Adds a subscriber to a cached list. Idempotent.
    ///
    /// Returns the updated descriptor, or `None` if the list is not cached.
    pub fn add_subscriber(
        &mut self,
        key: &ListKey,
        subscriber: SubscriberId,
    ) -> Option<&ListDescriptor> {
        let descriptor = self.descriptors.get_mut(key)?;
        if descriptor.add_subscriber(subscriber) {
            debug!(list = %key, subscribers = descriptor.subscriber_count(), "Subscriber added");
        }
        Some(descriptor)
    }

    /// Removes a subscriber from a list, evicting the list when nobody is left.
    pub fn remove_subscriber(&mut self, subscriber: &SubscriberId, key: &ListKey) -> RemoveOutcome {
        let Some(descriptor) = self.descriptors.get_mut(key) else {
            return RemoveOutcome::NotWatching;
        };

        if !descriptor.remove_subscriber(subscriber) {
            return RemoveOutcome::NotWatching;
        }

        if descriptor.subscriber_count() == 0 {
            self.descriptors.remove(key);
            debug!(list = %key, "Last subscriber removed, descriptor evicted");
            RemoveOutcome::Evicted
        } else {
            RemoveOutcome::Removed
        }
    }

    /// Replaces the member issues of a cached list.
    ///
    /// Returns `false` if the list was evicted in the meantime.
    pub fn replace_members(&mut self, key: &ListKey, members: HashSet<String>) -> bool {
        match self.descriptors.get_mut(key) {
            Some(descriptor) => {
                descriptor.replace_members(members);
                true
            }
            None => false,
        }
    }

    /// Iterates over cached descriptors in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ListDescriptor> {
        self.descriptors.values()
    }

    /// Returns an owned snapshot of every cached descriptor.
    #[must_use]
    pub fn all_descriptors(&self) -> Vec<ListDescriptor> {
        self.descriptors.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ListKind, ListSummary};

    fn summary(id: &str, name: &str) -> ListSummary {
        ListSummary {
            id: id.to_string(),
            kind: ListKind::Board,
            name: name.to_string(),
            view_url: format!("https://x/{id}"),
        }
    }

    fn members(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn descriptor_with(id: &str, keys: &[&str], subscribers: &[&str]) -> ListDescriptor {
        let mut descriptor = ListDescriptor::new(summary(id, "Bugs"), members(keys));
        for s in subscribers {
            descriptor.add_subscriber(SubscriberId::new(*s));
        }
        descriptor
    }

    #[test]
    fn get_descriptor_returns_none_for_unknown_list() {
        let cache = WatchCache::new();
        assert!(cache.get_descriptor(&ListKey::board("1")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn upsert_inserts_new_descriptor() {
        let mut cache = WatchCache::new();
        let outcome = cache.upsert_descriptor(descriptor_with("1", &["A-1"], &["S1"]));

        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_descriptor(&ListKey::board("1")).unwrap().contains_issue("A-1"));
    }

    #[test]
    fn upsert_collision_keeps_latest_membership_and_unions_subscribers() {
        let mut cache = WatchCache::new();
        cache.upsert_descriptor(descriptor_with("1", &["A-1"], &["S1", "S2"]));

        let outcome = cache.upsert_descriptor(descriptor_with("1", &["A-2"], &["S3"]));
        assert_eq!(outcome, UpsertOutcome::Merged);
        assert_eq!(cache.len(), 1);

        let descriptor = cache.get_descriptor(&ListKey::board("1")).unwrap();
        assert!(descriptor.contains_issue("A-2"));
        assert!(!descriptor.contains_issue("A-1"));
        assert_eq!(descriptor.subscriber_count(), 3);
    }

    #[test]
    fn add_subscriber_is_idempotent() {
        let mut cache = WatchCache::new();
        cache.upsert_descriptor(descriptor_with("1", &[], &[]));
        let key = ListKey::board("1");

        cache.add_subscriber(&key, "S1".into());
        let descriptor = cache.add_subscriber(&key, "S1".into()).unwrap();
        assert_eq!(descriptor.subscriber_count(), 1);
    }

    #[test]
    fn add_subscriber_to_unknown_list_returns_none() {
        let mut cache = WatchCache::new();
        assert!(cache.add_subscriber(&ListKey::board("1"), "S1".into()).is_none());
    }

    #[test]
    fn removing_last_subscriber_evicts_descriptor() {
        let mut cache = WatchCache::new();
        cache.upsert_descriptor(descriptor_with("1", &["A-1"], &["S1"]));
        let key = ListKey::board("1");

        assert_eq!(cache.remove_subscriber(&"S1".into(), &key), RemoveOutcome::Evicted);
        assert!(cache.all_descriptors().is_empty());
    }

    #[test]
    fn removing_non_last_subscriber_keeps_membership() {
        let mut cache = WatchCache::new();
        cache.upsert_descriptor(descriptor_with("1", &["A-1", "A-2"], &["S1", "S2"]));
        let key = ListKey::board("1");

        assert_eq!(cache.remove_subscriber(&"S1".into(), &key), RemoveOutcome::Removed);

        let descriptor = cache.get_descriptor(&key).unwrap();
        assert_eq!(descriptor.member_count(), 2);
        assert!(!descriptor.has_subscriber(&"S1".into()));
        assert!(descriptor.has_subscriber(&"S2".into()));
    }

    #[test]
    fn removing_unknown_subscriber_is_a_no_op() {
        let mut cache = WatchCache::new();
        cache.upsert_descriptor(descriptor_with("1", &[], &["S1"]));

        let outcome = cache.remove_subscriber(&"S9".into(), &ListKey::board("1"));
        assert_eq!(outcome, RemoveOutcome::NotWatching);
        assert_eq!(
            cache.remove_subscriber(&"S1".into(), &ListKey::filter("1")),
            RemoveOutcome::NotWatching
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn replace_members_skips_evicted_lists() {
        let mut cache = WatchCache::new();
        cache.upsert_descriptor(descriptor_with("1", &["A-1"], &["S1"]));

        assert!(cache.replace_members(&ListKey::board("1"), members(&["A-9"])));
        assert!(!cache.replace_members(&ListKey::board("2"), members(&["A-9"])));
        assert!(cache.get_descriptor(&ListKey::board("1")).unwrap().contains_issue("A-9"));
    }
}
