//! Shared domain types for the Boardwatch server.
//!
//! These types describe the watched lists (Jira boards and filters), the chat
//! spaces subscribed to them, and the snapshots handed out to callers. A
//! [`ListDescriptor`] is only ever mutated through
//! [`WatchCache`](crate::cache::WatchCache); everyone else receives clones or
//! [`PublicListInfo`] snapshots.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of list a chat space can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    Board,
    Filter,
}

impl ListKind {
    /// Returns the lowercase name used in JSON and log output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Board => "board",
            Self::Filter => "filter",
        }
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache key for a watched list.
///
/// Boards and filters have independent id spaces in Jira, so the kind is part
/// of the identity: board `10` and filter `10` are different lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListKey {
    pub kind: ListKind,
    pub id: String,
}

impl ListKey {
    #[must_use]
    pub fn new(kind: ListKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn board(id: impl Into<String>) -> Self {
        Self::new(ListKind::Board, id)
    }

    #[must_use]
    pub fn filter(id: impl Into<String>) -> Self {
        Self::new(ListKind::Filter, id)
    }
}

impl fmt::Display for ListKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Identity of a subscriber (a chat space).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubscriberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Display metadata for a list, as returned by the issue tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSummary {
    pub id: String,
    pub kind: ListKind,
    pub name: String,
    pub view_url: String,
}

impl ListSummary {
    /// Returns the cache key identifying this list.
    #[must_use]
    pub fn key(&self) -> ListKey {
        ListKey::new(self.kind, self.id.clone())
    }
}

/// A watched list together with its known member issues and subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListDescriptor {
    summary: ListSummary,
    member_issue_keys: HashSet<String>,
    subscribers: BTreeSet<SubscriberId>,
    refreshed_at: DateTime<Utc>,
}

impl ListDescriptor {
    /// Creates a descriptor with no subscribers, stamped as refreshed now.
    #[must_use]
    pub fn new(summary: ListSummary, member_issue_keys: HashSet<String>) -> Self {
        Self {
            summary,
            member_issue_keys,
            subscribers: BTreeSet::new(),
            refreshed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> ListKey {
        self.summary.key()
    }

    #[must_use]
    pub fn summary(&self) -> &ListSummary {
        &self.summary
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.summary.name
    }

    /// Returns `true` if the issue is currently known to belong to the list.
    #[must_use]
    pub fn contains_issue(&self, issue_key: &str) -> bool {
        self.member_issue_keys.contains(issue_key)
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.member_issue_keys.len()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &SubscriberId> {
        self.subscribers.iter()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn has_subscriber(&self, subscriber: &SubscriberId) -> bool {
        self.subscribers.contains(subscriber)
    }

    #[must_use]
    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    /// Builds the snapshot handed back to command-layer callers.
    #[must_use]
    pub fn to_public_info(&self) -> PublicListInfo {
        PublicListInfo {
            id: self.summary.id.clone(),
            kind: self.summary.kind,
            name: self.summary.name.clone(),
            view_url: self.summary.view_url.clone(),
            member_count: self.member_issue_keys.len(),
            subscriber_count: self.subscribers.len(),
        }
    }

    pub(crate) fn add_subscriber(&mut self, subscriber: SubscriberId) -> bool {
        self.subscribers.insert(subscriber)
    }

    pub(crate) fn remove_subscriber(&mut self, subscriber: &SubscriberId) -> bool {
        self.subscribers.remove(subscriber)
    }

    pub(crate) fn absorb_subscribers(&mut self, other: ListDescriptor) {
        self.subscribers.extend(other.subscribers);
    }

    pub(crate) fn replace_members(&mut self, member_issue_keys: HashSet<String>) {
        self.member_issue_keys = member_issue_keys;
        self.refreshed_at = Utc::now();
    }
}

/// Public view of a watched list returned by `watch_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicListInfo {
    pub id: String,
    pub kind: ListKind,
    pub name: String,
    pub view_url: String,
    pub member_count: usize,
    pub subscriber_count: usize,
}

impl PublicListInfo {
    #[must_use]
    pub fn key(&self) -> ListKey {
        ListKey::new(self.kind, self.id.clone())
    }
}

/// A persisted `{id, kind}` pair naming a list a space watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchedList {
    pub id: String,
    pub kind: ListKind,
}

impl WatchedList {
    #[must_use]
    pub fn key(&self) -> ListKey {
        ListKey::new(self.kind, self.id.clone())
    }
}

impl From<&ListKey> for WatchedList {
    fn from(key: &ListKey) -> Self {
        Self {
            id: key.id.clone(),
            kind: key.kind,
        }
    }
}

/// Per-list entry in [`Stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListStats {
    #[serde(flatten)]
    pub info: PublicListInfo,
    pub refreshed_at: DateTime<Utc>,
}

/// Snapshot of the watch cache reported by `GET /stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub lists: Vec<ListStats>,
    pub cache_duration_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bugs_board() -> ListSummary {
        ListSummary {
            id: "4263".to_string(),
            kind: ListKind::Board,
            name: "Bugs".to_string(),
            view_url: "https://x/4263".to_string(),
        }
    }

    #[test]
    fn list_key_display_includes_kind() {
        assert_eq!(ListKey::board("4263").to_string(), "board:4263");
        assert_eq!(ListKey::filter("77").to_string(), "filter:77");
    }

    #[test]
    fn board_and_filter_with_same_id_are_distinct_keys() {
        assert_ne!(ListKey::board("10"), ListKey::filter("10"));
    }

    #[test]
    fn list_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ListKind::Board).unwrap(), "\"board\"");
        let kind: ListKind = serde_json::from_str("\"filter\"").unwrap();
        assert_eq!(kind, ListKind::Filter);
    }

    #[test]
    fn descriptor_membership_and_subscribers() {
        let members: HashSet<String> = ["PROJ-1", "PROJ-2"].iter().map(|k| k.to_string()).collect();
        let mut descriptor = ListDescriptor::new(bugs_board(), members);

        assert!(descriptor.contains_issue("PROJ-1"));
        assert!(!descriptor.contains_issue("PROJ-9"));

        assert!(descriptor.add_subscriber("S1".into()));
        assert!(!descriptor.add_subscriber("S1".into()));
        assert_eq!(descriptor.subscriber_count(), 1);

        let info = descriptor.to_public_info();
        assert_eq!(info.name, "Bugs");
        assert_eq!(info.member_count, 2);
        assert_eq!(info.subscriber_count, 1);
        assert_eq!(info.key(), ListKey::board("4263"));
    }

    #[test]
    fn public_info_uses_camel_case() {
        let info = ListDescriptor::new(bugs_board(), HashSet::new()).to_public_info();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["viewUrl"], "https://x/4263");
        assert_eq!(json["kind"], "board");
    }

    #[test]
    fn subscriber_id_is_transparent_in_json() {
        let id = SubscriberId::new("spaces/AAAA");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"spaces/AAAA\"");
    }
}
