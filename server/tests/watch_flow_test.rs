//! Integration tests for the watch flow through the public API.
//!
//! These tests drive [`WatchService`] with in-memory tracker and chat fakes
//! and verify:
//! - Concurrent watch requests for one list resolve it exactly once
//! - Failed resolutions are never cached
//! - A refresh failure for one list leaves the others refreshed
//! - Matching uses cached membership until the next refresh
//! - The end-to-end watch, event and delivery scenario

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use boardwatch_server::delivery::ChatDelivery;
use boardwatch_server::error::{DeliveryError, ResolutionError, WatchError};
use boardwatch_server::event::EventContext;
use boardwatch_server::service::{ServiceOptions, WatchService};
use boardwatch_server::tracker::ListResolver;
use boardwatch_server::types::{ListKey, ListKind, ListSummary, SubscriberId, WatchedList};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Default)]
struct Tracker {
    lists: Mutex<HashMap<ListKey, (String, HashSet<String>)>>,
    broken: Mutex<HashSet<ListKey>>,
    gate: Option<Arc<Notify>>,
    resolves: AtomicUsize,
}

impl Tracker {
    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn put(&self, key: ListKey, name: &str, members: &[&str]) {
        self.lists.lock().unwrap().insert(
            key,
            (name.to_string(), members.iter().map(|m| m.to_string()).collect()),
        );
    }

    fn break_list(&self, key: ListKey) {
        self.broken.lock().unwrap().insert(key);
    }
}

#[async_trait]
impl ListResolver for Tracker {
    async fn resolve_list(&self, key: &ListKey) -> Result<ListSummary, ResolutionError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let name = self
            .lists
            .lock()
            .unwrap()
            .get(key)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| ResolutionError::NotFound(key.clone()))?;

        Ok(ListSummary {
            id: key.id.clone(),
            kind: key.kind,
            name,
            view_url: format!("https://jira.test/{}", key.id),
        })
    }

    async fn fetch_member_issue_keys(
        &self,
        list: &ListSummary,
    ) -> Result<HashSet<String>, ResolutionError> {
        let key = list.key();
        if self.broken.lock().unwrap().contains(&key) {
            return Err(ResolutionError::upstream("502 from jira"));
        }
        self.lists
            .lock()
            .unwrap()
            .get(&key)
            .map(|(_, members)| members.clone())
            .ok_or(ResolutionError::NotFound(key))
    }
}

#[derive(Default)]
struct Chat {
    sent: Mutex<Vec<(SubscriberId, String)>>,
}

impl Chat {
    fn sent(&self) -> Vec<(SubscriberId, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatDelivery for Chat {
    async fn deliver(&self, subscriber: &SubscriberId, message: &str) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((subscriber.clone(), message.to_string()));
        Ok(())
    }
}

fn service(tracker: &Arc<Tracker>, chat: &Arc<Chat>) -> WatchService {
    WatchService::new(
        Arc::clone(tracker) as Arc<dyn ListResolver>,
        Arc::clone(chat) as Arc<dyn ChatDelivery>,
        ServiceOptions {
            event_context: EventContext {
                jira_url: "https://jira.test".to_string(),
                custom_fields: Vec::new(),
            },
            ..ServiceOptions::default()
        },
    )
}

fn status_change(issue: &str, from: &str, to: &str) -> Vec<u8> {
    json!({
        "webhookEvent": "jira:issue_updated",
        "user": { "displayName": "Grace Hopper" },
        "issue": { "key": issue, "fields": { "summary": "Crash on save" } },
        "changelog": { "items": [{ "field": "status", "fromString": from, "toString": to }] }
    })
    .to_string()
    .into_bytes()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn end_to_end_watch_and_notify() {
    let tracker = Arc::new(Tracker::default());
    tracker.put(ListKey::board("4263"), "Bugs", &["PROJ-1", "PROJ-2"]);
    let chat = Arc::new(Chat::default());
    let service = service(&tracker, &chat);
    let s1 = SubscriberId::new("S1");

    let info = service
        .watch_list(&s1, "4263", Some(ListKind::Board))
        .await
        .unwrap();
    assert_eq!(info.name, "Bugs");
    assert_eq!(info.member_count, 2);

    let outcome = service
        .handle_event(&status_change("PROJ-1", "Open", "Done"))
        .await;
    assert_eq!(outcome.matched_lists, 1);

    let sent = chat.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, s1);
    assert!(sent[0].1.contains("Bugs"));
    assert!(sent[0].1.contains("PROJ-1"));
    assert!(sent[0].1.contains("Open"));
    assert!(sent[0].1.contains("Done"));

    let outcome = service
        .handle_event(&status_change("PROJ-9", "Open", "Done"))
        .await;
    assert_eq!(outcome.matched_lists, 0);
    assert_eq!(chat.sent().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_watches_resolve_once() {
    let gate = Arc::new(Notify::new());
    let tracker = Arc::new(Tracker::gated(Arc::clone(&gate)));
    tracker.put(ListKey::board("10"), "Platform", &["P-1"]);
    let chat = Arc::new(Chat::default());
    let service = service(&tracker, &chat);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .watch_list(&SubscriberId::new(format!("S{i}")), "10", None)
                    .await
            })
        })
        .collect();

    // Hold the resolution until every request has had time to queue behind it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();

    for handle in handles {
        let info = handle.await.unwrap().unwrap();
        assert_eq!(info.name, "Platform");
    }

    assert_eq!(tracker.resolves.load(Ordering::SeqCst), 1);
    let stats = service.get_stats();
    assert_eq!(stats.lists.len(), 1);
    assert_eq!(stats.lists[0].info.subscriber_count, 8);
}

#[tokio::test]
async fn failed_resolution_is_retried_from_scratch() {
    let tracker = Arc::new(Tracker::default());
    let chat = Arc::new(Chat::default());
    let service = service(&tracker, &chat);
    let s1 = SubscriberId::new("S1");

    let err = service.watch_list(&s1, "55", None).await.unwrap_err();
    assert_eq!(
        err,
        WatchError::Resolution(ResolutionError::NotFound(ListKey::board("55")))
    );
    assert_eq!(service.watched_count(), 0);

    tracker.put(ListKey::board("55"), "Created Later", &[]);
    let info = service.watch_list(&s1, "55", None).await.unwrap();

    assert_eq!(info.name, "Created Later");
    assert_eq!(tracker.resolves.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn refresh_failure_is_isolated() {
    let tracker = Arc::new(Tracker::default());
    tracker.put(ListKey::board("1"), "Healthy", &["H-1"]);
    tracker.put(ListKey::board("2"), "Flaky", &["F-1"]);
    let chat = Arc::new(Chat::default());
    let service = service(&tracker, &chat);
    let s1 = SubscriberId::new("S1");

    service.watch_list(&s1, "1", None).await.unwrap();
    service.watch_list(&s1, "2", None).await.unwrap();

    tracker.put(ListKey::board("1"), "Healthy", &["H-1", "H-2"]);
    tracker.put(ListKey::board("2"), "Flaky", &["F-1", "F-2"]);
    tracker.break_list(ListKey::board("2"));

    let report = service.refresh_now().await;
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.failed, vec![ListKey::board("2")]);

    // The healthy list sees its new issue, the flaky one keeps its old members.
    let healthy = service.handle_event(&status_change("H-2", "Open", "Done")).await;
    assert_eq!(healthy.matched_lists, 1);
    let stale_new = service.handle_event(&status_change("F-2", "Open", "Done")).await;
    assert_eq!(stale_new.matched_lists, 0);
    let stale_old = service.handle_event(&status_change("F-1", "Open", "Done")).await;
    assert_eq!(stale_old.matched_lists, 1);
}

#[tokio::test]
async fn matching_waits_for_refresh() {
    let tracker = Arc::new(Tracker::default());
    tracker.put(ListKey::filter("7"), "Mine", &["M-1"]);
    let chat = Arc::new(Chat::default());
    let service = service(&tracker, &chat);

    service
        .watch_list(&"S1".into(), "7", Some(ListKind::Filter))
        .await
        .unwrap();

    tracker.put(ListKey::filter("7"), "Mine", &["M-1", "M-2"]);
    let before = service.handle_event(&status_change("M-2", "To Do", "Doing")).await;
    assert_eq!(before.matched_lists, 0);

    service.refresh_now().await;
    let after = service.handle_event(&status_change("M-2", "To Do", "Doing")).await;
    assert_eq!(after.matched_lists, 1);
}

#[tokio::test]
async fn last_unwatch_evicts_list() {
    let tracker = Arc::new(Tracker::default());
    tracker.put(ListKey::board("3"), "Ops", &["O-1"]);
    let chat = Arc::new(Chat::default());
    let service = service(&tracker, &chat);
    let (s1, s2) = (SubscriberId::new("S1"), SubscriberId::new("S2"));
    let ops = [WatchedList {
        id: "3".to_string(),
        kind: ListKind::Board,
    }];

    service.watch_list(&s1, "3", None).await.unwrap();
    service.watch_list(&s2, "3", None).await.unwrap();

    service.unwatch_lists(&s1, &ops);
    assert_eq!(service.watched_count(), 1);
    let outcome = service.handle_event(&status_change("O-1", "Open", "Done")).await;
    assert_eq!(outcome.delivered, 1);

    service.unwatch_lists(&s2, &ops);
    assert_eq!(service.watched_count(), 0);
    let outcome = service.handle_event(&status_change("O-1", "Open", "Done")).await;
    assert_eq!(outcome.matched_lists, 0);
}
