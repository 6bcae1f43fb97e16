//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::delivery::ChatDelivery;
use crate::error::{DeliveryError, ResolutionError};
use crate::tracker::ListResolver;
use crate::types::{ListKey, ListKind, ListSummary, SubscriberId};

pub(crate) fn issue_keys(keys: &[&str]) -> HashSet<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

/// Tracker fake backed by a map of known lists.
#[derive(Default)]
pub(crate) struct FakeResolver {
    lists: Mutex<HashMap<ListKey, (String, HashSet<String>)>>,
    failing_fetches: Mutex<HashSet<ListKey>>,
    panicking: Mutex<HashSet<ListKey>>,
    gate: Option<Arc<Notify>>,
    pub resolve_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `resolve_list` call waits for one `notify_one` on the returned gate.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let resolver = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (resolver, gate)
    }

    pub fn with_list(self, key: ListKey, name: &str, members: &[&str]) -> Self {
        self.set_list(key, name, members);
        self
    }

    pub fn set_list(&self, key: ListKey, name: &str, members: &[&str]) {
        self.lists
            .lock()
            .unwrap()
            .insert(key, (name.to_string(), issue_keys(members)));
    }

    pub fn fail_fetches_for(&self, key: ListKey) {
        self.failing_fetches.lock().unwrap().insert(key);
    }

    pub fn panic_on(&self, key: ListKey) {
        self.panicking.lock().unwrap().insert(key);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListResolver for FakeResolver {
    async fn resolve_list(&self, key: &ListKey) -> Result<ListSummary, ResolutionError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if self.panicking.lock().unwrap().contains(key) {
            panic!("resolver exploded for {key}");
        }

        let name = self
            .lists
            .lock()
            .unwrap()
            .get(key)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| ResolutionError::NotFound(key.clone()))?;

        let view_url = match key.kind {
            ListKind::Board => format!("https://jira.test/secure/RapidBoard.jspa?rapidView={}", key.id),
            ListKind::Filter => format!("https://jira.test/issues/?filter={}", key.id),
        };

        Ok(ListSummary {
            id: key.id.clone(),
            kind: key.kind,
            name,
            view_url,
        })
    }

    async fn fetch_member_issue_keys(
        &self,
        list: &ListSummary,
    ) -> Result<HashSet<String>, ResolutionError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let key = list.key();

        if self.failing_fetches.lock().unwrap().contains(&key) {
            return Err(ResolutionError::upstream("jira timed out"));
        }

        self.lists
            .lock()
            .unwrap()
            .get(&key)
            .map(|(_, members)| members.clone())
            .ok_or(ResolutionError::NotFound(key))
    }
}

/// Chat fake that records every delivered message.
#[derive(Default)]
pub(crate) struct RecordingDelivery {
    delivered: Mutex<Vec<(SubscriberId, String)>>,
    failing: Mutex<HashSet<SubscriberId>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, subscriber: &str) {
        self.failing.lock().unwrap().insert(subscriber.into());
    }

    pub fn delivered(&self) -> Vec<(SubscriberId, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatDelivery for RecordingDelivery {
    async fn deliver(&self, subscriber: &SubscriberId, message: &str) -> Result<(), DeliveryError> {
        if self.failing.lock().unwrap().contains(subscriber) {
            return Err(DeliveryError::NoTarget(subscriber.clone()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((subscriber.clone(), message.to_string()));
        Ok(())
    }
}
