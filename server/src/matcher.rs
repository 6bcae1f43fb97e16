//! Matching issue events against watched lists.
//!
//! Matching reads only cached membership. An issue that joined a list after
//! the last refresh is not matched until the next refresh picks it up.

use tracing::{debug, trace};

use crate::cache::WatchCache;
use crate::coordinator::{lock_state, SharedState};
use crate::event::{Event, EventKind};
use crate::types::{ListDescriptor, PublicListInfo, SubscriberId};

/// One message to deliver to every subscriber of one matched list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOut {
    pub list: PublicListInfo,
    pub subscribers: Vec<SubscriberId>,
    pub message: String,
}

/// Returns every cached list that currently contains `issue_key`.
pub fn issue_on_watched_list<'a>(cache: &'a WatchCache, issue_key: &str) -> Vec<&'a ListDescriptor> {
    cache
        .iter()
        .filter(|descriptor| descriptor.contains_issue(issue_key))
        .collect()
}

/// Builds the fan-out for an event. Events that are neither status
/// transitions nor new issues never produce messages.
pub fn fan_out(cache: &WatchCache, event: &Event) -> Vec<FanOut> {
    if !event.kind.is_notifiable() {
        trace!(issue = %event.issue_key, "Event kind does not notify");
        return Vec::new();
    }

    let mut matches: Vec<FanOut> = issue_on_watched_list(cache, &event.issue_key)
        .into_iter()
        .map(|descriptor| FanOut {
            list: descriptor.to_public_info(),
            subscribers: descriptor.subscribers().cloned().collect(),
            message: format_message(descriptor.name(), event),
        })
        .collect();
    matches.sort_by(|a, b| a.list.key().cmp(&b.list.key()));
    matches
}

/// Formats the chat message for one list.
pub fn format_message(list_name: &str, event: &Event) -> String {
    let author = event.author.as_deref().unwrap_or("Someone");
    let issue = format!("<{}|{}>", event.link, event.issue_key);

    let headline = match event.kind {
        EventKind::NewIssue => match &event.to_status {
            Some(status) => format!("{author} created {issue} in *{status}* on {list_name}"),
            None => format!("{author} created {issue} on {list_name}"),
        },
        _ => {
            let from = event.from_status.as_deref().unwrap_or("?");
            let to = event.to_status.as_deref().unwrap_or("?");
            format!("{author} moved {issue} from *{from}* to *{to}* on {list_name}")
        }
    };

    let mut lines = vec![headline];

    if let Some(summary) = &event.summary {
        lines.push(format!("> {summary}"));
    }
    if let Some(resolution) = &event.resolution {
        lines.push(format!("Resolution: {resolution}"));
    }
    if !event.components.is_empty() {
        lines.push(format!("Components: {}", event.components.join(", ")));
    }
    for annotation in &event.annotations {
        lines.push(format!("{}: {}", annotation.label, annotation.value));
    }

    lines.join("\n")
}

/// Read-side view of the shared watch state.
#[derive(Clone)]
pub struct EventMatcher {
    state: SharedState,
}

impl EventMatcher {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Computes the fan-out for an event against the current cache.
    pub fn match_event(&self, event: &Event) -> Vec<FanOut> {
        let matches = fan_out(lock_state(&self.state).cache(), event);
        debug!(
            issue = %event.issue_key,
            lists = matches.len(),
            "Event matched against watched lists"
        );
        matches
    }
}
