//! Parsing of inbound Jira webhook payloads.
//!
//! Only the parts of the payload the relay needs are deserialized. Anything
//! else in `issue.fields` is kept in a loose map so configured custom fields
//! can be rendered as annotations.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::config::CustomField;
use crate::error::EventError;

const ISSUE_CREATED: &str = "jira:issue_created";
const STATUS_FIELD: &str = "status";

/// What happened to the issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StatusTransition,
    NewIssue,
    Other,
}

impl EventKind {
    /// Returns `true` for the kinds that can produce notifications.
    #[must_use]
    pub fn is_notifiable(&self) -> bool {
        matches!(self, Self::StatusTransition | Self::NewIssue)
    }
}

/// A labelled custom-field value rendered under the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub label: String,
    pub value: String,
}

/// A normalized issue event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub issue_key: String,
    pub kind: EventKind,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub link: String,
    pub resolution: Option<String>,
    pub components: Vec<String>,
    pub annotations: Vec<Annotation>,
}

/// Settings needed to turn a payload into an [`Event`].
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// Base URL used to build issue links.
    pub jira_url: String,
    /// Custom fields rendered as annotations, in display order.
    pub custom_fields: Vec<CustomField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    webhook_event: Option<String>,
    user: Option<Named>,
    issue: Option<IssuePayload>,
    changelog: Option<Changelog>,
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    key: Option<String>,
    #[serde(default)]
    fields: IssueFields,
}

#[derive(Debug, Default, Deserialize)]
struct IssueFields {
    summary: Option<String>,
    status: Option<Named>,
    resolution: Option<Named>,
    #[serde(default)]
    components: Option<Vec<Named>>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Named {
    name: Option<String>,
    display_name: Option<String>,
}

impl Named {
    fn label(self) -> Option<String> {
        self.display_name.or(self.name)
    }
}

#[derive(Debug, Deserialize)]
struct Changelog {
    #[serde(default)]
    items: Vec<ChangeItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeItem {
    field: String,
    from_string: Option<String>,
    to_string: Option<String>,
}

impl Event {
    /// Parses a raw webhook body.
    ///
    /// # Errors
    ///
    /// - [`EventError::InvalidJson`] if the body is not a JSON object of the
    ///   expected shape
    /// - [`EventError::MissingField`] if there is no `issue.key`
    pub fn parse(raw: &[u8], context: &EventContext) -> Result<Self, EventError> {
        let payload: WebhookPayload =
            serde_json::from_slice(raw).map_err(|e| EventError::InvalidJson(e.to_string()))?;

        let issue = payload.issue.ok_or(EventError::MissingField("issue"))?;
        let issue_key = issue
            .key
            .filter(|key| !key.trim().is_empty())
            .ok_or(EventError::MissingField("issue.key"))?;

        let status_change = payload
            .changelog
            .and_then(|changelog| {
                changelog
                    .items
                    .into_iter()
                    .find(|item| item.field.eq_ignore_ascii_case(STATUS_FIELD))
            });

        let fields = issue.fields;
        let current_status = fields.status.and_then(Named::label);

        let (kind, from_status, to_status) = if payload.webhook_event.as_deref() == Some(ISSUE_CREATED)
        {
            (EventKind::NewIssue, None, current_status)
        } else if let Some(change) = status_change {
            (
                EventKind::StatusTransition,
                change.from_string,
                change.to_string.or(current_status),
            )
        } else {
            (EventKind::Other, None, current_status)
        };

        let annotations = context
            .custom_fields
            .iter()
            .filter_map(|field| {
                fields
                    .extra
                    .get(&field.id)
                    .and_then(render_field_value)
                    .map(|value| Annotation {
                        label: field.label.clone(),
                        value,
                    })
            })
            .collect();

        Ok(Self {
            link: format!("{}/browse/{}", context.jira_url.trim_end_matches('/'), issue_key),
            issue_key,
            kind,
            from_status,
            to_status,
            author: payload.user.and_then(Named::label),
            summary: fields.summary,
            resolution: fields.resolution.and_then(Named::label),
            components: fields
                .components
                .unwrap_or_default()
                .into_iter()
                .filter_map(Named::label)
                .collect(),
            annotations,
        })
    }
}

/// Renders a custom-field value for display.
///
/// Strings and numbers are shown as-is, select options by their `value` or
/// `name`, and arrays are joined with commas. Empty values yield `None`.
fn render_field_value(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(map) => ["value", "name", "displayName"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))?
            .to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(render_field_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => return None,
    };

    (!rendered.is_empty()).then_some(rendered)
}
