//! Issue tracker access: list reference parsing and the Jira REST client.
//!
//! The coordinator talks to the tracker only through the [`ListResolver`]
//! trait, so tests can substitute an in-memory fake. [`JiraClient`] is the
//! production implementation:
//!
//! - boards via `/rest/agile/1.0/board/{id}` and its paginated `/issue` listing
//! - filters via `/rest/api/2/filter/{id}` and a paginated `filter={id}` search
//!
//! # Reference formats
//!
//! [`parse_list_reference`] accepts a bare numeric id (kind taken from the
//! hint, board by default) or a URL copied from the browser:
//!
//! - `.../secure/RapidBoard.jspa?rapidView=42` and `.../boards/42` are boards
//! - `.../issues/?filter=10000` and `.../filters/10000` are filters

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::ResolutionError;
use crate::types::{ListKey, ListKind, ListSummary};

/// Default timeout for Jira API requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size requested from paginated issue listings.
const PAGE_SIZE: usize = 100;

/// Default upper bound on pages fetched for one list (10,000 issues).
pub const DEFAULT_MAX_PAGES: usize = 100;

/// Resolves list references and fetches list membership from the tracker.
#[async_trait]
pub trait ListResolver: Send + Sync {
    /// Turns a raw reference (id or URL) into a cache key.
    ///
    /// The default implementation is purely syntactic; implementations may
    /// override it to consult the tracker.
    async fn normalize_reference(
        &self,
        reference: &str,
        kind_hint: Option<ListKind>,
    ) -> Result<ListKey, ResolutionError> {
        parse_list_reference(reference, kind_hint)
    }

    /// Validates that a list exists and returns its display metadata.
    async fn resolve_list(&self, key: &ListKey) -> Result<ListSummary, ResolutionError>;

    /// Fetches the keys of the issues currently on the list.
    ///
    /// Implementations may cap how many issues they fetch for one list. A
    /// capped list is returned as a success holding only the issues fetched,
    /// so events for issues past the cap are not matched.
    /// [`JiraClient`] stops after [`DEFAULT_MAX_PAGES`] pages of 100 issues
    /// unless configured otherwise with [`JiraClient::with_max_pages`].
    async fn fetch_member_issue_keys(
        &self,
        list: &ListSummary,
    ) -> Result<HashSet<String>, ResolutionError>;
}

/// Parses a list reference into a [`ListKey`].
///
/// # Errors
///
/// - [`ResolutionError::InvalidReference`] if the reference is not an id or a
///   recognizable board/filter URL
/// - [`ResolutionError::Ambiguous`] if a URL names a different kind than the hint
pub fn parse_list_reference(
    reference: &str,
    kind_hint: Option<ListKind>,
) -> Result<ListKey, ResolutionError> {
    let trimmed = reference.trim();

    if is_list_id(trimmed) {
        return Ok(ListKey::new(
            kind_hint.unwrap_or(ListKind::Board),
            trimmed,
        ));
    }

    let url = Url::parse(trimmed).map_err(|_| ResolutionError::invalid_reference(trimmed))?;
    let found = key_from_url(&url).ok_or_else(|| ResolutionError::invalid_reference(trimmed))?;

    match kind_hint {
        Some(requested) if requested != found.kind => Err(ResolutionError::Ambiguous {
            reference: trimmed.to_string(),
            requested,
            found: found.kind,
        }),
        _ => Ok(found),
    }
}

fn is_list_id(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.bytes().all(|b| b.is_ascii_digit())
}

fn key_from_url(url: &Url) -> Option<ListKey> {
    for (name, value) in url.query_pairs() {
        if !is_list_id(&value) {
            continue;
        }
        match name.as_ref() {
            "rapidView" => return Some(ListKey::board(value.as_ref())),
            "filter" | "filterId" => return Some(ListKey::filter(value.as_ref())),
            _ => {}
        }
    }

    let segments: Vec<&str> = url.path_segments()?.collect();
    segments.windows(2).find_map(|pair| match pair {
        ["boards", id] if is_list_id(id) => Some(ListKey::board(*id)),
        ["filters", id] if is_list_id(id) => Some(ListKey::filter(*id)),
        _ => None,
    })
}

/// Errors returned by the Jira REST API client.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The requested resource does not exist (404).
    #[error("resource not found")]
    NotFound,

    /// The credentials may not see the resource (401/403).
    #[error("access denied with status {0}")]
    Forbidden(u16),

    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Jira is unreachable.
    #[error("jira unavailable: {0}")]
    Unavailable(String),

    /// Jira answered with something we could not use.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration error.
    #[error("client configuration error: {0}")]
    Configuration(String),
}

impl TrackerError {
    /// Attributes a client failure to the list it was about.
    #[must_use]
    pub fn into_resolution(self, key: &ListKey) -> ResolutionError {
        match self {
            Self::NotFound => ResolutionError::NotFound(key.clone()),
            Self::Forbidden(_) => ResolutionError::PermissionDenied(key.clone()),
            other => ResolutionError::upstream(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BoardResponse {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterResponse {
    id: String,
    name: String,
    view_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssuePage {
    #[serde(default)]
    total: Option<usize>,
    #[serde(default)]
    issues: Vec<IssueRef>,
}

#[derive(Debug, Deserialize)]
struct IssueRef {
    key: String,
}

/// Jira REST client implementing [`ListResolver`].
#[derive(Debug, Clone)]
pub struct JiraClient {
    http_client: Client,
    base_url: String,
    email: String,
    api_token: String,
    max_pages: usize,
}

impl JiraClient {
    /// Creates a new client authenticating with an API token.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Configuration`] if the HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        email: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Result<Self, TrackerError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TrackerError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            email: email.into(),
            api_token: api_token.into(),
            max_pages: DEFAULT_MAX_PAGES,
        })
    }

    /// Sets how many pages of issues are fetched per list before giving up
    /// on the rest. At least one page is always fetched.
    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Returns the base URL of the Jira site.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, TrackerError> {
        let url = format!("{}{}", self.base_url, path);

        debug!(url = %url, "Requesting Jira resource");

        let response = self
            .http_client
            .get(&url)
            .basic_auth(&self.email, Some(&self.api_token))
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackerError::Timeout(REQUEST_TIMEOUT)
                } else if e.is_connect() {
                    TrackerError::Unavailable(format!("connection failed: {e}"))
                } else {
                    TrackerError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();

        match status {
            StatusCode::NOT_FOUND => return Err(TrackerError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(TrackerError::Forbidden(status.as_u16()))
            }
            _ => {}
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, url = %url, body = %body, "Unexpected response from Jira");
            return Err(TrackerError::InvalidResponse(format!(
                "unexpected status {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TrackerError::InvalidResponse(format!("failed to parse response: {e}")))
    }

    /// Walks a paginated issue listing and collects the issue keys.
    async fn collect_issue_keys(
        &self,
        path: &str,
        extra_query: &[(&str, String)],
    ) -> Result<HashSet<String>, TrackerError> {
        let mut keys = HashSet::new();
        let mut start_at = 0usize;

        for _ in 0..self.max_pages {
            let mut query = vec![
                ("startAt", start_at.to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
                ("fields", "key".to_string()),
            ];
            query.extend(extra_query.iter().cloned());

            let page: IssuePage = self.get_json(path, &query).await?;
            let fetched = page.issues.len();
            keys.extend(page.issues.into_iter().map(|issue| issue.key));
            start_at += fetched;

            let exhausted = page.total.map_or(fetched < PAGE_SIZE, |total| start_at >= total);
            if fetched == 0 || exhausted {
                return Ok(keys);
            }
        }

        warn!(
            path = %path,
            fetched = keys.len(),
            max_pages = self.max_pages,
            "Issue listing truncated at page limit, later issues will not match"
        );
        Ok(keys)
    }

    async fn fetch_board(&self, id: &str) -> Result<ListSummary, TrackerError> {
        let board: BoardResponse = self
            .get_json(&format!("/rest/agile/1.0/board/{id}"), &[])
            .await?;

        Ok(ListSummary {
            id: board.id.to_string(),
            kind: ListKind::Board,
            name: board.name,
            view_url: format!(
                "{}/secure/RapidBoard.jspa?rapidView={}",
                self.base_url, board.id
            ),
        })
    }

    async fn fetch_filter(&self, id: &str) -> Result<ListSummary, TrackerError> {
        let filter: FilterResponse = self
            .get_json(&format!("/rest/api/2/filter/{id}"), &[])
            .await?;

        let view_url = filter
            .view_url
            .unwrap_or_else(|| format!("{}/issues/?filter={}", self.base_url, filter.id));

        Ok(ListSummary {
            id: filter.id,
            kind: ListKind::Filter,
            name: filter.name,
            view_url,
        })
    }
}

#[async_trait]
impl ListResolver for JiraClient {
    async fn resolve_list(&self, key: &ListKey) -> Result<ListSummary, ResolutionError> {
        let result = match key.kind {
            ListKind::Board => self.fetch_board(&key.id).await,
            ListKind::Filter => self.fetch_filter(&key.id).await,
        };
        result.map_err(|e| e.into_resolution(key))
    }

    async fn fetch_member_issue_keys(
        &self,
        list: &ListSummary,
    ) -> Result<HashSet<String>, ResolutionError> {
        let result = match list.kind {
            ListKind::Board => {
                self.collect_issue_keys(&format!("/rest/agile/1.0/board/{}/issue", list.id), &[])
                    .await
            }
            ListKind::Filter => {
                self.collect_issue_keys("/rest/api/2/search", &[("jql", format!("filter={}", list.id))])
                    .await
            }
        };
        result.map_err(|e| e.into_resolution(&list.key()))
    }
}
