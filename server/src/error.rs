//! Error types for the Boardwatch server.
//!
//! # Error Types
//!
//! - [`ResolutionError`] - a list reference could not be turned into a watched list
//! - [`WatchError`] - outcome of a failed `watch_list` call
//! - [`RefreshError`] - background membership refresh failed for one list
//! - [`DeliveryError`] - a message could not be delivered to one subscriber
//! - [`EventError`] - an inbound webhook payload was malformed
//! - [`ServerError`] - top-level startup failures
//!
//! Background paths (refresh, fan-out, webhook handling) log their errors and
//! never propagate them. Request paths return them to the originating caller.

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::types::{ListKey, ListKind, SubscriberId};

/// A list reference could not be mapped to a valid list.
///
/// `Clone` so that one failed resolution can be handed to every waiter that
/// queued behind it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// The reference is neither a numeric id nor a recognizable board/filter URL.
    #[error("'{0}' is not a board or filter id or URL")]
    InvalidReference(String),

    /// The reference names a different kind of list than the one requested.
    #[error("'{reference}' refers to a {found}, not a {requested}")]
    Ambiguous {
        reference: String,
        requested: ListKind,
        found: ListKind,
    },

    /// The list does not exist.
    #[error("{0} was not found")]
    NotFound(ListKey),

    /// The tracker refused access to the list.
    #[error("permission denied for {0}")]
    PermissionDenied(ListKey),

    /// The tracker failed for a reason unrelated to the reference itself.
    #[error("issue tracker request failed: {0}")]
    Upstream(String),
}

impl ResolutionError {
    pub fn invalid_reference(reference: impl Into<String>) -> Self {
        Self::InvalidReference(reference.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Returns `true` if the failure is caused by what the user asked for,
    /// as opposed to an unexpected internal or upstream problem.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        !matches!(self, Self::Upstream(_))
    }

    /// Human-readable explanation suitable for showing in a chat space.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidReference(reference) => format!(
                "'{reference}' doesn't look like a board or filter. \
                 Use a numeric id or paste the board/filter URL."
            ),
            Self::Ambiguous {
                reference,
                requested,
                found,
            } => format!("'{reference}' is a {found} link, but a {requested} was requested."),
            Self::NotFound(key) | Self::PermissionDenied(key) => format!(
                "Couldn't find {} {}, or I don't have permission to see it.",
                key.kind, key.id
            ),
            Self::Upstream(_) => {
                "Something unexpected went wrong talking to Jira. Please try again later."
                    .to_string()
            }
        }
    }
}

/// Failure outcome of a `watch_list` request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// Resolution failed; shared by every caller waiting on the same attempt.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The resolving task vanished and the list did not show up in the cache
    /// within the bounded wait. Recoverable: the caller may simply retry.
    #[error("{key} is not ready after {attempts} checks")]
    NotReady { key: ListKey, attempts: u32 },

    /// The subscriber unwatched the list while its resolution was in flight.
    #[error("watch of {key} was withdrawn before it resolved")]
    Cancelled { key: ListKey },
}

impl WatchError {
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::Resolution(err) => err.is_user_error(),
            Self::NotReady { .. } => false,
            Self::Cancelled { .. } => true,
        }
    }
}

/// Background membership refresh failed for one list.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to refresh {key}: {source}")]
pub struct RefreshError {
    pub key: ListKey,
    #[source]
    pub source: ResolutionError,
}

/// A message could not be delivered to one subscriber.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The subscriber has no registered delivery target.
    #[error("no delivery target registered for {0}")]
    NoTarget(SubscriberId),

    /// The chat endpoint rejected the message permanently.
    #[error("chat endpoint rejected message with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Transient failures persisted through every retry.
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The delivery target could not be looked up.
    #[error("failed to look up delivery target: {0}")]
    Lookup(String),
}

/// An inbound webhook payload was not a usable issue event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is missing required field '{0}'")]
    MissingField(&'static str),
}

/// Top-level error for server startup.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("space store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// A specialized Result type for server startup.
pub type Result<T> = std::result::Result<T, ServerError>;
