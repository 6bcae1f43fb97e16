//! Shared-secret check for the Jira webhook endpoint.
//!
//! Jira cloud webhooks cannot sign their payloads, so the endpoint is
//! protected by a token carried in the webhook URL (`/webhook?token=...`).
//! The comparison runs in constant time.
//!
//! # Example
//!
//! ```rust
//! use boardwatch_server::auth::{validate_token, AuthError};
//!
//! assert!(validate_token(Some("s3cret"), "s3cret").is_ok());
//! assert_eq!(validate_token(None, "s3cret"), Err(AuthError::MissingToken));
//! ```

use subtle::ConstantTimeEq;
use thiserror::Error;

/// Errors that can occur during token validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied with the request.
    #[error("missing token")]
    MissingToken,

    /// The supplied token does not match the configured one.
    #[error("invalid token")]
    InvalidToken,
}

/// Checks a supplied token against the expected one.
///
/// # Errors
///
/// - [`AuthError::MissingToken`] if `provided` is `None` or empty
/// - [`AuthError::InvalidToken`] if the tokens differ
pub fn validate_token(provided: Option<&str>, expected: &str) -> Result<(), AuthError> {
    let provided = provided
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)?;

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}
