//! Boardwatch Server - Jira board and filter notification relay.
//!
//! This crate receives Jira webhooks and tells chat spaces about changes to
//! issues on the boards and filters they watch. It is responsible for:
//! - Resolving watch requests into cached lists, once per list
//! - Keeping list membership fresh in the background
//! - Matching issue events against watched lists and fanning out messages
//!
//! # Architecture
//!
//! [`service::WatchService`] owns the watch cache. Requests to watch a list go
//! through [`coordinator::PendingRequestCoordinator`], which deduplicates
//! concurrent resolutions; [`refresh::RefreshScheduler`] re-fetches membership
//! periodically; [`matcher`] decides who hears about an event. The issue
//! tracker and the chat platform sit behind the [`tracker::ListResolver`] and
//! [`delivery::ChatDelivery`] traits.

pub mod auth;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod event;
pub mod matcher;
pub mod refresh;
pub mod routes;
pub mod service;
pub mod store;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod test_support;
