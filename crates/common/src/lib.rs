//! Common utilities and shared components for Burrow
//!
//! This crate provides functionality shared by the configuration and proxy
//! crates: error types, identifiers, the host/port authority type and the
//! tracing bootstrap.
//!
//! # Module Organization
//!
//! - [`ids`]: Type-safe identifier newtypes (ClusterId, ListenerId, ConnectionId)
//! - [`types`]: Common type definitions (Authority)
//! - [`errors`]: Error types and result aliases
//! - [`observability`]: Logging and tracing initialization

pub mod errors;
pub mod ids;
pub mod observability;
pub mod types;

pub use errors::{BurrowError, BurrowResult};
pub use ids::{ClusterId, ConnectionId, ListenerId};
pub use observability::init_tracing;
pub use types::{Authority, AuthorityParseError};
