//! Resilient GraphQL execution for the Linear API.
//!
//! [`http::GraphqlClient`] turns an [`http::Operation`] into a delivered HTTP
//! exchange: retries with exponential backoff, honours `Retry-After`, refreshes
//! an expired credential once per operation, and reports failures as
//! [`error::ApiError`].

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod runtime;
