//! HTTP request handlers
//!
//! - `api` - health check endpoint

pub mod api;

pub use api::health_check;
