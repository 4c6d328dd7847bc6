//! HTTP routers
//!
//! - `api` - health probe router

pub mod api;
