//! Distributed Lock Implementation
//!
//! This module provides:
//! - Lock token data model and handles
//! - Lock acquire/release API with bounded, non-blocking and unbounded waits
//! - First-requested, first-granted waiter queues
//! - Token reclaim on member departure and lease expiry

mod model;
mod service;

pub use model::*;
pub use service::*;
