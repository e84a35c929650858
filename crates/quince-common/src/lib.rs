//! Quince Common - Shared types, errors, and bootstrap utilities
//!
//! This crate provides the foundational types used across all Quince components:
//! - Error taxonomy and error codes
//! - Member identity, region scope and data policy
//! - Locator string parsing for cluster discovery
//! - Utility functions

pub mod error;
pub mod locator;
pub mod model;
pub mod utils;

// Re-exports for convenience
pub use error::{ErrorCode, GridError, Result};
pub use locator::{HostAddress, HostResolver, SystemResolver, parse_locators, parse_locators_with};
pub use model::{DataPolicy, MemberId, Scope};
pub use utils::{is_valid_region_name, local_ip, replace_strings};

/// Separator between region names in a full region path
pub const SEPARATOR: &str = "/";

/// Default distributed lock timeout in seconds
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;

/// Default net search timeout in seconds
pub const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 300;

/// Build the full path of a root region
pub fn root_path(root: &str) -> String {
    format!("{}{}", SEPARATOR, root)
}
