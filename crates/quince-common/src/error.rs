//! Error types and error codes for Quince
//!
//! This module defines:
//! - `GridError`: the coordination failure taxonomy
//! - `ErrorCode`: structured error codes for operator-facing output

use serde::{Deserialize, Serialize};

use crate::model::{MemberId, Scope};

/// Result alias used throughout the Quince crates
pub type Result<T> = std::result::Result<T, GridError>;

/// Coordination failures surfaced to the operation that triggered them
#[derive(thiserror::Error, Debug, Clone)]
pub enum GridError {
    #[error(
        "region '{region}' exists with scope {existing} (established by {established_by}), requested {requested}"
    )]
    ScopeConflict {
        region: String,
        existing: Scope,
        requested: Scope,
        established_by: MemberId,
    },

    #[error("timed out after {waited_ms}ms waiting for lock on '{key}' in '{region}'")]
    LockTimeout {
        region: String,
        key: String,
        waited_ms: u64,
    },

    #[error("timed out after {waited_ms}ms searching for '{key}' in '{region}'")]
    SearchTimeout {
        region: String,
        key: String,
        waited_ms: u64,
    },

    #[error("lock handle for '{key}' in '{region}' (lease {lease_id}) was reclaimed")]
    StaleLockHandle {
        region: String,
        key: String,
        lease_id: u64,
    },

    #[error("lock on '{key}' in '{region}' is not held by the caller")]
    NotLockOwner { region: String, key: String },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("malformed locator entry '{entry}': {reason}")]
    MalformedLocator { entry: String, reason: String },

    #[error(
        "bind address {bind_address} is loopback but locator {locator} is not a local address"
    )]
    LoopbackMismatch {
        bind_address: String,
        locator: String,
    },

    #[error("region '{0}' not found")]
    RegionNotFound(String),

    #[error("region '{0}' already exists")]
    RegionExists(String),

    #[error("region '{0}' has been destroyed")]
    RegionDestroyed(String),

    #[error("loader failed for '{key}' in '{region}': {reason}")]
    LoaderFailed {
        region: String,
        key: String,
        reason: String,
    },

    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl GridError {
    /// Whether the failure is a bounded wait that elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            GridError::LockTimeout { .. } | GridError::SearchTimeout { .. }
        )
    }

    /// Whether retrying the same call can succeed without changing its input
    pub fn is_retryable(&self) -> bool {
        self.is_timeout() || matches!(self, GridError::NetworkError(_))
    }

    /// Whether the failure must stop the process from joining the cluster
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            GridError::LoopbackMismatch { .. } | GridError::ConfigError(_)
        )
    }

    pub fn code(&self) -> ErrorCode<'static> {
        match self {
            GridError::ScopeConflict { .. } => SCOPE_CONFLICT,
            GridError::LockTimeout { .. } => LOCK_TIMEOUT,
            GridError::SearchTimeout { .. } => SEARCH_TIMEOUT,
            GridError::StaleLockHandle { .. } | GridError::NotLockOwner { .. } => STALE_LOCK,
            GridError::Cancelled(_) => CANCELLED,
            GridError::MalformedLocator { .. } | GridError::LoopbackMismatch { .. } => {
                LOCATOR_ERROR
            }
            GridError::RegionNotFound(_) | GridError::RegionDestroyed(_) => REGION_NOT_FOUND,
            GridError::RegionExists(_) => REGION_EXISTS,
            GridError::LoaderFailed { .. } => LOADER_ERROR,
            GridError::IllegalArgument(_) => PARAMETER_VALIDATE_ERROR,
            GridError::ConfigError(_) => CONFIG_ERROR,
            GridError::NetworkError(_) => NETWORK_ERROR,
            GridError::InternalError(_) => SERVER_ERROR,
        }
    }
}

/// Error code structure for operator-facing output
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

pub const PARAMETER_VALIDATE_ERROR: ErrorCode<'static> = ErrorCode {
    code: 20002,
    message: "parameter validate error",
};

pub const REGION_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 24000,
    message: "region not found",
};

pub const REGION_EXISTS: ErrorCode<'static> = ErrorCode {
    code: 24001,
    message: "region already exists",
};

pub const SCOPE_CONFLICT: ErrorCode<'static> = ErrorCode {
    code: 24002,
    message: "region scope conflict",
};

pub const LOCK_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: 25000,
    message: "lock wait timed out",
};

pub const STALE_LOCK: ErrorCode<'static> = ErrorCode {
    code: 25001,
    message: "lock handle no longer valid",
};

pub const SEARCH_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: 25002,
    message: "search wait timed out",
};

pub const LOADER_ERROR: ErrorCode<'static> = ErrorCode {
    code: 25003,
    message: "cache loader error",
};

pub const CANCELLED: ErrorCode<'static> = ErrorCode {
    code: 25004,
    message: "operation cancelled",
};

pub const LOCATOR_ERROR: ErrorCode<'static> = ErrorCode {
    code: 26000,
    message: "locator configuration error",
};

pub const CONFIG_ERROR: ErrorCode<'static> = ErrorCode {
    code: 26001,
    message: "configuration error",
};

pub const NETWORK_ERROR: ErrorCode<'static> = ErrorCode {
    code: 26002,
    message: "network error",
};

pub const SERVER_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30000,
    message: "server error",
};
