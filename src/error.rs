//! Unified error handling for PageForge
//!
//! Each module carries its own `thiserror` enum; this module consolidates
//! them into a single type for embedders, with a category classification:
//! - User errors (bad request input, actionable by the caller)
//! - Recoverable errors (allocation pressure, retry after capacity frees up)
//! - Internal errors (bookkeeping bugs, report upstream)

use std::fmt;

use thiserror::Error;

use crate::kv_cache::CacheError;
use crate::scheduler::SchedulerError;
use crate::stream::StreamError;

/// Unified error type for PageForge
#[derive(Debug, Error)]
pub enum PageForgeError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub type PageForgeResult<T> = std::result::Result<T, PageForgeError>;

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid request input; the caller should fix it
    User,
    /// Temporary capacity condition; retry later
    Recoverable,
    /// Bookkeeping bug; report it
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl PageForgeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PageForgeError::Cache(error) => {
                if error.is_out_of_blocks() {
                    ErrorCategory::Recoverable
                } else {
                    ErrorCategory::Internal
                }
            }
            PageForgeError::Scheduler(error) => {
                if error.is_input_error() {
                    ErrorCategory::User
                } else {
                    ErrorCategory::Internal
                }
            }
            PageForgeError::Stream(_) => ErrorCategory::Internal,
        }
    }

    /// Temporary condition; the caller may retry after capacity frees up
    pub fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Recoverable
    }

    /// Invalid input; the caller should fix the request
    pub fn is_user_error(&self) -> bool {
        self.category() == ErrorCategory::User
    }

    /// Indicates a bug in the cache or scheduler bookkeeping
    pub fn is_internal_error(&self) -> bool {
        self.category() == ErrorCategory::Internal
    }
}
