// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kestrel-core.
//!
//! The engine distinguishes exactly three error kinds. The run loop is the
//! single point of classification: state logics return these, and nothing
//! else decides an instance's fate.

use std::fmt;

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error code raised for unparseable or failing jq queries.
pub const ERR_CODE_JQ_BAD_QUERY: &str = "direktiv.jq.badCommand";
/// Error code raised when a jq query does not produce a single object.
pub const ERR_CODE_JQ_NOT_OBJECT: &str = "direktiv.jq.notObject";
/// Error code raised when an instance tries to record a second error.
pub const ERR_CODE_MULTIPLE_ERRORS: &str = "direktiv.workflow.multipleErrors";
/// Error code raised when every branch of a parallel state fails.
pub const ERR_CODE_ALL_BRANCHES_FAILED: &str = "direktiv.parallel.allFailed";
/// Error code raised when an instance exceeds the maximum number of steps.
pub const ERR_CODE_STEP_LIMIT: &str = "direktiv.limits.steps";
/// Error code raised when a subflow exceeds the maximum recursion depth.
pub const ERR_CODE_DEPTH_LIMIT: &str = "direktiv.limits.depth";
/// Error code recorded on children cancelled by their parent workflow.
pub const ERR_CODE_CANCELLED_BY_PARENT: &str = "direktiv.cancels.parent";
/// Error code recorded on instances cancelled by a timeout.
pub const ERR_CODE_TIMEOUT: &str = "direktiv.cancels.timeout";
/// Error code raised when a referenced workflow does not exist.
pub const ERR_CODE_NO_SUCH_WORKFLOW: &str = "direktiv.subflow.notExist";
/// Error code raised when a workflow's start type forbids the invocation.
pub const ERR_CODE_INVALID_START: &str = "direktiv.workflow.start";

/// Message recorded for internal errors; the real cause stays in server logs.
pub const INTERNAL_ERROR_MESSAGE: &str = "an internal error occurred";

/// Errors that can occur while executing workflow instances.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// May be matched by state-level catchers and rerouted or retried.
    #[error("{code}: {message}")]
    Catchable {
        /// Stable error code matched against catcher regexes.
        code: String,
        /// Human-readable error message.
        message: String,
    },

    /// Terminates the instance as `failed` without catcher consultation.
    #[error("{code}: {message}")]
    Uncatchable {
        /// Stable error code reported to callers.
        code: String,
        /// Human-readable error message.
        message: String,
    },

    /// Terminates the instance as `crashed`; the wrapped detail is logged
    /// server-side and replaced with generic text for external callers.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Create a catchable error.
    pub fn catchable(code: &str, message: impl fmt::Display) -> Self {
        EngineError::Catchable {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Create an uncatchable error.
    pub fn uncatchable(code: &str, message: impl fmt::Display) -> Self {
        EngineError::Uncatchable {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Wrap an arbitrary error as internal.
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        EngineError::Internal(err.into())
    }

    /// Create an internal error from a message.
    pub fn internal_msg(message: impl fmt::Display) -> Self {
        EngineError::Internal(anyhow::anyhow!("{message}"))
    }

    /// The error code; empty for internal errors.
    pub fn code(&self) -> &str {
        match self {
            EngineError::Catchable { code, .. } | EngineError::Uncatchable { code, .. } => code,
            EngineError::Internal(_) => "",
        }
    }

    /// The message reported to external callers. Internal detail is
    /// sanitized away.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::Catchable { message, .. } | EngineError::Uncatchable { message, .. } => {
                message.clone()
            }
            EngineError::Internal(_) => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    /// Whether this error may be handled by state-level catchers.
    pub fn is_catchable(&self) -> bool {
        matches!(self, EngineError::Catchable { .. })
    }

    /// Whether this error is internal.
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::Internal(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Internal(anyhow::Error::new(err).context("database operation failed"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(anyhow::Error::new(err).context("serialization failed"))
    }
}

impl From<kestrel_model::ModelError> for EngineError {
    fn from(err: kestrel_model::ModelError) -> Self {
        EngineError::Internal(anyhow::Error::new(err).context("workflow model failed to load"))
    }
}
