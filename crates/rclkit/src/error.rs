// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the runtime.

use crate::action::{GoalEvent, GoalId, GoalStatus};
use crate::config::ConfigError;
use crate::transport::TransportError;
use thiserror::Error;

/// Errors returned by runtime operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation's cancellation token fired.
    #[error("operation canceled")]
    Canceled,

    /// A timed request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The request channel was closed while (or before) waiting for a response.
    #[error("request channel closed")]
    Closed,

    /// The entity was closed already.
    #[error("{0} is already closed")]
    AlreadyClosed(&'static str),

    /// The entity is held by another running wait set.
    #[error("{0} is already reserved by another wait set")]
    AlreadyReserved(&'static str),

    /// A goal with the same id is already registered on the server.
    #[error("goal {0} is already registered")]
    DuplicateGoal(GoalId),

    /// The goal state machine does not allow `event` from `status`.
    #[error("invalid goal transition: {event:?} from {status}")]
    InvalidTransition { status: GoalStatus, event: GoalEvent },

    /// The action server rejected the goal.
    #[error("goal was rejected by the action server")]
    GoalRejected,

    /// The goal reached a terminal state other than succeeded.
    #[error("goal finished with status {0}")]
    GoalNotSucceeded(GoalStatus),

    /// Middleware failure.
    #[error(transparent)]
    Transport(TransportError),

    /// Payload could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A runtime task failed to complete.
    #[error("runtime task failed: {0}")]
    Task(String),
}

impl Error {
    /// Returns `true` if the error reports a fired cancellation token.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::GoalExists(id) => Error::DuplicateGoal(id),
            TransportError::InvalidTransition { status, event } => {
                Error::InvalidTransition { status, event }
            }
            other => Error::Transport(other),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
