// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Actions: long-running goals with feedback, cancellation and results.
//!
//! An action is made of five channels. Goals, cancel requests and result
//! requests are request/response pairs driven by
//! [`RequestCorrelator`](crate::correlator::RequestCorrelator) on the client
//! side; feedback and status are topics fanned out to registered handlers.
//!
//! # Goal lifecycle (server side)
//!
//! ```text
//! Unknown --accept--> Accepted --execute--> Executing
//! Executing --succeed--> Succeeded
//! Executing --abort-->   Aborted
//! Executing --cancel-request--> Canceling --cancel-confirm--> Canceled
//! ```
//!
//! `Accepted` may also move straight to `Canceling`, and a `Canceling` goal
//! may still succeed or abort. `Succeeded`, `Canceled` and `Aborted` are
//! terminal.

mod client;
mod msg;
mod server;

pub use client::{ActionClient, ActionClientOptions, GoalWatch};
pub use msg::{
    CancelGoalRequest, CancelGoalResponse, CancelReturnCode, FeedbackMessage, GetResultRequest,
    GetResultResponse, GoalId, GoalInfo, GoalStatusArray, GoalStatusEntry, SendGoalRequest,
    SendGoalResponse,
};
pub use server::{ActionServer, ActionServerOptions, FeedbackSender, GoalHandle};

use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error type returned by goal executors.
pub type GoalError = Box<dyn std::error::Error + Send + Sync>;

/// An action definition: the goal, result and feedback message types.
pub trait Action: Send + Sync + 'static {
    type Goal: Message;
    type Result: Message;
    type Feedback: Message;

    /// Type name checked by the transport when endpoints are matched.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Server-side goal executor.
///
/// Called at most once per goal request, on its own task. The goal is
/// rejected if this returns before [`GoalHandle::accept`] was called.
/// Otherwise the goal succeeds on `Ok`, aborts on `Err` or panic, and is
/// canceled whenever `cancel` fired, whatever the return value.
///
/// Closures `Fn(CancellationToken, Arc<GoalHandle<A>>) -> impl Future` are
/// accepted as executors.
#[async_trait]
pub trait ExecuteGoal<A: Action>: Send + Sync + 'static {
    async fn execute_goal(
        &self,
        cancel: CancellationToken,
        goal: Arc<GoalHandle<A>>,
    ) -> Result<A::Result, GoalError>;
}

#[async_trait]
impl<A, F, Fut> ExecuteGoal<A> for F
where
    A: Action,
    F: Fn(CancellationToken, Arc<GoalHandle<A>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<A::Result, GoalError>> + Send + 'static,
{
    async fn execute_goal(
        &self,
        cancel: CancellationToken,
        goal: Arc<GoalHandle<A>>,
    ) -> Result<A::Result, GoalError> {
        (self)(cancel, goal).await
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

/// Goal status, with the numeric codes of `action_msgs/GoalStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i8)]
pub enum GoalStatus {
    #[default]
    Unknown = 0,
    Accepted = 1,
    Executing = 2,
    Canceling = 3,
    Succeeded = 4,
    Canceled = 5,
    Aborted = 6,
}

impl GoalStatus {
    pub fn code(self) -> i8 {
        self as i8
    }

    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            0 => Self::Unknown,
            1 => Self::Accepted,
            2 => Self::Executing,
            3 => Self::Canceling,
            4 => Self::Succeeded,
            5 => Self::Canceled,
            6 => Self::Aborted,
            _ => return None,
        })
    }

    /// `Succeeded`, `Canceled` or `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Canceled | Self::Aborted)
    }

    /// `Accepted`, `Executing` or `Canceling`.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Accepted | Self::Executing | Self::Canceling)
    }

    /// Applies `event`, returning the new status or `None` if the state
    /// machine does not allow it. Acceptance itself (`Unknown -> Accepted`)
    /// is performed by the transport's `accept_new_goal`, not by an event.
    pub fn transition(self, event: GoalEvent) -> Option<GoalStatus> {
        use GoalEvent as E;
        use GoalStatus as S;
        match (self, event) {
            (S::Accepted, E::Execute) => Some(S::Executing),
            (S::Accepted | S::Executing, E::CancelGoal) => Some(S::Canceling),
            (S::Executing | S::Canceling, E::Succeed) => Some(S::Succeeded),
            (S::Executing | S::Canceling, E::Abort) => Some(S::Aborted),
            (S::Canceling, E::Canceled) => Some(S::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Accepted => "accepted",
            Self::Executing => "executing",
            Self::Canceling => "canceling",
            Self::Succeeded => "succeeded",
            Self::Canceled => "canceled",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Events driving [`GoalStatus::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GoalEvent {
    Execute,
    CancelGoal,
    Succeed,
    Abort,
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [GoalStatus; 7] = [
        GoalStatus::Unknown,
        GoalStatus::Accepted,
        GoalStatus::Executing,
        GoalStatus::Canceling,
        GoalStatus::Succeeded,
        GoalStatus::Canceled,
        GoalStatus::Aborted,
    ];

    #[test]
    fn test_status_codes() {
        for status in ALL {
            assert_eq!(GoalStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(GoalStatus::from_code(7), None);
        assert_eq!(GoalStatus::Aborted.code(), 6);
    }

    #[test]
    fn test_happy_path() {
        let s = GoalStatus::Accepted;
        let s = s.transition(GoalEvent::Execute).unwrap();
        assert_eq!(s, GoalStatus::Executing);
        assert_eq!(s.transition(GoalEvent::Succeed), Some(GoalStatus::Succeeded));
        assert_eq!(s.transition(GoalEvent::Abort), Some(GoalStatus::Aborted));
    }

    #[test]
    fn test_cancel_path() {
        let s = GoalStatus::Executing.transition(GoalEvent::CancelGoal).unwrap();
        assert_eq!(s, GoalStatus::Canceling);
        assert_eq!(s.transition(GoalEvent::Canceled), Some(GoalStatus::Canceled));
        assert_eq!(s.transition(GoalEvent::Succeed), Some(GoalStatus::Succeeded));
        assert_eq!(
            GoalStatus::Accepted.transition(GoalEvent::CancelGoal),
            Some(GoalStatus::Canceling)
        );
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        let events = [
            GoalEvent::Execute,
            GoalEvent::CancelGoal,
            GoalEvent::Succeed,
            GoalEvent::Abort,
            GoalEvent::Canceled,
        ];
        for status in ALL.into_iter().filter(|s| s.is_terminal()) {
            for event in events {
                assert_eq!(status.transition(event), None, "{status} {event:?}");
            }
        }
        for event in events {
            assert_eq!(GoalStatus::Unknown.transition(event), None);
        }
    }

    #[test]
    fn test_executing_cannot_be_canceled_directly() {
        assert_eq!(GoalStatus::Executing.transition(GoalEvent::Canceled), None);
        assert_eq!(GoalStatus::Executing.transition(GoalEvent::Execute), None);
    }
}
