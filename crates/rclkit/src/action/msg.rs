// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Envelopes exchanged on the five action channels.
//!
//! The goal, cancel and result channels are request/response pairs, feedback
//! and status are topics. User payloads (goal, result, feedback) are generic;
//! everything else is fixed bookkeeping shared by client and server.

use super::GoalStatus;
use crate::message::Time;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique goal identifier, 16 random bytes chosen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalId(Uuid);

impl GoalId {
    /// The all-zero id, meaning "no particular goal" in cancel requests.
    pub const ZERO: GoalId = GoalId(Uuid::nil());

    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for GoalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Goal id plus the time the server accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GoalInfo {
    pub goal_id: GoalId,
    pub stamp: Time,
}

impl GoalInfo {
    pub fn new(goal_id: GoalId, stamp: Time) -> Self {
        Self { goal_id, stamp }
    }
}

/// One entry of a status broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalStatusEntry {
    pub goal_info: GoalInfo,
    pub status: GoalStatus,
}

/// Status broadcast: the status of every goal the server tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalStatusArray {
    pub status_list: Vec<GoalStatusEntry>,
}

/// Request on the goal channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGoalRequest<G> {
    pub goal_id: GoalId,
    pub goal: G,
}

/// Response on the goal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendGoalResponse {
    pub accepted: bool,
    pub stamp: Time,
}

/// Request on the result channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResultRequest {
    pub goal_id: GoalId,
}

/// Response on the result channel. `result` is absent when the goal is
/// unknown or did not produce one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResultResponse<R> {
    pub status: GoalStatus,
    pub result: Option<R>,
}

/// Request on the cancel channel.
///
/// A zero id and zero stamp cancels every goal; a zero id and a stamp
/// cancels goals accepted at or before the stamp; an id and zero stamp
/// cancels that goal; an id and a stamp cancels the union of both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelGoalRequest {
    pub goal_info: GoalInfo,
}

impl CancelGoalRequest {
    /// Cancels every goal.
    pub fn all() -> Self {
        Self {
            goal_info: GoalInfo::new(GoalId::ZERO, Time::ZERO),
        }
    }

    /// Cancels a single goal.
    pub fn goal(goal_id: GoalId) -> Self {
        Self {
            goal_info: GoalInfo::new(goal_id, Time::ZERO),
        }
    }

    /// Cancels every goal accepted at or before `stamp`.
    pub fn accepted_before(stamp: Time) -> Self {
        Self {
            goal_info: GoalInfo::new(GoalId::ZERO, stamp),
        }
    }
}

/// Outcome code of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i8)]
pub enum CancelReturnCode {
    None = 0,
    Rejected = 1,
    UnknownGoalId = 2,
    GoalTerminated = 3,
}

/// Response on the cancel channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelGoalResponse {
    pub return_code: CancelReturnCode,
    pub goals_canceling: Vec<GoalInfo>,
}

/// Message on the feedback channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackMessage<F> {
    pub goal_id: GoalId,
    pub feedback: F,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_id_unique_and_nonzero() {
        let a = GoalId::new();
        let b = GoalId::new();
        assert_ne!(a, b);
        assert!(!a.is_zero());
        assert!(GoalId::ZERO.is_zero());
        assert_eq!(GoalId::from_bytes(*a.as_bytes()), a);
    }

    #[test]
    fn test_cancel_request_constructors() {
        let all = CancelGoalRequest::all();
        assert!(all.goal_info.goal_id.is_zero() && all.goal_info.stamp.is_zero());

        let id = GoalId::new();
        let one = CancelGoalRequest::goal(id);
        assert_eq!(one.goal_info.goal_id, id);
        assert!(one.goal_info.stamp.is_zero());

        let stamp = Time { sec: 10, nanosec: 0 };
        let before = CancelGoalRequest::accepted_before(stamp);
        assert!(before.goal_info.goal_id.is_zero());
        assert_eq!(before.goal_info.stamp, stamp);
    }
}
