// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Middleware abstraction.
//!
//! The runtime never performs I/O itself. Everything that touches the
//! middleware goes through [`Transport`]: entity creation, the blocking
//! "wait for any of these" primitive, per-entity take/send, and the goal
//! bookkeeping of action servers. Payloads are opaque bytes.
//!
//! [`LoopbackTransport`] is an in-process implementation.

mod loopback;

pub use loopback::LoopbackTransport;

use crate::action::{
    CancelGoalRequest, CancelGoalResponse, GoalEvent, GoalId, GoalInfo, GoalStatus,
    GoalStatusEntry,
};
use crate::qos::{ActionQos, QosProfile};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Handle of a transport-side entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(u64);

impl EntityId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-sender request sequence number.
pub type SequenceNumber = i64;

/// Identifies one request: the sending client entity and its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub client: EntityId,
    pub sequence_number: SequenceNumber,
}

/// Metadata of a received topic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub source_timestamp: SystemTime,
    pub received_timestamp: SystemTime,
    pub publisher: EntityId,
}

/// Metadata of a received request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    pub source_timestamp: SystemTime,
    pub received_timestamp: SystemTime,
    pub request_id: RequestId,
}

/// Request/response channel selector. `Service` is a plain service; the
/// other three are the request/response channels of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceChannel {
    Service,
    SendGoal,
    CancelGoal,
    GetResult,
}

impl ServiceChannel {
    /// Readiness bit raised on the server when a request is queued.
    pub fn request_mask(self) -> ReadyMask {
        match self {
            Self::Service => ReadyMask::DATA,
            Self::SendGoal => ReadyMask::GOAL_REQUEST,
            Self::CancelGoal => ReadyMask::CANCEL_REQUEST,
            Self::GetResult => ReadyMask::RESULT_REQUEST,
        }
    }

    /// Readiness bit raised on the client when a response is queued.
    pub fn response_mask(self) -> ReadyMask {
        match self {
            Self::Service => ReadyMask::DATA,
            Self::SendGoal => ReadyMask::GOAL_RESPONSE,
            Self::CancelGoal => ReadyMask::CANCEL_RESPONSE,
            Self::GetResult => ReadyMask::RESULT_RESPONSE,
        }
    }
}

/// Topic channel selector. `Feedback` and `Status` are the topics of an
/// action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicChannel {
    Topic,
    Feedback,
    Status,
}

impl TopicChannel {
    pub fn mask(self) -> ReadyMask {
        match self {
            Self::Topic => ReadyMask::DATA,
            Self::Feedback => ReadyMask::FEEDBACK,
            Self::Status => ReadyMask::STATUS,
        }
    }
}

/// Bitmask of what is ready on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReadyMask(u16);

impl ReadyMask {
    pub const NONE: ReadyMask = ReadyMask(0);
    /// Topic message, service request, service response or guard trigger.
    pub const DATA: ReadyMask = ReadyMask(1 << 0);
    pub const GOAL_REQUEST: ReadyMask = ReadyMask(1 << 1);
    pub const CANCEL_REQUEST: ReadyMask = ReadyMask(1 << 2);
    pub const RESULT_REQUEST: ReadyMask = ReadyMask(1 << 3);
    pub const GOAL_RESPONSE: ReadyMask = ReadyMask(1 << 4);
    pub const CANCEL_RESPONSE: ReadyMask = ReadyMask(1 << 5);
    pub const RESULT_RESPONSE: ReadyMask = ReadyMask(1 << 6);
    pub const FEEDBACK: ReadyMask = ReadyMask(1 << 7);
    pub const STATUS: ReadyMask = ReadyMask(1 << 8);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: ReadyMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for ReadyMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ReadyMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Result of one [`Transport::wait`]: the ready entities and what is ready
/// on each.
#[derive(Debug, Clone, Default)]
pub struct ReadySet {
    entries: HashMap<EntityId, ReadyMask>,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: EntityId, mask: ReadyMask) {
        if !mask.is_empty() {
            *self.entries.entry(entity).or_default() |= mask;
        }
    }

    pub fn get(&self, entity: EntityId) -> ReadyMask {
        self.entries.get(&entity).copied().unwrap_or_default()
    }

    pub fn is_ready(&self, entity: EntityId) -> bool {
        !self.get(entity).is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, ReadyMask)> + '_ {
        self.entries.iter().map(|(id, mask)| (*id, *mask))
    }
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("entity {entity} does not support {operation}")]
    Unsupported {
        entity: EntityId,
        operation: &'static str,
    },

    #[error("'{name}' is registered with type {expected}, not {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("goal {0} already exists")]
    GoalExists(GoalId),

    #[error("goal {0} is not tracked by the action server")]
    UnknownGoal(GoalId),

    #[error("invalid goal transition: {event:?} from {status}")]
    InvalidTransition { status: GoalStatus, event: GoalEvent },

    #[error("transport is shut down")]
    Shutdown,
}

/// Alias for transport results.
pub type TransportResult<T> = Result<T, TransportError>;

/// The middleware seam.
///
/// Every method except [`wait`](Transport::wait) is non-blocking. `take_*`
/// methods return `Ok(None)` when nothing is queued.
pub trait Transport: Send + Sync + 'static {
    /// Creates a manually triggered guard condition.
    fn create_guard(&self) -> TransportResult<EntityId>;

    /// Makes a guard ready until the next wait reports it.
    fn trigger_guard(&self, guard: EntityId) -> TransportResult<()>;

    fn create_publisher(
        &self,
        topic: &str,
        type_name: &str,
        qos: &QosProfile,
    ) -> TransportResult<EntityId>;

    fn create_subscription(
        &self,
        topic: &str,
        type_name: &str,
        qos: &QosProfile,
    ) -> TransportResult<EntityId>;

    fn create_service(
        &self,
        service: &str,
        type_name: &str,
        qos: &QosProfile,
    ) -> TransportResult<EntityId>;

    fn create_client(
        &self,
        service: &str,
        type_name: &str,
        qos: &QosProfile,
    ) -> TransportResult<EntityId>;

    /// Creates an action server. Terminal goals become eligible for
    /// [`expire_goals`](Transport::expire_goals) once `result_timeout` has
    /// elapsed; `None` keeps them forever.
    fn create_action_server(
        &self,
        action: &str,
        type_name: &str,
        qos: &ActionQos,
        result_timeout: Option<Duration>,
    ) -> TransportResult<EntityId>;

    fn create_action_client(
        &self,
        action: &str,
        type_name: &str,
        qos: &ActionQos,
    ) -> TransportResult<EntityId>;

    fn destroy(&self, entity: EntityId) -> TransportResult<()>;

    /// Blocks until at least one member is ready or `timeout` elapses
    /// (`None` waits forever). A timeout yields an empty set.
    fn wait(&self, members: &[EntityId], timeout: Option<Duration>) -> TransportResult<ReadySet>;

    fn publish(
        &self,
        entity: EntityId,
        channel: TopicChannel,
        payload: &[u8],
    ) -> TransportResult<()>;

    fn take_message(
        &self,
        entity: EntityId,
        channel: TopicChannel,
    ) -> TransportResult<Option<(MessageInfo, Vec<u8>)>>;

    fn send_request(
        &self,
        entity: EntityId,
        channel: ServiceChannel,
        sequence_number: SequenceNumber,
        payload: &[u8],
    ) -> TransportResult<()>;

    fn take_request(
        &self,
        entity: EntityId,
        channel: ServiceChannel,
    ) -> TransportResult<Option<(ServiceInfo, Vec<u8>)>>;

    fn send_response(
        &self,
        entity: EntityId,
        channel: ServiceChannel,
        request: &RequestId,
        payload: &[u8],
    ) -> TransportResult<()>;

    fn take_response(
        &self,
        entity: EntityId,
        channel: ServiceChannel,
    ) -> TransportResult<Option<(ServiceInfo, Vec<u8>)>>;

    /// Starts tracking a goal in state `Accepted`, stamping it with the
    /// acceptance time.
    fn accept_new_goal(&self, server: EntityId, goal_id: &GoalId) -> TransportResult<GoalInfo>;

    /// Applies `event` to a tracked goal and returns its new status.
    fn update_goal_state(
        &self,
        server: EntityId,
        goal_id: &GoalId,
        event: GoalEvent,
    ) -> TransportResult<GoalStatus>;

    /// Status of every tracked goal.
    fn goal_status_array(&self, server: EntityId) -> TransportResult<Vec<GoalStatusEntry>>;

    /// Resolves which tracked goals a cancel request targets. Does not
    /// change goal states.
    fn process_cancel_request(
        &self,
        server: EntityId,
        request: &CancelGoalRequest,
    ) -> TransportResult<CancelGoalResponse>;

    /// Stops tracking terminal goals whose retention window elapsed and
    /// returns their ids.
    fn expire_goals(&self, server: EntityId) -> TransportResult<Vec<GoalId>>;
}
