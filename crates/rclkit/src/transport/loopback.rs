// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport.
//!
//! All entities live in one table behind a mutex; every mutation wakes the
//! blocked [`Transport::wait`] callers through a condition variable. Topics,
//! services and actions are matched by name. Subscription and action topic
//! queues honor the keep-last depth of their QoS profile; request and
//! response queues are unbounded.

use super::{
    EntityId, MessageInfo, ReadyMask, ReadySet, RequestId, SequenceNumber, ServiceChannel,
    ServiceInfo, TopicChannel, Transport, TransportError, TransportResult,
};
use crate::action::{
    CancelGoalRequest, CancelGoalResponse, CancelReturnCode, GoalEvent, GoalId, GoalInfo,
    GoalStatus, GoalStatusEntry,
};
use crate::message::Time;
use crate::qos::{ActionQos, QosProfile};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

type Sample = (MessageInfo, Vec<u8>);
type Incoming = (ServiceInfo, Vec<u8>);

/// In-memory [`Transport`] connecting every entity created on it.
///
/// ```rust
/// use rclkit::transport::{LoopbackTransport, Transport};
/// use rclkit::qos::QosProfile;
///
/// let transport = LoopbackTransport::new();
/// let qos = QosProfile::default();
/// let publisher = transport.create_publisher("chatter", "String", &qos).unwrap();
/// let subscription = transport.create_subscription("chatter", "String", &qos).unwrap();
/// # let _ = (publisher, subscription);
/// ```
pub struct LoopbackTransport {
    state: Mutex<State>,
    changed: Condvar,
    next_id: AtomicU64,
}

#[derive(Default)]
struct State {
    shutdown: bool,
    entities: HashMap<EntityId, Entity>,
    type_names: HashMap<(NameKind, String), String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NameKind {
    Topic,
    Service,
    Action,
}

enum Entity {
    Guard {
        triggered: bool,
    },
    Publisher {
        topic: String,
    },
    Subscription {
        topic: String,
        queue: BoundedQueue<Sample>,
    },
    Service {
        name: String,
        requests: VecDeque<Incoming>,
    },
    Client {
        name: String,
        responses: VecDeque<Incoming>,
    },
    ActionServer(Box<ActionServerState>),
    ActionClient(Box<ActionClientState>),
}

struct ActionServerState {
    name: String,
    goal_requests: VecDeque<Incoming>,
    cancel_requests: VecDeque<Incoming>,
    result_requests: VecDeque<Incoming>,
    goals: HashMap<GoalId, GoalRecord>,
    result_timeout: Option<Duration>,
}

struct GoalRecord {
    info: GoalInfo,
    status: GoalStatus,
    terminal_since: Option<Instant>,
}

struct ActionClientState {
    name: String,
    goal_responses: VecDeque<Incoming>,
    cancel_responses: VecDeque<Incoming>,
    result_responses: VecDeque<Incoming>,
    feedback: BoundedQueue<Sample>,
    status: BoundedQueue<Sample>,
}

struct BoundedQueue<T> {
    items: VecDeque<T>,
    bound: Option<usize>,
}

impl<T> BoundedQueue<T> {
    fn new(qos: &QosProfile) -> Self {
        Self {
            items: VecDeque::new(),
            bound: qos.queue_bound(),
        }
    }

    fn push(&mut self, item: T) {
        if let Some(bound) = self.bound {
            while self.items.len() >= bound {
                self.items.pop_front();
            }
        }
        self.items.push_back(item);
    }
}

impl Entity {
    fn readiness(&self) -> ReadyMask {
        fn bit<T>(queue: &VecDeque<T>, mask: ReadyMask) -> ReadyMask {
            if queue.is_empty() {
                ReadyMask::NONE
            } else {
                mask
            }
        }
        match self {
            Entity::Guard { triggered } => {
                if *triggered {
                    ReadyMask::DATA
                } else {
                    ReadyMask::NONE
                }
            }
            Entity::Publisher { .. } => ReadyMask::NONE,
            Entity::Subscription { queue, .. } => bit(&queue.items, ReadyMask::DATA),
            Entity::Service { requests, .. } => bit(requests, ReadyMask::DATA),
            Entity::Client { responses, .. } => bit(responses, ReadyMask::DATA),
            Entity::ActionServer(s) => {
                bit(&s.goal_requests, ReadyMask::GOAL_REQUEST)
                    | bit(&s.cancel_requests, ReadyMask::CANCEL_REQUEST)
                    | bit(&s.result_requests, ReadyMask::RESULT_REQUEST)
            }
            Entity::ActionClient(c) => {
                bit(&c.goal_responses, ReadyMask::GOAL_RESPONSE)
                    | bit(&c.cancel_responses, ReadyMask::CANCEL_RESPONSE)
                    | bit(&c.result_responses, ReadyMask::RESULT_RESPONSE)
                    | bit(&c.feedback.items, ReadyMask::FEEDBACK)
                    | bit(&c.status.items, ReadyMask::STATUS)
            }
        }
    }

    /// Queue of incoming topic samples for `channel`.
    fn topic_queue(&mut self, channel: TopicChannel) -> Option<&mut BoundedQueue<Sample>> {
        match (self, channel) {
            (Entity::Subscription { queue, .. }, TopicChannel::Topic) => Some(queue),
            (Entity::ActionClient(c), TopicChannel::Feedback) => Some(&mut c.feedback),
            (Entity::ActionClient(c), TopicChannel::Status) => Some(&mut c.status),
            _ => None,
        }
    }

    /// Queue of incoming requests for `channel` (server side).
    fn request_queue(&mut self, channel: ServiceChannel) -> Option<&mut VecDeque<Incoming>> {
        match (self, channel) {
            (Entity::Service { requests, .. }, ServiceChannel::Service) => Some(requests),
            (Entity::ActionServer(s), ServiceChannel::SendGoal) => Some(&mut s.goal_requests),
            (Entity::ActionServer(s), ServiceChannel::CancelGoal) => Some(&mut s.cancel_requests),
            (Entity::ActionServer(s), ServiceChannel::GetResult) => Some(&mut s.result_requests),
            _ => None,
        }
    }

    /// Queue of incoming responses for `channel` (client side).
    fn response_queue(&mut self, channel: ServiceChannel) -> Option<&mut VecDeque<Incoming>> {
        match (self, channel) {
            (Entity::Client { responses, .. }, ServiceChannel::Service) => Some(responses),
            (Entity::ActionClient(c), ServiceChannel::SendGoal) => Some(&mut c.goal_responses),
            (Entity::ActionClient(c), ServiceChannel::CancelGoal) => Some(&mut c.cancel_responses),
            (Entity::ActionClient(c), ServiceChannel::GetResult) => Some(&mut c.result_responses),
            _ => None,
        }
    }

    /// Name this entity publishes to on `channel`.
    fn publish_route(&self, channel: TopicChannel) -> Option<&str> {
        match (self, channel) {
            (Entity::Publisher { topic }, TopicChannel::Topic) => Some(topic),
            (Entity::ActionServer(s), TopicChannel::Feedback | TopicChannel::Status) => {
                Some(&s.name)
            }
            _ => None,
        }
    }

    /// Name this entity listens to on `channel`.
    fn subscribe_route(&self, channel: TopicChannel) -> Option<&str> {
        match (self, channel) {
            (Entity::Subscription { topic, .. }, TopicChannel::Topic) => Some(topic),
            (Entity::ActionClient(c), TopicChannel::Feedback | TopicChannel::Status) => {
                Some(&c.name)
            }
            _ => None,
        }
    }

    /// Name this entity sends requests to on `channel`.
    fn client_route(&self, channel: ServiceChannel) -> Option<&str> {
        match (self, channel) {
            (Entity::Client { name, .. }, ServiceChannel::Service) => Some(name),
            (Entity::ActionClient(c), ch) if ch != ServiceChannel::Service => Some(&c.name),
            _ => None,
        }
    }

    /// Name this entity serves on `channel`.
    fn server_route(&self, channel: ServiceChannel) -> Option<&str> {
        match (self, channel) {
            (Entity::Service { name, .. }, ServiceChannel::Service) => Some(name),
            (Entity::ActionServer(s), ch) if ch != ServiceChannel::Service => Some(&s.name),
            _ => None,
        }
    }
}

impl State {
    fn entity(&self, id: EntityId) -> TransportResult<&Entity> {
        self.entities.get(&id).ok_or(TransportError::UnknownEntity(id))
    }

    fn entity_mut(&mut self, id: EntityId) -> TransportResult<&mut Entity> {
        self.entities
            .get_mut(&id)
            .ok_or(TransportError::UnknownEntity(id))
    }

    fn action_server(&mut self, id: EntityId) -> TransportResult<&mut ActionServerState> {
        match self.entity_mut(id)? {
            Entity::ActionServer(s) => Ok(s),
            _ => Err(TransportError::Unsupported {
                entity: id,
                operation: "goal bookkeeping",
            }),
        }
    }

    fn register_name(&mut self, kind: NameKind, name: &str, type_name: &str) -> TransportResult<()> {
        let key = (kind, name.to_string());
        match self.type_names.get(&key) {
            Some(expected) if expected != type_name => Err(TransportError::TypeMismatch {
                name: name.to_string(),
                expected: expected.clone(),
                actual: type_name.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.type_names.insert(key, type_name.to_string());
                Ok(())
            }
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fails every blocked and future wait with [`TransportError::Shutdown`].
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.changed.notify_all();
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.state.lock().entities.len()
    }

    fn insert(&self, entity: Entity) -> TransportResult<EntityId> {
        let id = EntityId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(TransportError::Shutdown);
        }
        state.entities.insert(id, entity);
        Ok(id)
    }

    fn insert_named(
        &self,
        kind: NameKind,
        name: &str,
        type_name: &str,
        entity: Entity,
    ) -> TransportResult<EntityId> {
        self.state.lock().register_name(kind, name, type_name)?;
        self.insert(entity)
    }

    /// Runs `f` under the state lock and wakes every waiter afterwards.
    fn mutate<T>(&self, f: impl FnOnce(&mut State) -> TransportResult<T>) -> TransportResult<T> {
        let result = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(TransportError::Shutdown);
            }
            f(&mut state)
        };
        self.changed.notify_all();
        result
    }
}

impl Transport for LoopbackTransport {
    fn create_guard(&self) -> TransportResult<EntityId> {
        self.insert(Entity::Guard { triggered: false })
    }

    fn trigger_guard(&self, guard: EntityId) -> TransportResult<()> {
        self.mutate(|state| match state.entity_mut(guard)? {
            Entity::Guard { triggered } => {
                *triggered = true;
                Ok(())
            }
            _ => Err(TransportError::Unsupported {
                entity: guard,
                operation: "trigger",
            }),
        })
    }

    fn create_publisher(
        &self,
        topic: &str,
        type_name: &str,
        _qos: &QosProfile,
    ) -> TransportResult<EntityId> {
        self.insert_named(
            NameKind::Topic,
            topic,
            type_name,
            Entity::Publisher {
                topic: topic.to_string(),
            },
        )
    }

    fn create_subscription(
        &self,
        topic: &str,
        type_name: &str,
        qos: &QosProfile,
    ) -> TransportResult<EntityId> {
        self.insert_named(
            NameKind::Topic,
            topic,
            type_name,
            Entity::Subscription {
                topic: topic.to_string(),
                queue: BoundedQueue::new(qos),
            },
        )
    }

    fn create_service(
        &self,
        service: &str,
        type_name: &str,
        _qos: &QosProfile,
    ) -> TransportResult<EntityId> {
        self.insert_named(
            NameKind::Service,
            service,
            type_name,
            Entity::Service {
                name: service.to_string(),
                requests: VecDeque::new(),
            },
        )
    }

    fn create_client(
        &self,
        service: &str,
        type_name: &str,
        _qos: &QosProfile,
    ) -> TransportResult<EntityId> {
        self.insert_named(
            NameKind::Service,
            service,
            type_name,
            Entity::Client {
                name: service.to_string(),
                responses: VecDeque::new(),
            },
        )
    }

    fn create_action_server(
        &self,
        action: &str,
        type_name: &str,
        _qos: &ActionQos,
        result_timeout: Option<Duration>,
    ) -> TransportResult<EntityId> {
        self.insert_named(
            NameKind::Action,
            action,
            type_name,
            Entity::ActionServer(Box::new(ActionServerState {
                name: action.to_string(),
                goal_requests: VecDeque::new(),
                cancel_requests: VecDeque::new(),
                result_requests: VecDeque::new(),
                goals: HashMap::new(),
                result_timeout,
            })),
        )
    }

    fn create_action_client(
        &self,
        action: &str,
        type_name: &str,
        qos: &ActionQos,
    ) -> TransportResult<EntityId> {
        self.insert_named(
            NameKind::Action,
            action,
            type_name,
            Entity::ActionClient(Box::new(ActionClientState {
                name: action.to_string(),
                goal_responses: VecDeque::new(),
                cancel_responses: VecDeque::new(),
                result_responses: VecDeque::new(),
                feedback: BoundedQueue::new(&qos.feedback_topic),
                status: BoundedQueue::new(&qos.status_topic),
            })),
        )
    }

    fn destroy(&self, entity: EntityId) -> TransportResult<()> {
        self.mutate(|state| {
            state
                .entities
                .remove(&entity)
                .map(|_| ())
                .ok_or(TransportError::UnknownEntity(entity))
        })
    }

    fn wait(&self, members: &[EntityId], timeout: Option<Duration>) -> TransportResult<ReadySet> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Err(TransportError::Shutdown);
            }

            // Destroyed members are simply never ready.
            let mut ready = ReadySet::new();
            for id in members {
                if let Some(entity) = state.entities.get(id) {
                    ready.insert(*id, entity.readiness());
                }
            }

            if !ready.is_empty() {
                for (id, _) in ready.iter() {
                    if let Some(Entity::Guard { triggered }) = state.entities.get_mut(&id) {
                        *triggered = false;
                    }
                }
                return Ok(ready);
            }

            match deadline {
                None => self.changed.wait(&mut state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(ready);
                    }
                    let _ = self.changed.wait_for(&mut state, deadline - now);
                }
            }
        }
    }

    fn publish(
        &self,
        entity: EntityId,
        channel: TopicChannel,
        payload: &[u8],
    ) -> TransportResult<()> {
        self.mutate(|state| {
            let route = state
                .entity(entity)?
                .publish_route(channel)
                .ok_or(TransportError::Unsupported {
                    entity,
                    operation: "publish",
                })?
                .to_string();
            let now = SystemTime::now();
            let info = MessageInfo {
                source_timestamp: now,
                received_timestamp: now,
                publisher: entity,
            };
            for target in state.entities.values_mut() {
                if target.subscribe_route(channel) != Some(route.as_str()) {
                    continue;
                }
                if let Some(queue) = target.topic_queue(channel) {
                    queue.push((info, payload.to_vec()));
                }
            }
            Ok(())
        })
    }

    fn take_message(
        &self,
        entity: EntityId,
        channel: TopicChannel,
    ) -> TransportResult<Option<(MessageInfo, Vec<u8>)>> {
        let mut state = self.state.lock();
        let queue = state
            .entity_mut(entity)?
            .topic_queue(channel)
            .ok_or(TransportError::Unsupported {
                entity,
                operation: "take message",
            })?;
        Ok(queue.items.pop_front())
    }

    fn send_request(
        &self,
        entity: EntityId,
        channel: ServiceChannel,
        sequence_number: SequenceNumber,
        payload: &[u8],
    ) -> TransportResult<()> {
        self.mutate(|state| {
            let route = state
                .entity(entity)?
                .client_route(channel)
                .ok_or(TransportError::Unsupported {
                    entity,
                    operation: "send request",
                })?
                .to_string();
            let now = SystemTime::now();
            let info = ServiceInfo {
                source_timestamp: now,
                received_timestamp: now,
                request_id: RequestId {
                    client: entity,
                    sequence_number,
                },
            };
            // A request nobody serves is lost, like on a real middleware.
            for target in state.entities.values_mut() {
                if target.server_route(channel) != Some(route.as_str()) {
                    continue;
                }
                if let Some(queue) = target.request_queue(channel) {
                    queue.push_back((info, payload.to_vec()));
                }
            }
            Ok(())
        })
    }

    fn take_request(
        &self,
        entity: EntityId,
        channel: ServiceChannel,
    ) -> TransportResult<Option<(ServiceInfo, Vec<u8>)>> {
        let mut state = self.state.lock();
        let queue = state
            .entity_mut(entity)?
            .request_queue(channel)
            .ok_or(TransportError::Unsupported {
                entity,
                operation: "take request",
            })?;
        Ok(queue.pop_front())
    }

    fn send_response(
        &self,
        entity: EntityId,
        channel: ServiceChannel,
        request: &RequestId,
        payload: &[u8],
    ) -> TransportResult<()> {
        self.mutate(|state| {
            if state.entity(entity)?.server_route(channel).is_none() {
                return Err(TransportError::Unsupported {
                    entity,
                    operation: "send response",
                });
            }
            let now = SystemTime::now();
            let info = ServiceInfo {
                source_timestamp: now,
                received_timestamp: now,
                request_id: *request,
            };
            // The requester may be gone already; the response is dropped then.
            if let Some(queue) = state
                .entities
                .get_mut(&request.client)
                .and_then(|client| client.response_queue(channel))
            {
                queue.push_back((info, payload.to_vec()));
            }
            Ok(())
        })
    }

    fn take_response(
        &self,
        entity: EntityId,
        channel: ServiceChannel,
    ) -> TransportResult<Option<(ServiceInfo, Vec<u8>)>> {
        let mut state = self.state.lock();
        let queue = state
            .entity_mut(entity)?
            .response_queue(channel)
            .ok_or(TransportError::Unsupported {
                entity,
                operation: "take response",
            })?;
        Ok(queue.pop_front())
    }

    fn accept_new_goal(&self, server: EntityId, goal_id: &GoalId) -> TransportResult<GoalInfo> {
        let mut state = self.state.lock();
        let server = state.action_server(server)?;
        if server.goals.contains_key(goal_id) {
            return Err(TransportError::GoalExists(*goal_id));
        }
        let info = GoalInfo::new(*goal_id, Time::now());
        server.goals.insert(
            *goal_id,
            GoalRecord {
                info,
                status: GoalStatus::Accepted,
                terminal_since: None,
            },
        );
        Ok(info)
    }

    fn update_goal_state(
        &self,
        server: EntityId,
        goal_id: &GoalId,
        event: GoalEvent,
    ) -> TransportResult<GoalStatus> {
        let mut state = self.state.lock();
        let record = state
            .action_server(server)?
            .goals
            .get_mut(goal_id)
            .ok_or(TransportError::UnknownGoal(*goal_id))?;
        let next = record
            .status
            .transition(event)
            .ok_or(TransportError::InvalidTransition {
                status: record.status,
                event,
            })?;
        record.status = next;
        if next.is_terminal() {
            record.terminal_since = Some(Instant::now());
        }
        Ok(next)
    }

    fn goal_status_array(&self, server: EntityId) -> TransportResult<Vec<GoalStatusEntry>> {
        let mut state = self.state.lock();
        let server = state.action_server(server)?;
        let mut entries: Vec<GoalStatusEntry> = server
            .goals
            .values()
            .map(|record| GoalStatusEntry {
                goal_info: record.info,
                status: record.status,
            })
            .collect();
        entries.sort_by_key(|entry| (entry.goal_info.stamp, entry.goal_info.goal_id));
        Ok(entries)
    }

    fn process_cancel_request(
        &self,
        server: EntityId,
        request: &CancelGoalRequest,
    ) -> TransportResult<CancelGoalResponse> {
        let mut state = self.state.lock();
        let server = state.action_server(server)?;
        let GoalInfo {
            goal_id: wanted,
            stamp,
        } = request.goal_info;

        let mut failure = None;
        let mut canceling = Vec::new();
        if !wanted.is_zero() {
            match server.goals.get(&wanted) {
                None => failure = Some(CancelReturnCode::UnknownGoalId),
                Some(record) if record.status.is_terminal() => {
                    failure = Some(CancelReturnCode::GoalTerminated)
                }
                Some(record) => canceling.push(record.info),
            }
        }
        if wanted.is_zero() || !stamp.is_zero() {
            canceling.extend(
                server
                    .goals
                    .values()
                    .filter(|r| !r.status.is_terminal() && r.info.goal_id != wanted)
                    .filter(|r| stamp.is_zero() || r.info.stamp <= stamp)
                    .map(|r| r.info),
            );
        }
        canceling.sort_by_key(|info| (info.stamp, info.goal_id));

        let return_code = if canceling.is_empty() {
            failure.unwrap_or(CancelReturnCode::Rejected)
        } else {
            CancelReturnCode::None
        };
        Ok(CancelGoalResponse {
            return_code,
            goals_canceling: canceling,
        })
    }

    fn expire_goals(&self, server: EntityId) -> TransportResult<Vec<GoalId>> {
        let mut state = self.state.lock();
        let server = state.action_server(server)?;
        let Some(timeout) = server.result_timeout else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let expired: Vec<GoalId> = server
            .goals
            .values()
            .filter(|r| {
                r.terminal_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= timeout)
            })
            .map(|r| r.info.goal_id)
            .collect();
        for id in &expired {
            server.goals.remove(id);
        }
        Ok(expired)
    }
}
