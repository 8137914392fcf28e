// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Action server: goal registry, execution and result retention.

use super::msg::{
    CancelGoalRequest, CancelGoalResponse, CancelReturnCode, FeedbackMessage, GetResultRequest,
    GetResultResponse, GoalId, GoalStatusArray, SendGoalRequest, SendGoalResponse,
};
use super::{panic_message, Action, ExecuteGoal, GoalEvent, GoalStatus};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::message::{decode, encode, Time};
use crate::qos::ActionQos;
use crate::transport::{EntityId, ReadyMask, RequestId, ServiceChannel, TopicChannel, Transport};
use crate::waitable::{EntityHandle, Reservation, Waitable, WaitableKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Action server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionServerOptions {
    pub qos: ActionQos,
    /// How long finished goals keep their result; `None` keeps them until
    /// the server is closed.
    pub result_timeout: Option<Duration>,
}

impl Default for ActionServerOptions {
    fn default() -> Self {
        Self {
            qos: ActionQos::default(),
            result_timeout: Some(Duration::from_secs(
                crate::config::DEFAULT_RESULT_TIMEOUT_SECS as u64,
            )),
        }
    }
}

impl ActionServerOptions {
    /// Default QoS with the configured result retention.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            qos: ActionQos::default(),
            result_timeout: config.result_timeout(),
        }
    }
}

/// Serves goals of action `A`.
///
/// Every goal request is handed to the [`ExecuteGoal`] implementation on
/// its own task. Accepted goals stay in the registry until their result
/// retention elapses or the server is closed.
pub struct ActionServer<A: Action> {
    inner: Arc<ServerInner<A>>,
}

impl<A: Action> Clone for ActionServer<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServerInner<A: Action> {
    handle: EntityHandle,
    name: String,
    span: tracing::Span,
    executor: Arc<dyn ExecuteGoal<A>>,
    goals: DashMap<GoalId, Arc<GoalHandle<A>>>,
    result_timeout: Option<Duration>,
    shutdown: CancellationToken,
    /// Serializes goal state updates with the status broadcast.
    status_lock: Mutex<()>,
}

impl<A: Action> ActionServer<A> {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        id: EntityId,
        name: &str,
        span: tracing::Span,
        executor: Arc<dyn ExecuteGoal<A>>,
        result_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                handle: EntityHandle::new(transport, id, "action server"),
                name: name.to_string(),
                span,
                executor,
                goals: DashMap::new(),
                result_timeout,
                shutdown: CancellationToken::new(),
                status_lock: Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of goals in the registry.
    pub fn goal_count(&self) -> usize {
        self.inner.goals.len()
    }

    /// Status of a registered goal, `None` if it is not (or no longer)
    /// registered.
    pub fn goal_status(&self, goal_id: &GoalId) -> Option<GoalStatus> {
        self.inner.goals.get(goal_id).map(|goal| goal.status())
    }

    /// Cancels every in-flight goal and retention timer and destroys the
    /// server.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub(crate) fn as_waitable(&self) -> Arc<dyn Waitable> {
        self.inner.clone()
    }
}

impl<A: Action> ServerInner<A> {
    fn transport(&self) -> &Arc<dyn Transport> {
        self.handle.transport()
    }

    fn id(&self) -> EntityId {
        self.handle.id()
    }

    fn send_response<T: Serialize>(
        &self,
        channel: ServiceChannel,
        request_id: &RequestId,
        response: &T,
    ) -> Result<()> {
        let payload = encode(response)?;
        self.transport()
            .send_response(self.id(), channel, request_id, &payload)?;
        Ok(())
    }

    fn reply_to_goal(&self, request_id: &RequestId, accepted: bool, stamp: Time) {
        let response = SendGoalResponse { accepted, stamp };
        if let Err(err) = self.send_response(ServiceChannel::SendGoal, request_id, &response) {
            tracing::warn!(%err, accepted, "failed to send goal response");
        }
    }

    /// Broadcasts the status of every tracked goal. Callers hold
    /// `status_lock`.
    fn publish_status(&self) {
        let published = self
            .transport()
            .goal_status_array(self.id())
            .map_err(Error::from)
            .and_then(|status_list| encode(&GoalStatusArray { status_list }))
            .and_then(|payload| {
                self.transport()
                    .publish(self.id(), TopicChannel::Status, &payload)
                    .map_err(Error::from)
            });
        if let Err(err) = published {
            tracing::warn!(%err, "failed to publish goal status");
        }
    }

    /// Applies `event` to `goal` and broadcasts the new status.
    fn update_goal(&self, goal: &GoalHandle<A>, event: GoalEvent) -> Result<GoalStatus> {
        let _status = self.status_lock.lock();
        self.apply(goal, event)
    }

    /// Like [`update_goal`](Self::update_goal), but skips events the goal's
    /// current status does not allow.
    fn try_update_goal(&self, goal: &GoalHandle<A>, event: GoalEvent) -> Result<Option<GoalStatus>> {
        let _status = self.status_lock.lock();
        if goal.status().transition(event).is_none() {
            return Ok(None);
        }
        self.apply(goal, event).map(Some)
    }

    fn apply(&self, goal: &GoalHandle<A>, event: GoalEvent) -> Result<GoalStatus> {
        let status = self
            .transport()
            .update_goal_state(self.id(), &goal.id, event)?;
        goal.status.send_replace(status);
        tracing::debug!(goal_id = %goal.id, ?event, %status, "goal updated");
        self.publish_status();
        Ok(status)
    }

    /// First acceptance of `goal`: registry insertion, transport
    /// bookkeeping, accept response and the move to executing. `stamp` is
    /// set as soon as the accept response is out.
    fn accept_goal(&self, goal: &Arc<GoalHandle<A>>, stamp: &mut Option<Time>) -> Result<()> {
        match self.goals.entry(goal.id) {
            Entry::Occupied(_) => return Err(Error::DuplicateGoal(goal.id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(goal));
            }
        }

        let _status = self.status_lock.lock();
        let info = match self.transport().accept_new_goal(self.id(), &goal.id) {
            Ok(info) => info,
            Err(err) => {
                self.goals.remove(&goal.id);
                return Err(err.into());
            }
        };
        goal.status.send_replace(GoalStatus::Accepted);
        tracing::debug!(goal_id = %goal.id, stamp = %info.stamp, "goal accepted");
        self.publish_status();
        self.reply_to_goal(&goal.request_id, true, info.stamp);
        *stamp = Some(info.stamp);
        self.apply(goal, GoalEvent::Execute)?;
        Ok(())
    }

    fn handle_goal_request(self: &Arc<Self>, run: &CancellationToken) -> Result<()> {
        let Some((info, payload)) = self
            .transport()
            .take_request(self.id(), ServiceChannel::SendGoal)?
        else {
            return Ok(());
        };
        let request: SendGoalRequest<A::Goal> = match decode(&payload) {
            Ok(request) => request,
            Err(err) => {
                self.reply_to_goal(&info.request_id, false, Time::now());
                return Err(err);
            }
        };

        tracing::debug!(goal_id = %request.goal_id, "goal request received");
        let goal = Arc::new(GoalHandle {
            id: request.goal_id,
            goal: request.goal,
            request_id: info.request_id,
            server: Arc::downgrade(self),
            cancel: run.child_token(),
            stamp: Mutex::new(None),
            result: Mutex::new(None),
            status: watch::channel(GoalStatus::Unknown).0,
        });
        let server = Arc::clone(self);
        tokio::spawn(server.execute(goal).instrument(self.span.clone()));
        Ok(())
    }

    async fn execute(self: Arc<Self>, goal: Arc<GoalHandle<A>>) {
        // The goal token is a child of the run token; server shutdown
        // reaches it through this watcher.
        let cancel = goal.cancel.clone();
        let watcher = {
            let cancel = cancel.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            })
        };
        let outcome = AssertUnwindSafe(self.executor.execute_goal(cancel.clone(), Arc::clone(&goal)))
            .catch_unwind()
            .await;
        watcher.abort();

        if goal.stamp.lock().is_none() {
            if let Ok(Err(err)) = &outcome {
                tracing::debug!(goal_id = %goal.id, %err, "goal rejected");
            } else {
                tracing::debug!(goal_id = %goal.id, "goal rejected");
            }
            self.reply_to_goal(&goal.request_id, false, Time::now());
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        let result = match outcome {
            Ok(Ok(result)) => Some(result),
            Ok(Err(err)) => {
                tracing::warn!(goal_id = %goal.id, %err, "goal execution failed");
                None
            }
            Err(panic) => {
                tracing::error!(
                    goal_id = %goal.id,
                    panic = panic_message(panic.as_ref()),
                    "goal executor panicked"
                );
                None
            }
        };

        // A goal whose move to executing failed during accept gets another
        // try, so it can still reach a terminal state.
        if let Err(err) = self.try_update_goal(&goal, GoalEvent::Execute) {
            tracing::warn!(goal_id = %goal.id, %err, "failed to start goal execution");
        }
        let finished = if cancel.is_cancelled() {
            self.finish_canceled(&goal)
        } else if let Some(result) = result {
            *goal.result.lock() = Some(result);
            self.update_goal(&goal, GoalEvent::Succeed).map(drop)
        } else {
            self.update_goal(&goal, GoalEvent::Abort).map(drop)
        };
        if let Err(err) = finished {
            tracing::warn!(goal_id = %goal.id, %err, "failed to finish goal");
        }
        self.schedule_expiry();
    }

    fn finish_canceled(&self, goal: &GoalHandle<A>) -> Result<()> {
        self.try_update_goal(goal, GoalEvent::CancelGoal)?;
        self.try_update_goal(goal, GoalEvent::Canceled)?;
        Ok(())
    }

    fn handle_cancel_request(self: &Arc<Self>) -> Result<()> {
        let Some((info, payload)) = self
            .transport()
            .take_request(self.id(), ServiceChannel::CancelGoal)?
        else {
            return Ok(());
        };
        let request: CancelGoalRequest = decode(&payload)?;
        let server = Arc::clone(self);
        tokio::spawn(
            async move { server.process_cancel(&info.request_id, &request) }
                .instrument(self.span.clone()),
        );
        Ok(())
    }

    fn process_cancel(&self, request_id: &RequestId, request: &CancelGoalRequest) {
        let response = match self.transport().process_cancel_request(self.id(), request) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(%err, "failed to process cancel request");
                CancelGoalResponse {
                    return_code: CancelReturnCode::Rejected,
                    goals_canceling: Vec::new(),
                }
            }
        };
        for info in &response.goals_canceling {
            let Some(goal) = self.goals.get(&info.goal_id).map(|g| Arc::clone(g.value())) else {
                continue;
            };
            goal.cancel.cancel();
            if let Err(err) = self.try_update_goal(&goal, GoalEvent::CancelGoal) {
                tracing::warn!(goal_id = %goal.id, %err, "failed to mark goal canceling");
            }
        }
        tracing::debug!(
            code = ?response.return_code,
            canceling = response.goals_canceling.len(),
            "cancel request processed"
        );
        if let Err(err) = self.send_response(ServiceChannel::CancelGoal, request_id, &response) {
            tracing::warn!(%err, "failed to send cancel response");
        }
    }

    fn handle_result_request(self: &Arc<Self>) -> Result<()> {
        let Some((info, payload)) = self
            .transport()
            .take_request(self.id(), ServiceChannel::GetResult)?
        else {
            return Ok(());
        };
        let request: GetResultRequest = decode(&payload)?;
        let server = Arc::clone(self);
        tokio::spawn(
            server
                .serve_result(info.request_id, request.goal_id)
                .instrument(self.span.clone()),
        );
        Ok(())
    }

    async fn serve_result(self: Arc<Self>, request_id: RequestId, goal_id: GoalId) {
        let goal = self.goals.get(&goal_id).map(|g| Arc::clone(g.value()));
        let response = match goal {
            None => GetResultResponse {
                status: GoalStatus::Unknown,
                result: None,
            },
            Some(goal) => {
                let status = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    status = goal.terminal_status() => status,
                };
                GetResultResponse {
                    status,
                    result: goal.result.lock().clone(),
                }
            }
        };
        tracing::debug!(%goal_id, status = %response.status, "sending goal result");
        if let Err(err) = self.send_response(ServiceChannel::GetResult, &request_id, &response) {
            tracing::warn!(%goal_id, %err, "failed to send goal result");
        }
        self.expire_goals();
    }

    /// Arms a retention timer for the goal that just finished.
    fn schedule_expiry(self: &Arc<Self>) {
        let Some(timeout) = self.result_timeout else {
            return;
        };
        let server = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        if let Some(server) = server.upgrade() {
                            server.expire_goals();
                        }
                    }
                }
            }
            .instrument(self.span.clone()),
        );
    }

    fn expire_goals(&self) {
        if self.handle.is_closed() {
            return;
        }
        match self.transport().expire_goals(self.id()) {
            Ok(expired) if expired.is_empty() => {}
            Ok(expired) => {
                for goal_id in &expired {
                    self.goals.remove(goal_id);
                }
                tracing::debug!(count = expired.len(), "expired finished goals");
                let _status = self.status_lock.lock();
                self.publish_status();
            }
            Err(err) => tracing::warn!(%err, "failed to expire goals"),
        }
    }

    fn publish_feedback(&self, goal_id: GoalId, feedback: &A::Feedback) -> Result<()> {
        self.handle.ensure_open()?;
        let payload = encode(&FeedbackMessage { goal_id, feedback })?;
        self.transport()
            .publish(self.id(), TopicChannel::Feedback, &payload)?;
        Ok(())
    }
}

impl<A: Action> Waitable for ServerInner<A> {
    fn kind(&self) -> WaitableKind {
        WaitableKind::ActionServer
    }

    fn entity_id(&self) -> Option<EntityId> {
        Some(self.handle.id())
    }

    fn reservation(&self) -> &Reservation {
        self.handle.reservation()
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    fn close(&self) -> Result<()> {
        self.handle.ensure_open()?;
        self.shutdown.cancel();
        self.goals.clear();
        tracing::debug!(parent: &self.span, action = %self.name, "action server closed");
        self.handle.close()
    }

    fn on_ready(self: Arc<Self>, ready: ReadyMask, cancel: &CancellationToken) {
        let _entered = self.span.enter();
        if ready.contains(ReadyMask::GOAL_REQUEST) {
            if let Err(err) = self.handle_goal_request(cancel) {
                tracing::warn!(action = %self.name, %err, "failed to handle goal request");
            }
        }
        if ready.contains(ReadyMask::CANCEL_REQUEST) {
            if let Err(err) = self.handle_cancel_request() {
                tracing::warn!(action = %self.name, %err, "failed to handle cancel request");
            }
        }
        if ready.contains(ReadyMask::RESULT_REQUEST) {
            if let Err(err) = self.handle_result_request() {
                tracing::warn!(action = %self.name, %err, "failed to handle result request");
            }
        }
    }
}

impl<A: Action> Drop for ServerInner<A> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One goal as seen by its executor.
pub struct GoalHandle<A: Action> {
    id: GoalId,
    goal: A::Goal,
    request_id: RequestId,
    server: Weak<ServerInner<A>>,
    cancel: CancellationToken,
    /// Acceptance stamp, set once the first `accept` has sent the accept
    /// response.
    stamp: Mutex<Option<Time>>,
    result: Mutex<Option<A::Result>>,
    status: watch::Sender<GoalStatus>,
}

impl<A: Action> GoalHandle<A> {
    pub fn id(&self) -> GoalId {
        self.id
    }

    /// The goal description sent by the client.
    pub fn goal(&self) -> &A::Goal {
        &self.goal
    }

    pub fn status(&self) -> GoalStatus {
        *self.status.borrow()
    }

    /// Acceptance time, `None` before [`accept`](GoalHandle::accept).
    pub fn stamp(&self) -> Option<Time> {
        *self.stamp.lock()
    }

    /// Whether a cancel request, the end of the wait set run or server
    /// shutdown targeted this goal.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Accepts the goal and starts executing it.
    ///
    /// Only the first successful call has side effects; later calls return
    /// another sender for the same goal. Fails with
    /// [`Error::DuplicateGoal`] when the server already tracks this id.
    pub fn accept(self: &Arc<Self>) -> Result<FeedbackSender<A>> {
        let mut stamp = self.stamp.lock();
        if stamp.is_none() {
            let server = self.server.upgrade().ok_or(Error::Closed)?;
            server.accept_goal(self, &mut stamp)?;
        }
        Ok(FeedbackSender {
            goal: Arc::clone(self),
        })
    }

    async fn terminal_status(&self) -> GoalStatus {
        let mut rx = self.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return status;
            }
        }
    }
}

/// Publishes feedback for one accepted goal.
pub struct FeedbackSender<A: Action> {
    goal: Arc<GoalHandle<A>>,
}

impl<A: Action> Clone for FeedbackSender<A> {
    fn clone(&self) -> Self {
        Self {
            goal: Arc::clone(&self.goal),
        }
    }
}

impl<A: Action> FeedbackSender<A> {
    pub fn goal_id(&self) -> GoalId {
        self.goal.id
    }

    /// Publishes `feedback`. Failures are logged and returned; the goal's
    /// state is not affected.
    pub fn send(&self, feedback: &A::Feedback) -> Result<()> {
        let published = self
            .goal
            .server
            .upgrade()
            .ok_or(Error::Closed)
            .and_then(|server| server.publish_feedback(self.goal.id, feedback));
        if let Err(err) = &published {
            tracing::warn!(goal_id = %self.goal.id, %err, "failed to send feedback");
        }
        published
    }
}
