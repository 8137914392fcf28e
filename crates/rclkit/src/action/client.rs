// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Action client: goal, cancel and result requests plus feedback and
//! status fan-out.

use super::msg::{
    CancelGoalRequest, CancelGoalResponse, FeedbackMessage, GetResultRequest, GetResultResponse,
    GoalId, GoalStatusArray, GoalStatusEntry, SendGoalRequest, SendGoalResponse,
};
use super::{panic_message, Action, GoalStatus};
use crate::correlator::{RequestCorrelator, TransportChannel};
use crate::error::{Error, Result};
use crate::message::{decode, encode};
use crate::qos::ActionQos;
use crate::transport::{EntityId, ReadyMask, ServiceChannel, TopicChannel, Transport};
use crate::waitable::{EntityHandle, Reservation, Waitable, WaitableKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Completes once a feedback or status watch stops, with
/// [`Error::Canceled`] when its token fired or [`Error::Closed`] when the
/// client was closed.
pub type GoalWatch = oneshot::Receiver<Result<()>>;

/// Action client settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionClientOptions {
    pub qos: ActionQos,
}

/// Calls action `A` on a remote server.
///
/// Requests are correlated per channel; feedback and status messages are
/// handed to every matching watcher on its own task.
///
/// ```rust,no_run
/// # use rclkit::action::{Action, ActionClient};
/// # async fn example<A: Action>(client: ActionClient<A>, goal: A::Goal) -> rclkit::Result<()> {
/// use tokio_util::sync::CancellationToken;
///
/// let cancel = CancellationToken::new();
/// let _sequence = client
///     .watch_goal(&cancel, &goal, |feedback| println!("{:?}", feedback.feedback))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ActionClient<A: Action> {
    inner: Arc<ClientInner<A>>,
}

impl<A: Action> Clone for ActionClient<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<A: Action> {
    handle: EntityHandle,
    name: String,
    span: tracing::Span,
    goal: RequestCorrelator<TransportChannel>,
    cancel: RequestCorrelator<TransportChannel>,
    result: RequestCorrelator<TransportChannel>,
    feedback: Arc<HandlerRegistry<FeedbackMessage<A::Feedback>>>,
    status: Arc<HandlerRegistry<GoalStatusEntry>>,
    shutdown: CancellationToken,
}

impl<A: Action> ActionClient<A> {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        id: EntityId,
        name: &str,
        span: tracing::Span,
    ) -> Self {
        let channel =
            |channel| TransportChannel::new(Arc::clone(&transport), id, channel);
        let goal = RequestCorrelator::new(channel(ServiceChannel::SendGoal), "goal");
        let cancel = RequestCorrelator::new(channel(ServiceChannel::CancelGoal), "cancel");
        let result = RequestCorrelator::new(channel(ServiceChannel::GetResult), "result");
        Self {
            inner: Arc::new(ClientInner {
                handle: EntityHandle::new(transport, id, "action client"),
                name: name.to_string(),
                span,
                goal,
                cancel,
                result,
                feedback: Arc::new(HandlerRegistry::new("feedback")),
                status: Arc::new(HandlerRegistry::new("status")),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Sends `goal` under a fresh id and waits for the server's answer.
    pub async fn send_goal(
        &self,
        cancel: &CancellationToken,
        goal: &A::Goal,
    ) -> Result<(SendGoalResponse, GoalId)> {
        let goal_id = GoalId::new();
        let response = self
            .inner
            .request(&self.inner.goal, cancel, &SendGoalRequest { goal_id, goal })
            .await?;
        Ok((response, goal_id))
    }

    /// Sends a goal request with a caller-chosen id.
    pub async fn send_goal_request(
        &self,
        cancel: &CancellationToken,
        request: &SendGoalRequest<A::Goal>,
    ) -> Result<SendGoalResponse> {
        self.inner.request(&self.inner.goal, cancel, request).await
    }

    /// Waits until the goal is finished and returns its status and result.
    /// Unknown or expired goals report [`GoalStatus::Unknown`].
    pub async fn get_result(
        &self,
        cancel: &CancellationToken,
        goal_id: GoalId,
    ) -> Result<GetResultResponse<A::Result>> {
        self.inner
            .request(&self.inner.result, cancel, &GetResultRequest { goal_id })
            .await
    }

    pub async fn cancel_goal(
        &self,
        cancel: &CancellationToken,
        request: &CancelGoalRequest,
    ) -> Result<CancelGoalResponse> {
        self.inner.request(&self.inner.cancel, cancel, request).await
    }

    /// Sends `goal`, streams its feedback to `on_feedback` and returns the
    /// result once it succeeded.
    ///
    /// Fails with [`Error::GoalRejected`] when the server rejects the goal
    /// and [`Error::GoalNotSucceeded`] when it ends canceled or aborted.
    pub async fn watch_goal(
        &self,
        cancel: &CancellationToken,
        goal: &A::Goal,
        on_feedback: impl Fn(FeedbackMessage<A::Feedback>) + Send + Sync + 'static,
    ) -> Result<A::Result> {
        let goal_id = GoalId::new();
        let watching = cancel.child_token();
        let _stop_watching = watching.clone().drop_guard();
        // Registered before the goal is sent so no feedback is missed.
        let _watch = self.watch_feedback(&watching, Some(goal_id), on_feedback);

        let response: SendGoalResponse = self
            .inner
            .request(&self.inner.goal, cancel, &SendGoalRequest { goal_id, goal })
            .await?;
        if !response.accepted {
            return Err(Error::GoalRejected);
        }
        tracing::debug!(parent: &self.inner.span, %goal_id, "goal accepted, waiting for result");

        let response = self.get_result(cancel, goal_id).await?;
        match (response.status, response.result) {
            (GoalStatus::Succeeded, Some(result)) => Ok(result),
            (status, _) => Err(Error::GoalNotSucceeded(status)),
        }
    }

    /// Calls `handler` with feedback of `goal_id`, or of every goal when
    /// `None`, until `cancel` fires. Must be called within a tokio runtime.
    pub fn watch_feedback(
        &self,
        cancel: &CancellationToken,
        goal_id: Option<GoalId>,
        handler: impl Fn(FeedbackMessage<A::Feedback>) + Send + Sync + 'static,
    ) -> GoalWatch {
        self.inner
            .feedback
            .watch(cancel, &self.inner.shutdown, goal_id, Arc::new(handler))
    }

    /// Calls `handler` with status updates of `goal_id`, or of every goal
    /// when `None`, until `cancel` fires. Must be called within a tokio
    /// runtime.
    pub fn watch_status(
        &self,
        cancel: &CancellationToken,
        goal_id: Option<GoalId>,
        handler: impl Fn(GoalStatusEntry) + Send + Sync + 'static,
    ) -> GoalWatch {
        self.inner
            .status
            .watch(cancel, &self.inner.shutdown, goal_id, Arc::new(handler))
    }

    /// Fails pending requests with [`Error::Closed`], stops every watch and
    /// destroys the client.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub(crate) fn as_waitable(&self) -> Arc<dyn Waitable> {
        self.inner.clone()
    }
}

impl<A: Action> ClientInner<A> {
    async fn request<Req, Resp>(
        &self,
        correlator: &RequestCorrelator<TransportChannel>,
        cancel: &CancellationToken,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        self.handle.ensure_open()?;
        let payload = encode(request)?;
        let response = correlator.send(cancel, &payload).await?;
        decode(&response.payload)
    }

    fn handle_feedback(&self) -> Result<()> {
        let Some((_, payload)) = self
            .handle
            .transport()
            .take_message(self.handle.id(), TopicChannel::Feedback)?
        else {
            return Ok(());
        };
        let message: FeedbackMessage<A::Feedback> = decode(&payload)?;
        let goal_id = message.goal_id;
        self.feedback.deliver(&goal_id, message, &self.span);
        Ok(())
    }

    fn handle_status(&self) -> Result<()> {
        let Some((_, payload)) = self
            .handle
            .transport()
            .take_message(self.handle.id(), TopicChannel::Status)?
        else {
            return Ok(());
        };
        let array: GoalStatusArray = decode(&payload)?;
        for entry in array.status_list {
            self.status.deliver(&entry.goal_info.goal_id, entry, &self.span);
        }
        Ok(())
    }
}

impl<A: Action> Waitable for ClientInner<A> {
    fn kind(&self) -> WaitableKind {
        WaitableKind::ActionClient
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
        self.goal.close();
        self.cancel.close();
        self.result.close();
        self.shutdown.cancel();
        tracing::debug!(parent: &self.span, action = %self.name, "action client closed");
        self.handle.close()
    }

    fn on_ready(self: Arc<Self>, ready: ReadyMask, _cancel: &CancellationToken) {
        let _entered = self.span.enter();
        if ready.contains(ReadyMask::GOAL_RESPONSE) {
            self.goal.handle_response();
        }
        if ready.contains(ReadyMask::CANCEL_RESPONSE) {
            self.cancel.handle_response();
        }
        if ready.contains(ReadyMask::RESULT_RESPONSE) {
            self.result.handle_response();
        }
        if ready.contains(ReadyMask::FEEDBACK) {
            if let Err(err) = self.handle_feedback() {
                tracing::warn!(action = %self.name, %err, "failed to handle feedback");
            }
        }
        if ready.contains(ReadyMask::STATUS) {
            if let Err(err) = self.handle_status() {
                tracing::warn!(action = %self.name, %err, "failed to handle goal status");
            }
        }
    }
}

impl<A: Action> Drop for ClientInner<A> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type Handler<M> = Arc<dyn Fn(M) + Send + Sync>;

struct Registration<M> {
    cancel: CancellationToken,
    handler: Handler<M>,
}

impl<M> Clone for Registration<M> {
    fn clone(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

struct Handlers<M> {
    all_goals: HashMap<u64, Registration<M>>,
    per_goal: HashMap<GoalId, HashMap<u64, Registration<M>>>,
}

/// Handlers for one topic, registered for all goals or for one goal.
struct HandlerRegistry<M> {
    topic: &'static str,
    next_id: AtomicU64,
    handlers: Mutex<Handlers<M>>,
}

impl<M: Clone + Send + 'static> HandlerRegistry<M> {
    fn new(topic: &'static str) -> Self {
        Self {
            topic,
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Handlers {
                all_goals: HashMap::new(),
                per_goal: HashMap::new(),
            }),
        }
    }

    fn register(&self, goal_id: Option<GoalId>, registration: Registration<M>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.lock();
        match goal_id {
            Some(goal_id) => {
                handlers
                    .per_goal
                    .entry(goal_id)
                    .or_default()
                    .insert(id, registration);
            }
            None => {
                handlers.all_goals.insert(id, registration);
            }
        }
        id
    }

    fn unregister(&self, goal_id: Option<GoalId>, id: u64) {
        let mut handlers = self.handlers.lock();
        match goal_id {
            Some(goal_id) => {
                if let Some(goal) = handlers.per_goal.get_mut(&goal_id) {
                    goal.remove(&id);
                    if goal.is_empty() {
                        handlers.per_goal.remove(&goal_id);
                    }
                }
            }
            None => {
                handlers.all_goals.remove(&id);
            }
        }
    }

    /// Registers `handler` until `cancel` or `shutdown` fires.
    fn watch(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
        goal_id: Option<GoalId>,
        handler: Handler<M>,
    ) -> GoalWatch {
        let (tx, rx) = oneshot::channel();
        if shutdown.is_cancelled() {
            let _ = tx.send(Err(Error::Closed));
            return rx;
        }

        let token = cancel.child_token();
        let id = self.register(
            goal_id,
            Registration {
                cancel: token.clone(),
                handler,
            },
        );
        tracing::trace!(topic = self.topic, id, ?goal_id, "watch registered");

        let registry = Arc::clone(self);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => Error::Canceled,
                _ = shutdown.cancelled() => Error::Closed,
            };
            token.cancel();
            registry.unregister(goal_id, id);
            let _ = tx.send(Err(outcome));
        });
        rx
    }

    /// Handlers matching `goal_id`, global ones first.
    fn matching(&self, goal_id: &GoalId) -> Vec<Registration<M>> {
        let handlers = self.handlers.lock();
        let mut matching: Vec<Registration<M>> = handlers.all_goals.values().cloned().collect();
        if let Some(goal) = handlers.per_goal.get(goal_id) {
            matching.extend(goal.values().cloned());
        }
        matching
    }

    /// Hands a copy of `message` to every matching handler, each on its own
    /// task.
    fn deliver(&self, goal_id: &GoalId, message: M, span: &tracing::Span) {
        for registration in self.matching(goal_id) {
            if registration.cancel.is_cancelled() {
                continue;
            }
            let message = message.clone();
            let topic = self.topic;
            tokio::spawn(
                async move {
                    if registration.cancel.is_cancelled() {
                        return;
                    }
                    let handler = &registration.handler;
                    if let Err(panic) =
                        std::panic::catch_unwind(AssertUnwindSafe(|| handler(message)))
                    {
                        tracing::error!(
                            topic,
                            panic = panic_message(panic.as_ref()),
                            "watch handler panicked"
                        );
                    }
                }
                .instrument(span.clone()),
            );
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let handlers = self.handlers.lock();
        handlers.all_goals.len() + handlers.per_goal.values().map(HashMap::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter(hits: &Arc<AtomicUsize>) -> Handler<u32> {
        let hits = hits.clone();
        Arc::new(move |_: u32| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deliver_to_global_and_matching_goal() {
        let registry = Arc::new(HandlerRegistry::<u32>::new("test"));
        let shutdown = CancellationToken::new();
        let cancel = CancellationToken::new();
        let (a, b) = (GoalId::new(), GoalId::new());
        let global = Arc::new(AtomicUsize::new(0));
        let only_a = Arc::new(AtomicUsize::new(0));
        let _w1 = registry.watch(&cancel, &shutdown, None, counter(&global));
        let _w2 = registry.watch(&cancel, &shutdown, Some(a), counter(&only_a));

        registry.deliver(&a, 1, &tracing::Span::none());
        registry.deliver(&b, 2, &tracing::Span::none());
        settle().await;

        assert_eq!(global.load(Ordering::SeqCst), 2);
        assert_eq!(only_a.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_unregisters() {
        let registry = Arc::new(HandlerRegistry::<u32>::new("test"));
        let shutdown = CancellationToken::new();
        let cancel = CancellationToken::new();
        let goal = GoalId::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let watch = registry.watch(&cancel, &shutdown, Some(goal), counter(&hits));
        assert_eq!(registry.len(), 1);

        cancel.cancel();
        assert!(matches!(watch.await.unwrap(), Err(Error::Canceled)));
        assert_eq!(registry.len(), 0);

        registry.deliver(&goal, 1, &tracing::Span::none());
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_closes_watches() {
        let registry = Arc::new(HandlerRegistry::<u32>::new("test"));
        let shutdown = CancellationToken::new();
        let watch = registry.watch(
            &CancellationToken::new(),
            &shutdown,
            None,
            counter(&Arc::new(AtomicUsize::new(0))),
        );
        shutdown.cancel();
        assert!(matches!(watch.await.unwrap(), Err(Error::Closed)));
        assert_eq!(registry.len(), 0);

        let late = registry.watch(
            &CancellationToken::new(),
            &shutdown,
            None,
            counter(&Arc::new(AtomicUsize::new(0))),
        );
        assert!(matches!(late.await.unwrap(), Err(Error::Closed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_handler_does_not_affect_others() {
        let registry = Arc::new(HandlerRegistry::<u32>::new("test"));
        let shutdown = CancellationToken::new();
        let cancel = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let _w1 = registry.watch(&cancel, &shutdown, None, Arc::new(|_: u32| panic!("handler bug")));
        let _w2 = registry.watch(&cancel, &shutdown, None, counter(&hits));

        registry.deliver(&GoalId::new(), 7, &tracing::Span::none());
        registry.deliver(&GoalId::new(), 8, &tracing::Span::none());
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_registration_and_delivery() {
        let registry = Arc::new(HandlerRegistry::<u32>::new("test"));
        let shutdown = CancellationToken::new();
        let goal = GoalId::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let deliverer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    registry.deliver(&goal, i, &tracing::Span::none());
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut tokens = Vec::new();
        for _ in 0..50 {
            let cancel = CancellationToken::new();
            let _watch = registry.watch(&cancel, &shutdown, Some(goal), counter(&hits));
            tokens.push(cancel);
            tokio::task::yield_now().await;
        }
        for token in &tokens {
            token.cancel();
        }
        deliverer.await.unwrap();
        settle().await;
        assert_eq!(registry.len(), 0);

        let before = hits.load(Ordering::SeqCst);
        registry.deliver(&goal, 0, &tracing::Span::none());
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), before);
    }
}
