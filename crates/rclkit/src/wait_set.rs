// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The dispatch loop.
//!
//! A [`WaitSet`] owns a set of waitables and repeatedly asks the transport
//! which of them are ready, then invokes their callbacks synchronously in a
//! fixed order: timers, subscriptions, services, clients, action servers,
//! action clients, guard conditions. Long-running work (goal execution,
//! result waits, handler fan-out) is spawned by the callbacks themselves.

use crate::action::{Action, ActionClient, ActionServer};
use crate::error::{Error, Result};
use crate::message::{Message, ServiceType};
use crate::node::Node;
use crate::pubsub::Subscription;
use crate::service::{Client, Service};
use crate::timer::Timer;
use crate::transport::{EntityId, ReadyMask, ReadySet, Transport};
use crate::waitable::{EntityHandle, LoopWaker, Reservation, Waitable, WaitableKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Readiness-driven scheduler for a set of waitables.
///
/// Members are added between runs; [`run`](WaitSet::run) reserves all of
/// them for its duration so a waitable is never driven by two loops at once.
///
/// ```rust,no_run
/// # async fn example(node: rclkit::Node, timer: rclkit::Timer) -> rclkit::Result<()> {
/// use tokio_util::sync::CancellationToken;
///
/// let mut wait_set = node.context().create_wait_set()?;
/// wait_set.add_timer(&timer);
/// let cancel = CancellationToken::new();
/// wait_set.run(&cancel).await?;
/// # Ok(())
/// # }
/// ```
pub struct WaitSet {
    id: u64,
    transport: Arc<dyn Transport>,
    members: [Vec<Arc<dyn Waitable>>; WaitableKind::COUNT],
    cancel_guard: EntityHandle,
    /// Triggered by members whose deadline changed while the loop blocks.
    wake_guard: EntityHandle,
    running: AtomicBool,
    waiting: Arc<AtomicBool>,
}

impl WaitSet {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        let cancel_guard = transport.create_guard()?;
        let wake_guard = transport.create_guard()?;
        Ok(Self {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            cancel_guard: EntityHandle::new(Arc::clone(&transport), cancel_guard, "guard condition"),
            wake_guard: EntityHandle::new(Arc::clone(&transport), wake_guard, "guard condition"),
            transport,
            members: std::array::from_fn(|_| Vec::new()),
            running: AtomicBool::new(false),
            waiting: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Adds any waitable. Adding the same waitable twice has no effect.
    pub fn add(&mut self, member: Arc<dyn Waitable>) {
        let slot = &mut self.members[member.kind().index()];
        let ptr = Arc::as_ptr(&member) as *const ();
        if !slot.iter().any(|m| Arc::as_ptr(m) as *const () == ptr) {
            slot.push(member);
        }
    }

    pub fn add_timer(&mut self, timer: &Timer) {
        self.add(timer.as_waitable());
    }

    pub fn add_subscription<M: Message>(&mut self, subscription: &Subscription<M>) {
        self.add(subscription.as_waitable());
    }

    pub fn add_service<S: ServiceType>(&mut self, service: &Service<S>) {
        self.add(service.as_waitable());
    }

    pub fn add_client<S: ServiceType>(&mut self, client: &Client<S>) {
        self.add(client.as_waitable());
    }

    pub fn add_action_server<A: Action>(&mut self, server: &ActionServer<A>) {
        self.add(server.as_waitable());
    }

    pub fn add_action_client<A: Action>(&mut self, client: &ActionClient<A>) {
        self.add(client.as_waitable());
    }

    pub fn add_guard_condition(&mut self, guard: &GuardCondition) {
        self.add(guard.as_waitable());
    }

    /// Adds every live entity created through `node`.
    pub fn add_node(&mut self, node: &Node) {
        for member in node.resources() {
            self.add(member);
        }
    }

    /// Number of members, excluding the internal guards.
    pub fn len(&self) -> usize {
        self.members.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drives the members until `cancel` fires.
    ///
    /// Returns [`Error::Canceled`] once cancellation is observed, or the
    /// transport error if waiting fails. Reservations are released on every
    /// exit path.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.cancel_guard.ensure_open()?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyReserved("wait set"));
        }
        let _run = RunState {
            wait_set: self,
            reservations: Vec::new(),
            watcher: None,
        }
        .start(cancel)?;

        tracing::debug!(wait_set = self.id, members = self.len(), "wait set running");
        let result = self.run_loop(cancel).await;
        tracing::debug!(wait_set = self.id, ?result, "wait set stopped");
        result
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let members = self.poll_ids();
            let timeout = self.next_timeout();
            let transport = Arc::clone(&self.transport);

            self.waiting.store(true, Ordering::Release);
            let waited =
                tokio::task::spawn_blocking(move || transport.wait(&members, timeout)).await;
            self.waiting.store(false, Ordering::Release);

            let ready = waited.map_err(|err| Error::Task(err.to_string()))??;
            if ready.is_ready(self.cancel_guard.id()) {
                return Err(Error::Canceled);
            }
            self.dispatch(&ready, cancel);
        }
    }

    fn poll_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .members
            .iter()
            .flatten()
            .filter(|m| !m.is_closed())
            .filter_map(|m| m.entity_id())
            .collect();
        ids.push(self.cancel_guard.id());
        ids.push(self.wake_guard.id());
        ids
    }

    /// Time until the nearest timer deadline, `None` when no timer is armed.
    fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.members[WaitableKind::Timer.index()]
            .iter()
            .filter(|m| !m.is_closed())
            .filter_map(|m| m.deadline())
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn dispatch(&self, ready: &ReadySet, cancel: &CancellationToken) {
        let now = Instant::now();
        for kind in WaitableKind::DISPATCH_ORDER {
            for member in &self.members[kind.index()] {
                if member.is_closed() {
                    continue;
                }
                let mask = match member.entity_id() {
                    Some(id) => ready.get(id),
                    None => match member.deadline() {
                        Some(deadline) if deadline <= now => ReadyMask::DATA,
                        _ => continue,
                    },
                };
                if !mask.is_empty() {
                    Arc::clone(member).on_ready(mask, cancel);
                }
            }
        }
    }

    fn reserve_all(&self) -> Result<Vec<Arc<dyn Waitable>>> {
        let mut acquired: Vec<Arc<dyn Waitable>> = Vec::new();
        for member in self.members.iter().flatten() {
            match member.reservation().reserve(self.id, member.kind()) {
                Ok(true) => acquired.push(Arc::clone(member)),
                Ok(false) => {}
                Err(err) => {
                    for held in &acquired {
                        held.reservation().release(self.id);
                    }
                    return Err(err);
                }
            }
        }
        Ok(acquired)
    }

    /// Destroys the internal guards. The wait set cannot run afterwards.
    pub fn close(&self) -> Result<()> {
        let closed = self.cancel_guard.close();
        let woken = self.wake_guard.close();
        closed.and(woken)
    }
}

/// Per-run resources, released in `Drop` whatever way `run` exits.
struct RunState<'a> {
    wait_set: &'a WaitSet,
    reservations: Vec<Arc<dyn Waitable>>,
    watcher: Option<JoinHandle<()>>,
}

impl<'a> RunState<'a> {
    fn start(mut self, cancel: &CancellationToken) -> Result<Self> {
        self.reservations = self.wait_set.reserve_all()?;
        let waker = LoopWaker::new(
            Arc::clone(&self.wait_set.transport),
            self.wait_set.wake_guard.id(),
        );
        for member in &self.reservations {
            member.set_waker(Some(waker.clone()));
        }

        let transport = Arc::clone(&self.wait_set.transport);
        let guard = self.wait_set.cancel_guard.id();
        let token = cancel.clone();
        self.watcher = Some(tokio::spawn(async move {
            token.cancelled().await;
            if let Err(err) = transport.trigger_guard(guard) {
                tracing::warn!(%err, "failed to wake wait set on cancellation");
            }
        }));
        Ok(self)
    }
}

impl Drop for RunState<'_> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        // Dropped while blocked in the transport: wake the orphaned wait so
        // its blocking thread is returned.
        if self.wait_set.waiting.swap(false, Ordering::AcqRel) {
            let _ = self
                .wait_set
                .transport
                .trigger_guard(self.wait_set.cancel_guard.id());
        }
        for member in &self.reservations {
            member.set_waker(None);
            member.reservation().release(self.wait_set.id);
        }
        self.wait_set.running.store(false, Ordering::Release);
    }
}

/// Manually triggered waitable.
///
/// [`trigger`](GuardCondition::trigger) may be called from any thread; the
/// callback then runs on the wait set driving the guard.
#[derive(Clone)]
pub struct GuardCondition {
    inner: Arc<GuardInner>,
}

type GuardCallback = Box<dyn Fn() + Send + Sync>;

struct GuardInner {
    handle: EntityHandle,
    callback: GuardCallback,
}

impl GuardCondition {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self> {
        let id = transport.create_guard()?;
        Ok(Self {
            inner: Arc::new(GuardInner {
                handle: EntityHandle::new(transport, id, "guard condition"),
                callback: Box::new(callback),
            }),
        })
    }

    pub fn trigger(&self) -> Result<()> {
        self.inner.handle.ensure_open()?;
        self.inner
            .handle
            .transport()
            .trigger_guard(self.inner.handle.id())?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub(crate) fn as_waitable(&self) -> Arc<dyn Waitable> {
        self.inner.clone()
    }
}

impl Waitable for GuardInner {
    fn kind(&self) -> WaitableKind {
        WaitableKind::Guard
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
        self.handle.close()
    }

    fn on_ready(self: Arc<Self>, _ready: ReadyMask, _cancel: &CancellationToken) {
        (self.callback)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::AtomicUsize;

    fn transport() -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport::new())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_returns_canceled() {
        let wait_set = WaitSet::new(transport()).unwrap();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });
        let err = wait_set.run(&cancel).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_with_canceled_token_returns_immediately() {
        let wait_set = WaitSet::new(transport()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), wait_set.run(&cancel)).await;
        assert!(matches!(result, Ok(Err(Error::Canceled))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guard_condition_callback() {
        let transport = transport();
        let hits = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let guard = {
            let hits = hits.clone();
            let cancel = cancel.clone();
            GuardCondition::new(transport.clone(), move || {
                hits.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
            })
            .unwrap()
        };
        let mut wait_set = WaitSet::new(transport).unwrap();
        wait_set.add_guard_condition(&guard);
        wait_set.add_guard_condition(&guard);
        assert_eq!(wait_set.len(), 1);

        guard.trigger().unwrap();
        assert!(wait_set.run(&cancel).await.unwrap_err().is_canceled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_member_reserved_by_other_loop() {
        let transport = transport();
        let guard = GuardCondition::new(transport.clone(), || {}).unwrap();
        let mut first = WaitSet::new(transport.clone()).unwrap();
        let mut second = WaitSet::new(transport).unwrap();
        first.add_guard_condition(&guard);
        second.add_guard_condition(&guard);

        let cancel = CancellationToken::new();
        let first = Arc::new(first);
        let running = {
            let first = first.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { first.run(&cancel).await })
        };
        while !guard.inner.handle.reservation().is_reserved() {
            tokio::task::yield_now().await;
        }

        let err = second.run(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyReserved("guard condition")));

        cancel.cancel();
        assert!(running.await.unwrap().unwrap_err().is_canceled());
        assert!(!guard.inner.handle.reservation().is_reserved());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_run_of_same_wait_set_fails() {
        let wait_set = Arc::new(WaitSet::new(transport()).unwrap());
        let cancel = CancellationToken::new();
        let running = {
            let wait_set = wait_set.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { wait_set.run(&cancel).await })
        };
        while !wait_set.running.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            wait_set.run(&cancel).await,
            Err(Error::AlreadyReserved("wait set"))
        ));
        cancel.cancel();
        assert!(running.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_close_twice() {
        let wait_set = WaitSet::new(transport()).unwrap();
        wait_set.close().unwrap();
        assert!(matches!(
            wait_set.close(),
            Err(Error::AlreadyClosed("guard condition"))
        ));
        assert!(matches!(
            wait_set.run(&CancellationToken::new()).await,
            Err(Error::AlreadyClosed(_))
        ));
    }
}
