// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entities a [`WaitSet`](crate::WaitSet) can poll.

use crate::error::{Error, Result};
use crate::transport::{EntityId, ReadyMask, Transport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Kind of a wait set member. The declaration order is the dispatch order
/// within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WaitableKind {
    Timer,
    Subscription,
    Service,
    Client,
    ActionServer,
    ActionClient,
    Guard,
}

impl WaitableKind {
    pub const COUNT: usize = 7;

    pub const DISPATCH_ORDER: [WaitableKind; Self::COUNT] = [
        WaitableKind::Timer,
        WaitableKind::Subscription,
        WaitableKind::Service,
        WaitableKind::Client,
        WaitableKind::ActionServer,
        WaitableKind::ActionClient,
        WaitableKind::Guard,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            WaitableKind::Timer => "timer",
            WaitableKind::Subscription => "subscription",
            WaitableKind::Service => "service",
            WaitableKind::Client => "client",
            WaitableKind::ActionServer => "action server",
            WaitableKind::ActionClient => "action client",
            WaitableKind::Guard => "guard condition",
        }
    }
}

/// An entity that can become ready after a poll cycle.
///
/// Transport-backed members report an [`EntityId`] and are handed the ready
/// mask the transport computed for them. Timers have no entity; they are
/// ready once their [`deadline`](Waitable::deadline) has passed.
pub trait Waitable: Send + Sync + 'static {
    fn kind(&self) -> WaitableKind;

    /// Transport entity to poll, if any.
    fn entity_id(&self) -> Option<EntityId>;

    /// Next time this member wants to run without transport readiness.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    fn reservation(&self) -> &Reservation;

    fn is_closed(&self) -> bool;

    /// Releases the entity; a second call fails with
    /// [`Error::AlreadyClosed`].
    fn close(&self) -> Result<()>;

    /// Invoked synchronously on the wait set's task. `cancel` is the token
    /// the wait set runs under.
    fn on_ready(self: Arc<Self>, ready: ReadyMask, cancel: &CancellationToken);

    /// Receives the running wait set's waker when a run starts and `None`
    /// when it ends. Members whose deadline moves from outside the loop use
    /// it to make the loop re-read deadlines.
    fn set_waker(&self, _waker: Option<LoopWaker>) {}
}

/// Wakes a blocked wait set without dispatching anything.
#[derive(Clone)]
pub struct LoopWaker {
    transport: Arc<dyn Transport>,
    guard: EntityId,
}

impl LoopWaker {
    pub(crate) fn new(transport: Arc<dyn Transport>, guard: EntityId) -> Self {
        Self { transport, guard }
    }

    pub fn wake(&self) {
        if let Err(err) = self.transport.trigger_guard(self.guard) {
            tracing::debug!(guard = %self.guard, %err, "failed to wake wait set");
        }
    }
}

/// Owner word tying a waitable to at most one running wait set.
#[derive(Debug, Default)]
pub struct Reservation(AtomicU64);

const FREE: u64 = 0;

impl Reservation {
    pub fn new() -> Self {
        Self(AtomicU64::new(FREE))
    }

    /// Claims the waitable for `owner`. Returns `Ok(true)` when newly
    /// claimed, `Ok(false)` when `owner` already holds it.
    pub(crate) fn reserve(&self, owner: u64, kind: WaitableKind) -> Result<bool> {
        match self
            .0
            .compare_exchange(FREE, owner, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(true),
            Err(current) if current == owner => Ok(false),
            Err(_) => Err(Error::AlreadyReserved(kind.name())),
        }
    }

    /// Releases the claim if `owner` holds it.
    pub(crate) fn release(&self, owner: u64) {
        let _ = self
            .0
            .compare_exchange(owner, FREE, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_reserved(&self) -> bool {
        self.0.load(Ordering::Acquire) != FREE
    }
}

/// Transport entity shared by every typed endpoint: destroys the entity
/// exactly once, on `close` or on drop.
pub(crate) struct EntityHandle {
    transport: Arc<dyn Transport>,
    id: EntityId,
    what: &'static str,
    closed: AtomicBool,
    reservation: Reservation,
}

impl EntityHandle {
    /// `what` names the entity in errors and logs, e.g. "subscription".
    pub(crate) fn new(transport: Arc<dyn Transport>, id: EntityId, what: &'static str) -> Self {
        Self {
            transport,
            id,
            what,
            closed: AtomicBool::new(false),
            reservation: Reservation::new(),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn id(&self) -> EntityId {
        self.id
    }

    pub(crate) fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fails with [`Error::AlreadyClosed`] once closed.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::AlreadyClosed(self.what))
        } else {
            Ok(())
        }
    }

    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed(self.what));
        }
        self.transport.destroy(self.id)?;
        Ok(())
    }
}

impl Drop for EntityHandle {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.transport.destroy(self.id) {
                tracing::debug!(entity = %self.id, %err, "failed to destroy {}", self.what);
            }
        }
    }
}
