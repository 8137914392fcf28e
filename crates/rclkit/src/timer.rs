// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic timers driven by the wait set's deadline.

use crate::error::{Error, Result};
use crate::transport::{EntityId, ReadyMask};
use crate::waitable::{LoopWaker, Reservation, Waitable, WaitableKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

type TimerCallback = Box<dyn Fn(&Timer) + Send + Sync>;

/// A periodic callback.
///
/// The next deadline is reset to `now + period` right before the callback
/// runs, so a slow callback delays the following call by at most one period.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    period: Duration,
    next_call: Mutex<Instant>,
    canceled: AtomicBool,
    closed: AtomicBool,
    reservation: Reservation,
    waker: Mutex<Option<LoopWaker>>,
    callback: TimerCallback,
}

impl Timer {
    pub(crate) fn new(period: Duration, callback: impl Fn(&Timer) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                period,
                next_call: Mutex::new(Instant::now() + period),
                canceled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reservation: Reservation::new(),
                waker: Mutex::new(None),
                callback: Box::new(callback),
            }),
        }
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Restarts the period from now and re-arms a canceled timer. A wait
    /// set currently running the timer picks up the new deadline at once.
    pub fn reset(&self) {
        *self.inner.next_call.lock() = Instant::now() + self.inner.period;
        self.inner.canceled.store(false, Ordering::Release);
        if let Some(waker) = self.inner.waker.lock().as_ref() {
            waker.wake();
        }
    }

    /// Time left until the next call, zero if it is overdue.
    pub fn time_until_next_call(&self) -> Duration {
        self.inner
            .next_call
            .lock()
            .saturating_duration_since(Instant::now())
    }

    /// Stops the timer until the next [`reset`](Timer::reset).
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Removes the timer from every wait set for good.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub(crate) fn as_waitable(&self) -> Arc<dyn Waitable> {
        self.inner.clone()
    }
}

impl Waitable for TimerInner {
    fn kind(&self) -> WaitableKind {
        WaitableKind::Timer
    }

    fn entity_id(&self) -> Option<EntityId> {
        None
    }

    fn deadline(&self) -> Option<Instant> {
        if self.canceled.load(Ordering::Acquire) {
            None
        } else {
            Some(*self.next_call.lock())
        }
    }

    fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    fn set_waker(&self, waker: Option<LoopWaker>) {
        *self.waker.lock() = waker;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed("timer"));
        }
        Ok(())
    }

    fn on_ready(self: Arc<Self>, _ready: ReadyMask, _cancel: &CancellationToken) {
        let timer = Timer { inner: self };
        *timer.inner.next_call.lock() = Instant::now() + timer.inner.period;
        (timer.inner.callback)(&timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_and_reset() {
        let timer = Timer::new(Duration::from_secs(60), |_| {});
        let waitable = timer.as_waitable();
        assert!(waitable.deadline().is_some());
        assert!(timer.time_until_next_call() > Duration::from_secs(59));

        timer.cancel();
        assert!(timer.is_canceled());
        assert!(waitable.deadline().is_none());

        timer.reset();
        assert!(!timer.is_canceled());
        assert!(waitable.deadline().is_some());
    }

    #[test]
    fn test_callback_resets_deadline_first() {
        let timer = Timer::new(Duration::from_millis(50), |t| {
            assert!(t.time_until_next_call() > Duration::from_millis(25));
        });
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(timer.time_until_next_call(), Duration::ZERO);
        timer
            .as_waitable()
            .on_ready(ReadyMask::DATA, &CancellationToken::new());
        assert!(timer.time_until_next_call() > Duration::from_millis(25));
    }

    #[test]
    fn test_close_twice() {
        let timer = Timer::new(Duration::from_secs(1), |_| {});
        timer.close().unwrap();
        assert!(timer.as_waitable().is_closed());
        assert!(matches!(timer.close(), Err(Error::AlreadyClosed("timer"))));
    }
}
