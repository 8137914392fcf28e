// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime context: the transport handle, configuration and live resources.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::node::{Node, WeakNode};
use crate::timer::Timer;
use crate::transport::{LoopbackTransport, Transport};
use crate::wait_set::{GuardCondition, WaitSet};
use crate::waitable::Waitable;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Entry point of the runtime.
///
/// Cloning is cheap; all clones share the same transport and resources.
///
/// ```rust,no_run
/// # async fn example() -> rclkit::Result<()> {
/// use rclkit::Context;
/// use tokio_util::sync::CancellationToken;
///
/// let context = Context::loopback();
/// let node = context.create_node("talker", "/demo")?;
/// let cancel = CancellationToken::new();
/// context.spin(&cancel).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    resources: ResourceStore,
    nodes: Mutex<Vec<WeakNode>>,
    closed: AtomicBool,
}

impl Context {
    /// Creates a context over `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(domain_id = config.domain_id, "creating context");
        Ok(Self {
            inner: Arc::new(ContextInner {
                transport,
                config,
                resources: ResourceStore::default(),
                nodes: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Context over a fresh [`LoopbackTransport`] with default configuration.
    pub fn loopback() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                transport: Arc::new(LoopbackTransport::new()),
                config: RuntimeConfig::default(),
                resources: ResourceStore::default(),
                nodes: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Context over `transport` configured from the environment.
    pub fn from_env(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::new(transport, RuntimeConfig::from_env()?)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn domain_id(&self) -> u32 {
        self.inner.config.domain_id
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::AlreadyClosed("context"))
        } else {
            Ok(())
        }
    }

    /// Creates a node named `name` in `namespace`.
    pub fn create_node(&self, name: &str, namespace: &str) -> Result<Node> {
        self.ensure_open()?;
        let node = Node::new(self.clone(), name, namespace);
        let mut nodes = self.inner.nodes.lock();
        nodes.retain(WeakNode::is_alive);
        nodes.push(node.downgrade());
        drop(nodes);
        Ok(node)
    }

    /// Creates a timer owned by the context rather than by a node.
    pub fn create_timer(
        &self,
        period: Duration,
        callback: impl Fn(&Timer) + Send + Sync + 'static,
    ) -> Result<Timer> {
        self.ensure_open()?;
        let timer = Timer::new(period, callback);
        self.track(&timer.as_waitable());
        Ok(timer)
    }

    pub fn create_guard_condition(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<GuardCondition> {
        self.ensure_open()?;
        let guard = GuardCondition::new(Arc::clone(&self.inner.transport), callback)?;
        self.track(&guard.as_waitable());
        Ok(guard)
    }

    /// Creates an empty wait set on this context's transport.
    pub fn create_wait_set(&self) -> Result<WaitSet> {
        self.ensure_open()?;
        WaitSet::new(Arc::clone(&self.inner.transport))
    }

    pub(crate) fn track(&self, member: &Arc<dyn Waitable>) {
        self.inner.resources.track(member);
    }

    /// Builds a wait set from every live entity created through the context
    /// or its nodes and runs it until `cancel` fires.
    pub async fn spin(&self, cancel: &CancellationToken) -> Result<()> {
        let mut wait_set = self.create_wait_set()?;
        for member in self.inner.resources.live() {
            wait_set.add(member);
        }
        let result = wait_set.run(cancel).await;
        if let Err(err) = wait_set.close() {
            tracing::debug!(%err, "failed to close spin wait set");
        }
        result
    }

    /// Closes every node and resource created through this context. Later
    /// calls fail with [`Error::AlreadyClosed`].
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed("context"));
        }
        let mut first_error = None;
        let nodes = std::mem::take(&mut *self.inner.nodes.lock());
        for node in nodes.iter().filter_map(WeakNode::upgrade) {
            match node.close() {
                Ok(()) | Err(Error::AlreadyClosed(_)) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Err(err) = self.inner.resources.close_all() {
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Weak registry of the waitables created through a context or node.
#[derive(Default)]
pub(crate) struct ResourceStore {
    entries: Mutex<Vec<Weak<dyn Waitable>>>,
}

impl ResourceStore {
    pub(crate) fn track(&self, member: &Arc<dyn Waitable>) {
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.strong_count() > 0);
        entries.push(Arc::downgrade(member));
    }

    /// Every resource still alive and open.
    pub(crate) fn live(&self) -> Vec<Arc<dyn Waitable>> {
        self.entries
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|member| !member.is_closed())
            .collect()
    }

    /// Closes every live resource, returning the first failure.
    pub(crate) fn close_all(&self) -> Result<()> {
        let members: Vec<Arc<dyn Waitable>> = {
            let mut entries = self.entries.lock();
            let members = entries.iter().filter_map(Weak::upgrade).collect();
            entries.clear();
            members
        };
        let mut first_error = None;
        for member in members {
            match member.close() {
                Ok(()) | Err(Error::AlreadyClosed(_)) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_invalid_config_rejected() {
        let config = RuntimeConfig {
            domain_id: 999,
            ..Default::default()
        };
        let err = Context::new(Arc::new(LoopbackTransport::new()), config)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_domain_id_from_config() {
        let config = RuntimeConfig {
            domain_id: 7,
            ..Default::default()
        };
        let context = Context::new(Arc::new(LoopbackTransport::new()), config).unwrap();
        assert_eq!(context.domain_id(), 7);
        assert_eq!(Context::loopback().domain_id(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spin_drives_context_timer() {
        let context = Context::loopback();
        let ticks = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let _timer = {
            let ticks = ticks.clone();
            let cancel = cancel.clone();
            context
                .create_timer(Duration::from_millis(5), move |_| {
                    if ticks.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        cancel.cancel();
                    }
                })
                .unwrap()
        };
        let err = context.spin(&cancel).await.unwrap_err();
        assert!(err.is_canceled());
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_close_closes_resources() {
        let context = Context::loopback();
        let timer = context.create_timer(Duration::from_secs(1), |_| {}).unwrap();
        let guard = context.create_guard_condition(|| {}).unwrap();
        context.close().unwrap();

        assert!(timer.as_waitable().is_closed());
        assert!(matches!(guard.trigger(), Err(Error::AlreadyClosed(_))));
        assert!(matches!(context.close(), Err(Error::AlreadyClosed("context"))));
        assert!(context.create_node("n", "/").is_err());
    }

    #[test]
    fn test_dropped_resources_are_forgotten() {
        let context = Context::loopback();
        drop(context.create_timer(Duration::from_secs(1), |_| {}).unwrap());
        let kept = context.create_timer(Duration::from_secs(1), |_| {}).unwrap();
        assert_eq!(context.inner.resources.live().len(), 1);
        drop(kept);
        assert!(context.inner.resources.live().is_empty());
    }
}
