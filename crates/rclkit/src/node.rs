// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Nodes: named factories for endpoints, timers and actions.

use crate::action::{
    Action, ActionClient, ActionClientOptions, ActionServer, ActionServerOptions, ExecuteGoal,
};
use crate::context::{Context, ResourceStore};
use crate::error::{Error, Result};
use crate::message::{Message, ServiceType};
use crate::pubsub::{Publisher, Subscription};
use crate::qos::QosProfile;
use crate::service::{Client, RequestHandler, Service};
use crate::timer::Timer;
use crate::waitable::Waitable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A named, namespaced group of entities sharing a log span.
///
/// Relative topic, service and action names are resolved against the
/// node's namespace; names starting with `/` are used as given.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    context: Context,
    name: String,
    namespace: String,
    span: tracing::Span,
    resources: ResourceStore,
    closed: AtomicBool,
}

/// Non-owning reference held by the context.
pub(crate) struct WeakNode(Weak<NodeInner>);

impl WeakNode {
    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(|inner| Node { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl Node {
    pub(crate) fn new(context: Context, name: &str, namespace: &str) -> Self {
        let namespace = normalize_namespace(namespace);
        let fqn = join(&namespace, name);
        let span = tracing::debug_span!("node", name = %fqn);
        tracing::debug!(parent: &span, "node created");
        Self {
            inner: Arc::new(NodeInner {
                context,
                name: name.to_string(),
                namespace,
                span,
                resources: ResourceStore::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Namespace and name joined, e.g. `/demo/talker`.
    pub fn fully_qualified_name(&self) -> String {
        join(&self.inner.namespace, &self.inner.name)
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// QoS profile from the context configuration.
    pub fn default_qos(&self) -> QosProfile {
        self.inner.context.config().qos.clone()
    }

    /// Resolves `name` against the node's namespace.
    pub fn resolve_name(&self, name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            join(&self.inner.namespace, name)
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed("node"));
        }
        self.inner.context.ensure_open()
    }

    fn track(&self, member: Arc<dyn Waitable>) {
        self.inner.resources.track(&member);
        self.inner.context.track(&member);
    }

    pub fn create_publisher<M: Message>(
        &self,
        topic: &str,
        qos: &QosProfile,
    ) -> Result<Publisher<M>> {
        self.ensure_open()?;
        let topic = self.resolve_name(topic);
        let transport = self.inner.context.transport();
        let id = transport.create_publisher(&topic, std::any::type_name::<M>(), qos)?;
        tracing::debug!(parent: &self.inner.span, %topic, %id, "publisher created");
        Ok(Publisher::new(Arc::clone(transport), id, &topic))
    }

    /// Creates a subscription; `callback` runs on the wait set whenever
    /// messages are queued and pulls them with
    /// [`Subscription::take_message`].
    pub fn create_subscription<M: Message>(
        &self,
        topic: &str,
        qos: &QosProfile,
        callback: impl Fn(&Subscription<M>) + Send + Sync + 'static,
    ) -> Result<Subscription<M>> {
        self.ensure_open()?;
        let topic = self.resolve_name(topic);
        let transport = self.inner.context.transport();
        let id = transport.create_subscription(&topic, std::any::type_name::<M>(), qos)?;
        tracing::debug!(parent: &self.inner.span, %topic, %id, "subscription created");
        let subscription = Subscription::new(
            Arc::clone(transport),
            id,
            &topic,
            self.inner.span.clone(),
            callback,
        );
        self.track(subscription.as_waitable());
        Ok(subscription)
    }

    pub fn create_service<S: ServiceType>(
        &self,
        name: &str,
        qos: &QosProfile,
        handler: impl RequestHandler<S>,
    ) -> Result<Service<S>> {
        self.ensure_open()?;
        let name = self.resolve_name(name);
        let transport = self.inner.context.transport();
        let id = transport.create_service(&name, S::type_name(), qos)?;
        tracing::debug!(parent: &self.inner.span, service = %name, %id, "service created");
        let service = Service::new(
            Arc::clone(transport),
            id,
            &name,
            self.inner.span.clone(),
            handler,
        );
        self.track(service.as_waitable());
        Ok(service)
    }

    pub fn create_client<S: ServiceType>(&self, name: &str, qos: &QosProfile) -> Result<Client<S>> {
        self.ensure_open()?;
        let name = self.resolve_name(name);
        let transport = self.inner.context.transport();
        let id = transport.create_client(&name, S::type_name(), qos)?;
        tracing::debug!(parent: &self.inner.span, service = %name, %id, "client created");
        let client = Client::new(Arc::clone(transport), id, &name);
        self.track(client.as_waitable());
        Ok(client)
    }

    pub fn create_timer(
        &self,
        period: Duration,
        callback: impl Fn(&Timer) + Send + Sync + 'static,
    ) -> Result<Timer> {
        self.ensure_open()?;
        let timer = Timer::new(period, callback);
        self.track(timer.as_waitable());
        Ok(timer)
    }

    /// Creates an action server running `executor` for every goal request.
    pub fn create_action_server<A: Action>(
        &self,
        name: &str,
        executor: impl ExecuteGoal<A>,
        options: ActionServerOptions,
    ) -> Result<ActionServer<A>> {
        self.ensure_open()?;
        let name = self.resolve_name(name);
        let transport = self.inner.context.transport();
        let id = transport.create_action_server(
            &name,
            A::type_name(),
            &options.qos,
            options.result_timeout,
        )?;
        tracing::debug!(parent: &self.inner.span, action = %name, %id, "action server created");
        let server = ActionServer::new(
            Arc::clone(transport),
            id,
            &name,
            self.inner.span.clone(),
            Arc::new(executor),
            options.result_timeout,
        );
        self.track(server.as_waitable());
        Ok(server)
    }

    pub fn create_action_client<A: Action>(
        &self,
        name: &str,
        options: ActionClientOptions,
    ) -> Result<ActionClient<A>> {
        self.ensure_open()?;
        let name = self.resolve_name(name);
        let transport = self.inner.context.transport();
        let id = transport.create_action_client(&name, A::type_name(), &options.qos)?;
        tracing::debug!(parent: &self.inner.span, action = %name, %id, "action client created");
        let client = ActionClient::new(Arc::clone(transport), id, &name, self.inner.span.clone());
        self.track(client.as_waitable());
        Ok(client)
    }

    /// Live entities created through this node.
    pub(crate) fn resources(&self) -> Vec<Arc<dyn Waitable>> {
        self.inner.resources.live()
    }

    /// Runs a wait set over this node's entities until `cancel` fires.
    pub async fn spin(&self, cancel: &CancellationToken) -> Result<()> {
        let mut wait_set = self.inner.context.create_wait_set()?;
        wait_set.add_node(self);
        let result = wait_set.run(cancel).await;
        if let Err(err) = wait_set.close() {
            tracing::debug!(parent: &self.inner.span, %err, "failed to close spin wait set");
        }
        result
    }

    pub(crate) fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.inner))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes every entity created through the node.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed("node"));
        }
        tracing::debug!(parent: &self.inner.span, "closing node");
        self.inner.resources.close_all()
    }
}

fn normalize_namespace(namespace: &str) -> String {
    let trimmed = namespace.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn join(namespace: &str, name: &str) -> String {
    if namespace == "/" {
        format!("/{name}")
    } else {
        format!("{namespace}/{name}")
    }
}
