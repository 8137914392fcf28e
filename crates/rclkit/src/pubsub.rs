// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed topic endpoints.

use crate::error::Result;
use crate::message::{decode, encode, Message};
use crate::transport::{EntityId, MessageInfo, ReadyMask, TopicChannel, Transport};
use crate::waitable::{EntityHandle, Reservation, Waitable, WaitableKind};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Publishes messages of type `M` on one topic.
pub struct Publisher<M> {
    handle: EntityHandle,
    topic: String,
    _marker: PhantomData<fn(M)>,
}

impl<M: Message> Publisher<M> {
    pub(crate) fn new(transport: Arc<dyn Transport>, id: EntityId, topic: &str) -> Self {
        Self {
            handle: EntityHandle::new(transport, id, "publisher"),
            topic: topic.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn publish(&self, msg: &M) -> Result<()> {
        self.handle.ensure_open()?;
        let payload = encode(msg)?;
        self.handle
            .transport()
            .publish(self.handle.id(), TopicChannel::Topic, &payload)?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.handle.close()
    }
}

type SubscriptionCallback<M> = Box<dyn Fn(&Subscription<M>) + Send + Sync>;

/// Receives messages of type `M` from one topic.
///
/// When the wait set finds the subscription ready it invokes the callback
/// with the subscription itself; the callback pulls messages with
/// [`take_message`](Subscription::take_message).
pub struct Subscription<M> {
    inner: Arc<SubscriptionInner<M>>,
}

impl<M> Clone for Subscription<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SubscriptionInner<M> {
    handle: EntityHandle,
    topic: String,
    span: tracing::Span,
    callback: SubscriptionCallback<M>,
}

impl<M: Message> Subscription<M> {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        id: EntityId,
        topic: &str,
        span: tracing::Span,
        callback: impl Fn(&Subscription<M>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                handle: EntityHandle::new(transport, id, "subscription"),
                topic: topic.to_string(),
                span,
                callback: Box::new(callback),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Takes one message, `None` if nothing is queued.
    pub fn take_message(&self) -> Result<Option<(M, MessageInfo)>> {
        let handle = &self.inner.handle;
        handle.ensure_open()?;
        match handle
            .transport()
            .take_message(handle.id(), TopicChannel::Topic)?
        {
            Some((info, payload)) => Ok(Some((decode(&payload)?, info))),
            None => Ok(None),
        }
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub(crate) fn as_waitable(&self) -> Arc<dyn Waitable> {
        self.inner.clone()
    }
}

impl<M: Message> Waitable for SubscriptionInner<M> {
    fn kind(&self) -> WaitableKind {
        WaitableKind::Subscription
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
        let span = self.span.clone();
        let _entered = span.enter();
        tracing::trace!(topic = %self.topic, "subscription ready");
        let subscription = Subscription { inner: self };
        (subscription.inner.callback)(&subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::QosProfile;
    use crate::transport::LoopbackTransport;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chatter {
        data: String,
    }

    #[test]
    fn test_publish_take() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let qos = QosProfile::default();
        let type_name = std::any::type_name::<Chatter>();
        let publisher = Publisher::<Chatter>::new(
            transport.clone(),
            transport.create_publisher("chatter", type_name, &qos).unwrap(),
            "chatter",
        );
        let subscription = Subscription::<Chatter>::new(
            transport.clone(),
            transport
                .create_subscription("chatter", type_name, &qos)
                .unwrap(),
            "chatter",
            tracing::Span::none(),
            |_| {},
        );

        let msg = Chatter {
            data: "hello".into(),
        };
        publisher.publish(&msg).unwrap();
        let (received, info) = subscription.take_message().unwrap().unwrap();
        assert_eq!(received, msg);
        assert_eq!(info.publisher, transport_id(&publisher));
        assert!(subscription.take_message().unwrap().is_none());

        publisher.close().unwrap();
        assert!(publisher.publish(&msg).is_err());
    }

    fn transport_id<M: Message>(publisher: &Publisher<M>) -> EntityId {
        publisher.handle.id()
    }
}
