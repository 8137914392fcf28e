// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response services.
//!
//! A [`Service`] takes one request per ready cycle and hands it to the user
//! handler together with a [`ResponseSender`] bound to the request id. A
//! [`Client`] sends requests through a
//! [`RequestCorrelator`](crate::correlator::RequestCorrelator) and awaits the
//! matching response.

use crate::correlator::{RequestCorrelator, TransportChannel};
use crate::error::Result;
use crate::message::{decode, encode, ServiceType};
use crate::transport::{EntityId, ReadyMask, RequestId, ServiceChannel, ServiceInfo, Transport};
use crate::waitable::{EntityHandle, Reservation, Waitable, WaitableKind};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Handler for incoming service requests.
///
/// Runs synchronously on the wait set's task; long work should be moved to
/// a spawned task together with the [`ResponseSender`].
pub trait RequestHandler<S: ServiceType>: Send + Sync + 'static {
    fn handle(&self, info: &ServiceInfo, request: S::Request, responder: ResponseSender<S>);
}

impl<S, F> RequestHandler<S> for F
where
    S: ServiceType,
    F: Fn(&ServiceInfo, S::Request, ResponseSender<S>) + Send + Sync + 'static,
{
    fn handle(&self, info: &ServiceInfo, request: S::Request, responder: ResponseSender<S>) {
        (self)(info, request, responder)
    }
}

/// Sends the single response to one request.
pub struct ResponseSender<S> {
    transport: Arc<dyn Transport>,
    entity: EntityId,
    request_id: RequestId,
    _marker: PhantomData<fn(S)>,
}

impl<S: ServiceType> ResponseSender<S> {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Sends `response`, consuming the sender.
    pub fn send(self, response: &S::Response) -> Result<()> {
        let payload = encode(response)?;
        self.transport.send_response(
            self.entity,
            ServiceChannel::Service,
            &self.request_id,
            &payload,
        )?;
        Ok(())
    }
}

/// Serves requests of service type `S`.
pub struct Service<S: ServiceType> {
    inner: Arc<ServiceInner<S>>,
}

impl<S: ServiceType> Clone for Service<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServiceInner<S: ServiceType> {
    handle: EntityHandle,
    name: String,
    span: tracing::Span,
    handler: Box<dyn RequestHandler<S>>,
}

impl<S: ServiceType> Service<S> {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        id: EntityId,
        name: &str,
        span: tracing::Span,
        handler: impl RequestHandler<S>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                handle: EntityHandle::new(transport, id, "service"),
                name: name.to_string(),
                span,
                handler: Box::new(handler),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub(crate) fn as_waitable(&self) -> Arc<dyn Waitable> {
        self.inner.clone()
    }
}

impl<S: ServiceType> ServiceInner<S> {
    fn handle_request(&self) -> Result<()> {
        let transport = self.handle.transport();
        let Some((info, payload)) =
            transport.take_request(self.handle.id(), ServiceChannel::Service)?
        else {
            return Ok(());
        };
        let request: S::Request = decode(&payload)?;
        let responder = ResponseSender {
            transport: Arc::clone(transport),
            entity: self.handle.id(),
            request_id: info.request_id,
            _marker: PhantomData,
        };
        self.handler.handle(&info, request, responder);
        Ok(())
    }
}

impl<S: ServiceType> Waitable for ServiceInner<S> {
    fn kind(&self) -> WaitableKind {
        WaitableKind::Service
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
        let _entered = self.span.enter();
        if let Err(err) = self.handle_request() {
            tracing::warn!(service = %self.name, %err, "failed to handle request");
        }
    }
}

/// Calls a service of type `S`.
pub struct Client<S: ServiceType> {
    inner: Arc<ClientInner>,
    _marker: PhantomData<fn(S)>,
}

impl<S: ServiceType> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

struct ClientInner {
    handle: EntityHandle,
    name: String,
    correlator: RequestCorrelator<TransportChannel>,
}

impl<S: ServiceType> Client<S> {
    pub(crate) fn new(transport: Arc<dyn Transport>, id: EntityId, name: &str) -> Self {
        let channel = TransportChannel::new(Arc::clone(&transport), id, ServiceChannel::Service);
        Self {
            inner: Arc::new(ClientInner {
                handle: EntityHandle::new(transport, id, "client"),
                name: name.to_string(),
                correlator: RequestCorrelator::new(channel, "service"),
            }),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Sends `request` and waits for the response.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: &S::Request,
    ) -> Result<S::Response> {
        self.send_with_info(cancel, request)
            .await
            .map(|(response, _)| response)
    }

    /// Like [`send`](Client::send), also returning the response metadata.
    pub async fn send_with_info(
        &self,
        cancel: &CancellationToken,
        request: &S::Request,
    ) -> Result<(S::Response, ServiceInfo)> {
        self.inner.handle.ensure_open()?;
        let payload = encode(request)?;
        let response = self.inner.correlator.send(cancel, &payload).await?;
        Ok((decode(&response.payload)?, response.info))
    }

    /// Like [`send`](Client::send), failing with
    /// [`Error::Timeout`](crate::Error::Timeout) after `timeout`.
    pub async fn send_timeout(
        &self,
        cancel: &CancellationToken,
        request: &S::Request,
        timeout: Duration,
    ) -> Result<S::Response> {
        self.inner.handle.ensure_open()?;
        let payload = encode(request)?;
        let response = self
            .inner
            .correlator
            .send_timeout(cancel, &payload, timeout)
            .await?;
        decode(&response.payload)
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Fails pending requests with [`Error::Closed`](crate::Error::Closed)
    /// and destroys the client.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub(crate) fn as_waitable(&self) -> Arc<dyn Waitable> {
        self.inner.clone()
    }
}

impl Waitable for ClientInner {
    fn kind(&self) -> WaitableKind {
        WaitableKind::Client
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
        self.correlator.close();
        self.handle.close()
    }

    fn on_ready(self: Arc<Self>, _ready: ReadyMask, _cancel: &CancellationToken) {
        self.correlator.handle_response();
    }
}
