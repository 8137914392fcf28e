// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response correlation.
//!
//! A [`RequestCorrelator`] turns a fire-and-forget request channel into an
//! async call: every request gets the next sequence number and a one-shot
//! receptacle in the pending table, and responses taken by the wait set are
//! routed back to the receptacle carrying their sequence number. Arrival
//! order does not matter.

use crate::error::{Error, Result};
use crate::transport::{EntityId, SequenceNumber, ServiceChannel, ServiceInfo, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A response delivered to a pending request.
#[derive(Debug, Clone)]
pub struct Response {
    pub info: ServiceInfo,
    pub payload: Vec<u8>,
}

/// One request/response channel of a client entity.
pub trait RequestChannel: Send + Sync + 'static {
    fn send_request(&self, sequence_number: SequenceNumber, payload: &[u8]) -> Result<()>;

    /// Takes one queued response, `None` if nothing is queued.
    fn take_response(&self) -> Result<Option<(ServiceInfo, Vec<u8>)>>;
}

/// [`RequestChannel`] bound to a transport entity and channel selector.
pub(crate) struct TransportChannel {
    transport: Arc<dyn Transport>,
    entity: EntityId,
    channel: ServiceChannel,
}

impl TransportChannel {
    pub(crate) fn new(transport: Arc<dyn Transport>, entity: EntityId, channel: ServiceChannel) -> Self {
        Self {
            transport,
            entity,
            channel,
        }
    }
}

impl RequestChannel for TransportChannel {
    fn send_request(&self, sequence_number: SequenceNumber, payload: &[u8]) -> Result<()> {
        self.transport
            .send_request(self.entity, self.channel, sequence_number, payload)?;
        Ok(())
    }

    fn take_response(&self) -> Result<Option<(ServiceInfo, Vec<u8>)>> {
        Ok(self.transport.take_response(self.entity, self.channel)?)
    }
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    slots: HashMap<SequenceNumber, oneshot::Sender<Response>>,
}

/// Matches responses to in-flight requests by sequence number.
pub struct RequestCorrelator<C> {
    channel: C,
    name: &'static str,
    sequence: AtomicI64,
    pending: Mutex<PendingTable>,
}

/// Removes a registration when the waiting call finishes, whatever the
/// outcome.
struct PendingGuard<'a, C> {
    correlator: &'a RequestCorrelator<C>,
    sequence_number: SequenceNumber,
}

impl<C> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        self.correlator
            .pending
            .lock()
            .slots
            .remove(&self.sequence_number);
    }
}

impl<C: RequestChannel> RequestCorrelator<C> {
    /// `name` labels log lines, e.g. "goal" or the service name.
    pub fn new(channel: C, name: &'static str) -> Self {
        Self {
            channel,
            name,
            sequence: AtomicI64::new(1),
            pending: Mutex::new(PendingTable::default()),
        }
    }

    /// Sends `payload` and waits for the matching response.
    ///
    /// The receptacle is registered before the payload reaches the
    /// transport, so a response can never arrive unmatched. Fails with
    /// [`Error::Canceled`] when `cancel` fires and [`Error::Closed`] when the
    /// correlator is closed before or during the wait.
    pub async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<Response> {
        let (sequence_number, rx) = self.register()?;
        let _guard = PendingGuard {
            correlator: self,
            sequence_number,
        };

        self.channel.send_request(sequence_number, payload)?;
        tracing::trace!(channel = self.name, sequence_number, "request sent");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Canceled),
            response = rx => response.map_err(|_| Error::Closed),
        }
    }

    /// [`send`](Self::send) bounded by `timeout`.
    pub async fn send_timeout(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Response> {
        tokio::time::timeout(timeout, self.send(cancel, payload))
            .await
            .map_err(|_| Error::Timeout)?
    }

    fn register(&self) -> Result<(SequenceNumber, oneshot::Receiver<Response>)> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(Error::Closed);
        }
        let sequence_number = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.slots.insert(sequence_number, tx);
        Ok((sequence_number, rx))
    }

    /// Takes one response from the channel and completes its receptacle.
    /// Called by the wait set when the channel is ready.
    pub fn handle_response(&self) {
        let (info, payload) = match self.channel.take_response() {
            Ok(Some(response)) => response,
            Ok(None) => {
                tracing::debug!(channel = self.name, "response was ready but none could be taken");
                return;
            }
            Err(err) => {
                tracing::warn!(channel = self.name, %err, "failed to take response");
                return;
            }
        };

        let sequence_number = info.request_id.sequence_number;
        let slot = self.pending.lock().slots.remove(&sequence_number);
        match slot {
            Some(tx) => {
                // The waiter may have given up in the meantime.
                let _ = tx.send(Response { info, payload });
            }
            None => {
                tracing::debug!(
                    channel = self.name,
                    sequence_number,
                    "dropping response without a pending request"
                );
            }
        }
    }

    /// Fails every pending request with [`Error::Closed`] and rejects new
    /// ones.
    pub fn close(&self) {
        let slots = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.slots)
        };
        if !slots.is_empty() {
            tracing::debug!(channel = self.name, count = slots.len(), "closing pending requests");
        }
        drop(slots);
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RequestId;
    use std::collections::VecDeque;
    use std::time::SystemTime;

    /// Channel that records requests and replays scripted responses.
    #[derive(Default)]
    struct ScriptedChannel {
        sent: Mutex<Vec<(SequenceNumber, Vec<u8>)>>,
        responses: Mutex<VecDeque<(ServiceInfo, Vec<u8>)>>,
        fail_send: bool,
    }

    impl ScriptedChannel {
        fn respond(&self, sequence_number: SequenceNumber, payload: &[u8]) {
            let now = SystemTime::now();
            self.responses.lock().push_back((
                ServiceInfo {
                    source_timestamp: now,
                    received_timestamp: now,
                    request_id: RequestId {
                        client: EntityId::from_raw(1),
                        sequence_number,
                    },
                },
                payload.to_vec(),
            ));
        }
    }

    impl RequestChannel for Arc<ScriptedChannel> {
        fn send_request(&self, sequence_number: SequenceNumber, payload: &[u8]) -> Result<()> {
            if self.fail_send {
                return Err(crate::transport::TransportError::Shutdown.into());
            }
            self.sent.lock().push((sequence_number, payload.to_vec()));
            Ok(())
        }

        fn take_response(&self) -> Result<Option<(ServiceInfo, Vec<u8>)>> {
            Ok(self.responses.lock().pop_front())
        }
    }

    fn correlator() -> (Arc<ScriptedChannel>, Arc<RequestCorrelator<Arc<ScriptedChannel>>>) {
        let channel = Arc::new(ScriptedChannel::default());
        let correlator = Arc::new(RequestCorrelator::new(channel.clone(), "test"));
        (channel, correlator)
    }

    async fn wait_for_sent(channel: &ScriptedChannel, count: usize) {
        while channel.sent.lock().len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_out_of_order_responses_are_matched() {
        let (channel, correlator) = correlator();
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let correlator = correlator.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let response = correlator.send(&cancel, &[i]).await.unwrap();
                (i, response.payload)
            }));
        }
        wait_for_sent(&channel, 8).await;

        let mut sent = channel.sent.lock().clone();
        sent.reverse();
        for (seq, payload) in &sent {
            channel.respond(*seq, &[payload[0] + 100]);
            correlator.handle_response();
        }

        for task in tasks {
            let (i, payload) = task.await.unwrap();
            assert_eq!(payload, vec![i + 100]);
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_registration() {
        let (channel, correlator) = correlator();
        let cancel = CancellationToken::new();

        let task = {
            let correlator = correlator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { correlator.send(&cancel, b"x").await })
        };
        wait_for_sent(&channel, 1).await;
        assert_eq!(correlator.pending_count(), 1);

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(Error::Canceled)));
        assert_eq!(correlator.pending_count(), 0);

        // A late response is dropped.
        channel.respond(1, b"late");
        correlator.handle_response();
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let (_channel, correlator) = correlator();
        let cancel = CancellationToken::new();
        let err = correlator
            .send_timeout(&cancel, b"x", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_future_sends() {
        let (channel, correlator) = correlator();
        let cancel = CancellationToken::new();

        let task = {
            let correlator = correlator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { correlator.send(&cancel, b"x").await })
        };
        wait_for_sent(&channel, 1).await;

        correlator.close();
        assert!(correlator.is_closed());
        assert!(matches!(task.await.unwrap(), Err(Error::Closed)));
        assert!(matches!(
            correlator.send(&cancel, b"y").await,
            Err(Error::Closed)
        ));
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_unregisters() {
        let channel = Arc::new(ScriptedChannel {
            fail_send: true,
            ..Default::default()
        });
        let correlator = RequestCorrelator::new(channel, "test");
        let err = correlator
            .send(&CancellationToken::new(), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic() {
        let (channel, correlator) = correlator();
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let _ = correlator
                .send_timeout(&cancel, b"x", Duration::from_millis(1))
                .await;
        }
        let seqs: Vec<_> = channel.sent.lock().iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
