// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Service round trips through the request correlator.

use parking_lot::Mutex;
use rclkit::transport::ServiceInfo;
use rclkit::{Client, Context, Error, QosProfile, ResponseSender, ServiceType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct AddTwoInts;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AddResponse {
    sum: i64,
}

impl ServiceType for AddTwoInts {
    type Request = AddRequest;
    type Response = AddResponse;
}

type Pending = Arc<Mutex<Vec<(AddRequest, ResponseSender<AddTwoInts>)>>>;

/// Spins a context with an `add` service and returns a client for it.
///
/// With `hold` set, the service parks requests in the returned list instead
/// of answering them.
fn start(hold: bool) -> (Client<AddTwoInts>, Pending, CancellationToken, JoinHandle<rclkit::Result<()>>) {
    let context = Context::loopback();
    let node = context.create_node("adder", "/").expect("create node");
    let qos = QosProfile::services_default();
    let pending: Pending = Arc::new(Mutex::new(Vec::new()));

    let parked = pending.clone();
    let service = node
        .create_service::<AddTwoInts>(
            "add",
            &qos,
            move |_info: &ServiceInfo, request: AddRequest, responder: ResponseSender<AddTwoInts>| {
                if hold {
                    parked.lock().push((request, responder));
                } else {
                    let sum = request.a + request.b;
                    responder.send(&AddResponse { sum }).expect("send response");
                }
            },
        )
        .expect("create service");
    let client = node.create_client::<AddTwoInts>("add", &qos).expect("create client");

    let cancel = CancellationToken::new();
    let spin = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _service = service;
            context.spin(&cancel).await
        })
    };
    (client, pending, cancel, spin)
}

async fn wait_for_pending(pending: &Pending, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while pending.lock().len() < count {
        assert!(tokio::time::Instant::now() < deadline, "requests never arrived");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_get_their_own_response() {
    let (client, _, cancel, spin) = start(false);

    let calls = (0..20).map(|i| {
        let client = client.clone();
        let cancel = cancel.clone();
        async move {
            let response = client
                .send(&cancel, &AddRequest { a: i, b: 100 })
                .await
                .expect("send");
            (i, response.sum)
        }
    });
    for (i, sum) in futures::future::join_all(calls).await {
        assert_eq!(sum, i + 100);
    }
    assert_eq!(client.pending_requests(), 0);

    cancel.cancel();
    assert!(spin.await.expect("spin task").unwrap_err().is_canceled());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_responses_out_of_order() {
    let (client, pending, cancel, spin) = start(true);

    let calls: Vec<_> = (0..5)
        .map(|i| {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.send(&cancel, &AddRequest { a: i, b: i }).await })
        })
        .collect();
    wait_for_pending(&pending, 5).await;

    let parked: Vec<_> = pending.lock().drain(..).collect();
    for (request, responder) in parked.into_iter().rev() {
        let sum = request.a + request.b;
        responder.send(&AddResponse { sum }).expect("send response");
    }
    for (i, call) in (0..5).zip(calls) {
        let response = call.await.expect("call task").expect("send");
        assert_eq!(response.sum, 2 * i);
    }

    cancel.cancel();
    let _ = spin.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_pending_request() {
    let (client, pending, cancel, spin) = start(true);

    let request_cancel = CancellationToken::new();
    let call = {
        let client = client.clone();
        let request_cancel = request_cancel.clone();
        tokio::spawn(async move { client.send(&request_cancel, &AddRequest { a: 1, b: 2 }).await })
    };
    wait_for_pending(&pending, 1).await;
    assert_eq!(client.pending_requests(), 1);

    request_cancel.cancel();
    let err = call.await.expect("call task").unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(client.pending_requests(), 0);

    // A late response for the canceled request is dropped.
    let (_, responder) = pending.lock().pop().expect("parked request");
    responder.send(&AddResponse { sum: 3 }).expect("send response");

    cancel.cancel();
    let _ = spin.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_timeout() {
    let (client, _pending, cancel, spin) = start(true);

    let err = client
        .send_timeout(&cancel, &AddRequest { a: 1, b: 1 }, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(client.pending_requests(), 0);

    cancel.cancel();
    let _ = spin.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_fails_pending_requests() {
    let (client, pending, cancel, spin) = start(true);

    let call = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.send(&cancel, &AddRequest { a: 1, b: 2 }).await })
    };
    wait_for_pending(&pending, 1).await;

    client.close().expect("close client");
    let err = call.await.expect("call task").unwrap_err();
    assert!(matches!(err, Error::Closed));
    assert!(matches!(
        client.send(&cancel, &AddRequest { a: 0, b: 0 }).await,
        Err(Error::AlreadyClosed("client"))
    ));

    cancel.cancel();
    let _ = spin.await;
}
