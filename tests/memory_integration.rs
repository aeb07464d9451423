//! Memory backend integration tests
//!
//! End-to-end tests exercising the full broker lifecycle against the
//! in-process backend. Covers fanout and queue-group delivery, typed
//! dispatch through both built-in codecs, manual acknowledgement,
//! cancellation, backpressure, metrics, and the managed server.

use polybus::{
    raw_handler, typed_binder, typed_handler, with_codec, with_ext, Broker, BrokerError,
    BrokerOption, BrokerState, BusServer, Delivery, Handler, MemoryBroker, MemoryOptions, Payload,
    PublishOptions, SubscribeOptions,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Order {
    id: String,
    total: f64,
}

async fn connected_broker(opts: Vec<BrokerOption>) -> MemoryBroker {
    let broker = MemoryBroker::new(opts);
    broker.init(vec![]).await.unwrap();
    broker.connect().await.unwrap();
    broker
}

fn counting_handler(count: Arc<AtomicU64>) -> Handler {
    raw_handler(move |_topic, _headers, _body| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

async fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(deadline, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition before timeout");
}

// ─── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_twice_no_duplicate_delivery() {
    let broker = connected_broker(vec![]).await;
    broker.connect().await.unwrap();

    let count = Arc::new(AtomicU64::new(0));
    broker
        .subscribe(
            "dup",
            counting_handler(count.clone()),
            None,
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    broker
        .publish("dup", Payload::raw(b"once".to_vec()), PublishOptions::default())
        .await
        .unwrap();

    eventually(Duration::from_secs(1), || count.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_closes_live_subscribers() {
    let broker = connected_broker(vec![]).await;
    let count = Arc::new(AtomicU64::new(0));
    let sub = broker
        .subscribe(
            "closing",
            counting_handler(count.clone()),
            None,
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    broker.disconnect().await.unwrap();
    assert!(sub.is_closed());
    assert_eq!(broker.state(), BrokerState::Disconnected);

    let err = broker
        .publish("closing", Payload::raw(b"x".to_vec()), PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidState { .. }));
}

// ─── Fanout & Queue Groups ───────────────────────────────────────

#[tokio::test]
async fn test_fanout_delivers_to_every_ungrouped_subscriber() {
    let broker = connected_broker(vec![]).await;
    let first = Arc::new(AtomicU64::new(0));
    let second = Arc::new(AtomicU64::new(0));

    broker
        .subscribe(
            "alerts",
            counting_handler(first.clone()),
            None,
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
    broker
        .subscribe(
            "alerts",
            counting_handler(second.clone()),
            None,
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    for _ in 0..3 {
        broker
            .publish("alerts", Payload::raw(b"ping".to_vec()), PublishOptions::default())
            .await
            .unwrap();
    }

    eventually(Duration::from_secs(1), || {
        first.load(Ordering::SeqCst) == 3 && second.load(Ordering::SeqCst) == 3
    })
    .await;
}

#[tokio::test]
async fn test_queue_group_members_compete() {
    let broker = connected_broker(vec![]).await;
    let first = Arc::new(AtomicU64::new(0));
    let second = Arc::new(AtomicU64::new(0));

    let grouped = || SubscribeOptions::new().queue("workers");
    broker
        .subscribe("jobs", counting_handler(first.clone()), None, grouped())
        .await
        .unwrap();
    broker
        .subscribe("jobs", counting_handler(second.clone()), None, grouped())
        .await
        .unwrap();

    for _ in 0..10 {
        broker
            .publish("jobs", Payload::raw(b"job".to_vec()), PublishOptions::default())
            .await
            .unwrap();
    }

    eventually(Duration::from_secs(1), || {
        first.load(Ordering::SeqCst) + second.load(Ordering::SeqCst) == 10
    })
    .await;

    // round-robin: both members saw work, nothing was double-delivered
    assert!(first.load(Ordering::SeqCst) > 0);
    assert!(second.load(Ordering::SeqCst) > 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first.load(Ordering::SeqCst) + second.load(Ordering::SeqCst), 10);
}

// ─── Typed Dispatch ──────────────────────────────────────────────

#[tokio::test]
async fn test_typed_roundtrip_with_headers() {
    let broker = connected_broker(vec![with_codec("json")]).await;
    let (tx, mut rx) = mpsc::channel::<(String, polybus::Headers, Order)>(8);

    broker
        .subscribe(
            "orders",
            typed_handler(move |topic, headers, body: Order| {
                let tx = tx.clone();
                async move {
                    tx.send((topic, headers, body))
                        .await
                        .map_err(|e| BrokerError::Handler(e.to_string()))
                }
            }),
            Some(typed_binder::<Order>()),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    broker
        .publish(
            "orders",
            Payload::typed(Order {
                id: "ORD-1".to_string(),
                total: 99.5,
            }),
            PublishOptions::new().header("trace-id", "abc123"),
        )
        .await
        .unwrap();

    let (topic, headers, order) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery before timeout")
        .expect("channel open");
    assert_eq!(topic, "orders");
    assert_eq!(headers.get("trace-id").map(String::as_str), Some("abc123"));
    assert_eq!(
        order,
        Order {
            id: "ORD-1".to_string(),
            total: 99.5,
        }
    );
}

#[tokio::test]
async fn test_msgpack_end_to_end() {
    let broker = connected_broker(vec![with_codec("msgpack")]).await;
    let (tx, mut rx) = mpsc::channel::<Order>(8);

    broker
        .subscribe(
            "orders.packed",
            typed_handler(move |_topic, _headers, body: Order| {
                let tx = tx.clone();
                async move {
                    tx.send(body)
                        .await
                        .map_err(|e| BrokerError::Handler(e.to_string()))
                }
            }),
            Some(typed_binder::<Order>()),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    broker
        .publish(
            "orders.packed",
            Payload::typed(Order {
                id: "ORD-2".to_string(),
                total: 7.25,
            }),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    let order = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery before timeout")
        .expect("channel open");
    assert_eq!(order.id, "ORD-2");
    assert_eq!(order.total, 7.25);
}

#[tokio::test]
async fn test_malformed_payload_never_reaches_typed_handler() {
    let broker = connected_broker(vec![with_codec("json")]).await;
    let count = Arc::new(AtomicU64::new(0));
    let seen = count.clone();

    broker
        .subscribe(
            "readings",
            typed_handler(move |_topic, _headers, _body: Order| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            Some(typed_binder::<Order>()),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    // not JSON at all, dropped by the decode stage
    broker
        .publish(
            "readings",
            Payload::raw(b"\xff\xfe garbage".to_vec()),
            PublishOptions::default(),
        )
        .await
        .unwrap();
    // valid JSON but the wrong shape for Order
    broker
        .publish(
            "readings",
            Payload::raw(b"[1,2,3]".to_vec()),
            PublishOptions::default(),
        )
        .await
        .unwrap();
    // well-formed, delivered exactly once
    broker
        .publish(
            "readings",
            Payload::typed(Order {
                id: "ok".to_string(),
                total: 1.0,
            }),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    eventually(Duration::from_secs(1), || {
        broker
            .metrics()
            .map(|m| m.decode_errors == 2 && m.delivered == 1)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let snap = broker.metrics().unwrap();
    assert_eq!(snap.nacked, 2);
    assert_eq!(snap.acked, 1);
}

// ─── Acknowledgement ─────────────────────────────────────────────

#[tokio::test]
async fn test_manual_ack_flow() {
    let broker = connected_broker(vec![]).await;
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);

    let handler: Handler = Arc::new(move |mut delivery: Delivery| {
        let tx = tx.clone();
        Box::pin(async move {
            let ack = delivery
                .take_ack()
                .ok_or_else(|| BrokerError::Ack("missing handle".to_string()))?;
            tx.send(delivery.message.body.to_vec()).await.ok();
            ack.ack().await
        })
    });

    broker
        .subscribe(
            "tasks",
            handler,
            None,
            SubscribeOptions::new().manual_ack(),
        )
        .await
        .unwrap();

    broker
        .publish("tasks", Payload::raw(b"t-1".to_vec()), PublishOptions::default())
        .await
        .unwrap();

    let body = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery before timeout")
        .expect("channel open");
    assert_eq!(body, b"t-1".to_vec());

    eventually(Duration::from_secs(1), || {
        broker.metrics().map(|m| m.acked == 1).unwrap_or(false)
    })
    .await;
}

// ─── Cancellation & Unsubscribe ──────────────────────────────────

#[tokio::test]
async fn test_canceling_context_stops_delivery() {
    let broker = connected_broker(vec![]).await;
    let count = Arc::new(AtomicU64::new(0));
    let token = CancellationToken::new();

    let sub = broker
        .subscribe(
            "feed",
            counting_handler(count.clone()),
            None,
            SubscribeOptions::new().context(token.clone()),
        )
        .await
        .unwrap();

    broker
        .publish("feed", Payload::raw(b"one".to_vec()), PublishOptions::default())
        .await
        .unwrap();
    eventually(Duration::from_secs(1), || count.load(Ordering::SeqCst) == 1).await;

    token.cancel();
    eventually(Duration::from_secs(1), || sub.is_closed()).await;

    broker
        .publish("feed", Payload::raw(b"two".to_vec()), PublishOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsubscribe_stops_further_deliveries() {
    let broker = connected_broker(vec![]).await;
    let count = Arc::new(AtomicU64::new(0));

    let sub = broker
        .subscribe(
            "stream",
            counting_handler(count.clone()),
            None,
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    broker
        .publish("stream", Payload::raw(b"first".to_vec()), PublishOptions::default())
        .await
        .unwrap();
    eventually(Duration::from_secs(1), || count.load(Ordering::SeqCst) == 1).await;

    sub.unsubscribe().await.unwrap();
    assert!(sub.is_closed());

    for _ in 0..5 {
        broker
            .publish("stream", Payload::raw(b"later".to_vec()), PublishOptions::default())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// ─── Backpressure ────────────────────────────────────────────────

#[tokio::test]
async fn test_full_buffer_drops_and_counts() {
    let broker = connected_broker(vec![with_ext(MemoryOptions {
        channel_capacity: 1,
    })])
    .await;

    let gate = Arc::new(Semaphore::new(0));
    let entered = Arc::new(AtomicU64::new(0));
    let handler: Handler = {
        let gate = gate.clone();
        let entered = entered.clone();
        Arc::new(move |_delivery: Delivery| {
            let gate = gate.clone();
            let entered = entered.clone();
            Box::pin(async move {
                entered.fetch_add(1, Ordering::SeqCst);
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|e| BrokerError::Handler(e.to_string()))?;
                Ok(())
            })
        })
    };
    broker
        .subscribe("burst", handler, None, SubscribeOptions::default())
        .await
        .unwrap();

    // first frame parks the handler on the gate, second fills the buffer,
    // third finds it full and is dropped
    broker
        .publish("burst", Payload::raw(b"1".to_vec()), PublishOptions::default())
        .await
        .unwrap();
    eventually(Duration::from_secs(1), || entered.load(Ordering::SeqCst) == 1).await;
    broker
        .publish("burst", Payload::raw(b"2".to_vec()), PublishOptions::default())
        .await
        .unwrap();
    broker
        .publish("burst", Payload::raw(b"3".to_vec()), PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(broker.metrics().unwrap().dropped, 1);

    gate.add_permits(2);
    eventually(Duration::from_secs(1), || entered.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(entered.load(Ordering::SeqCst), 2);
}

// ─── Concurrency ─────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_publish_50_tasks() {
    let broker = Arc::new(connected_broker(vec![]).await);
    let count = Arc::new(AtomicU64::new(0));
    broker
        .subscribe(
            "load",
            counting_handler(count.clone()),
            None,
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            broker
                .publish(
                    "load",
                    Payload::raw(format!("event-{}", i).into_bytes()),
                    PublishOptions::default(),
                )
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    eventually(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 50).await;
    let snap = broker.metrics().unwrap();
    assert_eq!(snap.published, 50);
    assert_eq!(snap.publish_errors, 0);
}

// ─── Bus Server ──────────────────────────────────────────────────

#[tokio::test]
async fn test_bus_server_full_lifecycle() {
    let server = BusServer::new(Arc::new(MemoryBroker::new(vec![with_codec("json")])));
    let (tx, mut rx) = mpsc::channel::<Order>(8);

    server
        .register_subscriber(
            "orders",
            typed_handler(move |_topic, _headers, body: Order| {
                let tx = tx.clone();
                async move {
                    tx.send(body)
                        .await
                        .map_err(|e| BrokerError::Handler(e.to_string()))
                }
            }),
            Some(typed_binder::<Order>()),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    server.start().await.unwrap();

    server
        .broker()
        .publish(
            "orders",
            Payload::typed(Order {
                id: "ORD-9".to_string(),
                total: 12.5,
            }),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery before timeout")
        .expect("channel open");
    assert_eq!(received.id, "ORD-9");

    let snap = server.metrics().unwrap();
    assert!(snap.published >= 1);
    assert!(snap.delivered >= 1);

    server.stop().await.unwrap();
    assert_eq!(server.broker().state(), BrokerState::Disconnected);
}
