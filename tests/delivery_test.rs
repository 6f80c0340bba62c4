//! Delivery contract tests against the in-memory broker.
//!
//! Covers idempotent declaration, mandatory publish, prefetch backpressure,
//! at-least-once redelivery after a crash, ordering under prefetch 1, and
//! durability across a broker restart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use orderq::broker::memory::{JournalEntry, JournalKind, MemoryBroker, MemorySession};
use orderq::broker::{Delivery, DeliveryStream, PublishOptions, QueueSpec, Session, Transport};
use orderq::config::{Credentials, Endpoint, ProducerSettings};
use orderq::consumer::{Consumer, OrderHandler, Shutdown};
use orderq::error::{Error, Result};
use orderq::generator::generate_with;
use orderq::model::Order;
use orderq::producer::Producer;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::Notify;

fn endpoint() -> Endpoint {
    Endpoint::new("memory")
}

fn guest() -> Credentials {
    Credentials::new("guest", "guest")
}

fn orders(n: usize, seed: u64) -> Vec<Order> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| generate_with(&mut rng, chrono::Utc::now())).collect()
}

fn unpaced(batch_count: usize) -> ProducerSettings {
    ProducerSettings {
        batch_count,
        publish_interval_ms: 0,
    }
}

async fn publish_all(broker: &MemoryBroker, spec: &QueueSpec, batch: &[Order]) {
    let producer = Producer::connect(broker, &endpoint(), &guest(), spec)
        .await
        .unwrap();
    let mut next = batch.iter().cloned();
    let report = producer
        .run(&unpaced(batch.len()), || next.next().unwrap())
        .await
        .unwrap();
    assert_eq!(report.published, batch.len());
}

async fn consumer(
    broker: &MemoryBroker,
    spec: &QueueSpec,
    prefetch: u16,
) -> Consumer<MemorySession> {
    Consumer::connect(broker, &endpoint(), &guest(), spec, prefetch)
        .await
        .unwrap()
}

/// Poll until `cond` holds, failing the test after a generous timeout.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn count(journal: &[JournalEntry], kind: JournalKind) -> usize {
    journal.iter().filter(|e| e.kind == kind).count()
}

/// Records each order and sleeps a fixed time.
#[derive(Default)]
struct Recording {
    delay: Duration,
    seen: Mutex<Vec<(Order, bool)>>,
}

#[async_trait]
impl OrderHandler for Recording {
    async fn handle(&self, order: &Order, delivery: &Delivery) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.seen
            .lock()
            .unwrap()
            .push((order.clone(), delivery.redelivered()));
        Ok(())
    }
}

async fn drain(
    broker: &MemoryBroker,
    spec: &QueueSpec,
    prefetch: u16,
    handler: Arc<Recording>,
    expect_acks: usize,
) -> orderq::consumer::ConsumeReport {
    let consumer = consumer(broker, spec, prefetch).await;
    let shutdown: Shutdown = consumer.shutdown_handle();
    let task = tokio::spawn(async move { consumer.run(handler.as_ref()).await });
    wait_until(|| count(&broker.journal(), JournalKind::Acked) >= expect_acks).await;
    shutdown.trigger();
    task.await.unwrap().unwrap()
}

// ---------------------------------------------------------------------------
// Declaration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn declaring_twice_with_same_flags_is_a_no_op() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");

    let a = broker.connect(&endpoint(), &guest()).await.unwrap();
    let b = broker.connect(&endpoint(), &guest()).await.unwrap();
    a.declare_queue(&spec).await.unwrap();
    a.declare_queue(&spec).await.unwrap();
    b.declare_queue(&spec).await.unwrap();

    assert_eq!(broker.queue_count(), 1);
    assert!(broker.queue_exists("orders-task"));
}

#[tokio::test]
async fn declaring_with_different_flags_conflicts() {
    let broker = MemoryBroker::new();
    let session = broker.connect(&endpoint(), &guest()).await.unwrap();
    session
        .declare_queue(&QueueSpec::durable("orders-task"))
        .await
        .unwrap();

    let transient = QueueSpec {
        durable: false,
        ..QueueSpec::durable("orders-task")
    };
    assert!(matches!(
        session.declare_queue(&transient).await,
        Err(Error::QueueConflict { .. })
    ));

    let limited = QueueSpec::durable("orders-task").max_deliveries(Some(3));
    assert!(matches!(
        session.declare_queue(&limited).await,
        Err(Error::QueueConflict { .. })
    ));
    assert_eq!(broker.queue_count(), 1);
}

#[tokio::test]
async fn consumer_and_producer_may_declare_in_either_order() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");

    let consumer = consumer(&broker, &spec, 1).await;
    publish_all(&broker, &spec, &orders(1, 1)).await;
    consumer.close().await.unwrap();

    assert_eq!(broker.ready_count("orders-task"), 1);
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publishing_to_missing_queue_is_unroutable() {
    let broker = MemoryBroker::new();
    let session = broker.connect(&endpoint(), &guest()).await.unwrap();
    let producer = Producer::new(session, "no-such-queue");

    let order = orders(1, 2).remove(0);
    assert!(matches!(
        producer.publish(&order).await,
        Err(Error::Unroutable { .. })
    ));

    assert!(!broker.queue_exists("no-such-queue"));
    assert_eq!(count(&broker.journal(), JournalKind::Published), 0);
}

#[tokio::test]
async fn unroutable_orders_do_not_abort_the_batch() {
    let broker = MemoryBroker::new();
    let session = broker.connect(&endpoint(), &guest()).await.unwrap();
    let producer = Producer::new(session, "no-such-queue");

    let report = producer
        .run(&unpaced(4), || orders(1, 3).remove(0))
        .await
        .unwrap();
    assert_eq!(report.published, 0);
    assert_eq!(report.unroutable, 4);
}

#[tokio::test]
async fn connection_loss_aborts_batch_but_keeps_published_orders() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");
    let producer = Producer::connect(&broker, &endpoint(), &guest(), &spec)
        .await
        .unwrap();

    let restarter = broker.clone();
    let mut calls = 0;
    let result = producer
        .run(&unpaced(5), || {
            calls += 1;
            if calls == 3 {
                restarter.restart();
            }
            orders(1, calls).remove(0)
        })
        .await;

    assert!(matches!(result, Err(Error::SessionClosed)));
    assert_eq!(calls, 3);
    assert_eq!(broker.ready_count("orders-task"), 2);
}

#[tokio::test]
async fn pacing_spaces_out_publishes() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");
    let producer = Producer::connect(&broker, &endpoint(), &guest(), &spec)
        .await
        .unwrap();

    let settings = ProducerSettings {
        batch_count: 3,
        publish_interval_ms: 40,
    };
    let batch = orders(3, 9);
    let mut next = batch.into_iter();
    producer.run(&settings, || next.next().unwrap()).await.unwrap();

    let published: Vec<Instant> = broker
        .journal()
        .iter()
        .filter(|e| e.kind == JournalKind::Published)
        .map(|e| e.at)
        .collect();
    assert_eq!(published.len(), 3);
    for pair in published.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(40));
    }
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prefetch_one_holds_back_second_delivery_until_ack() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");
    publish_all(&broker, &spec, &orders(2, 4)).await;

    let session = broker.connect(&endpoint(), &guest()).await.unwrap();
    session.declare_queue(&spec).await.unwrap();
    session.set_prefetch(1).await.unwrap();
    let mut deliveries = session.subscribe("orders-task", "test").await.unwrap();

    let first = deliveries.next_delivery().await.unwrap().unwrap();
    let blocked =
        tokio::time::timeout(Duration::from_millis(100), deliveries.next_delivery()).await;
    assert!(blocked.is_err(), "second delivery must wait for the first ack");
    assert_eq!(broker.unacked_count(), 1);

    session.ack(first).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), deliveries.next_delivery())
        .await
        .expect("delivery after ack")
        .unwrap()
        .unwrap();
    assert!(!second.redelivered());
}

#[tokio::test]
async fn prefetch_one_never_has_two_outstanding() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");
    publish_all(&broker, &spec, &orders(5, 5)).await;

    let handler = Arc::new(Recording {
        delay: Duration::from_millis(10),
        ..Default::default()
    });
    let report = drain(&broker, &spec, 1, handler, 5).await;
    assert_eq!(report.acked, 5);

    let mut outstanding: i64 = 0;
    let mut peak = 0;
    for entry in broker.journal() {
        match entry.kind {
            JournalKind::Delivered => outstanding += 1,
            JournalKind::Acked | JournalKind::Rejected | JournalKind::Requeued => {
                outstanding -= 1
            }
            _ => {}
        }
        peak = peak.max(outstanding);
    }
    assert_eq!(peak, 1);
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_orders_are_acked_in_publish_order_after_the_work_delay() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");
    let batch = orders(3, 6);
    publish_all(&broker, &spec, &batch).await;

    let delay = Duration::from_millis(50);
    let handler = Arc::new(Recording {
        delay,
        ..Default::default()
    });
    let report = drain(&broker, &spec, 1, Arc::clone(&handler), 3).await;
    assert_eq!(report.acked, 3);

    let seen: Vec<Order> = handler
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|(o, _)| o.clone())
        .collect();
    assert_eq!(seen, batch);

    let journal = broker.journal();
    let ids = |kind: JournalKind| -> Vec<u64> {
        journal
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.message_id)
            .collect()
    };
    assert_eq!(ids(JournalKind::Delivered), ids(JournalKind::Published));
    assert_eq!(ids(JournalKind::Acked), ids(JournalKind::Published));

    let position = |kind: JournalKind, id: u64| {
        journal
            .iter()
            .position(|e| e.kind == kind && e.message_id == id)
            .unwrap()
    };
    let published = ids(JournalKind::Published);
    for (i, id) in published.iter().enumerate() {
        let delivered = &journal[position(JournalKind::Delivered, *id)];
        let acked = &journal[position(JournalKind::Acked, *id)];
        assert!(acked.at.duration_since(delivered.at) >= delay);
        if let Some(next) = published.get(i + 1) {
            let next_delivered = position(JournalKind::Delivered, *next);
            assert!(position(JournalKind::Acked, *id) < next_delivered);
            assert!(acked.at <= journal[next_delivered].at);
        }
    }
}

// ---------------------------------------------------------------------------
// At-least-once
// ---------------------------------------------------------------------------

/// Finishes the work, then hangs before the ack so the test can kill it.
struct HangAfterWork {
    worked: Arc<AtomicUsize>,
    done: Arc<Notify>,
}

#[async_trait]
impl OrderHandler for HangAfterWork {
    async fn handle(&self, _order: &Order, _delivery: &Delivery) -> Result<()> {
        self.worked.fetch_add(1, Ordering::SeqCst);
        self.done.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn crash_between_work_and_ack_redelivers_exactly_once() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");
    let batch = orders(1, 8);
    publish_all(&broker, &spec, &batch).await;

    let worked = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Notify::new());
    let crashing = consumer(&broker, &spec, 1).await;
    let handler = HangAfterWork {
        worked: Arc::clone(&worked),
        done: Arc::clone(&done),
    };
    let task = tokio::spawn(async move { crashing.run(&handler).await });

    done.notified().await;
    assert_eq!(broker.unacked_count(), 1);
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    // The killed consumer's session is gone, so the message is back.
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count("orders-task"), 1);

    let handler = Arc::new(Recording::default());
    let report = drain(&broker, &spec, 1, Arc::clone(&handler), 1).await;
    assert_eq!(report.acked, 1);

    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(batch[0].clone(), true)]);
    assert_eq!(worked.load(Ordering::SeqCst), 1);

    let journal = broker.journal();
    assert_eq!(count(&journal, JournalKind::Delivered), 2);
    assert_eq!(count(&journal, JournalKind::Requeued), 1);
    assert_eq!(count(&journal, JournalKind::Acked), 1);
    assert_eq!(broker.ready_count("orders-task"), 0);
}

struct Failing;

#[async_trait]
impl OrderHandler for Failing {
    async fn handle(&self, _order: &Order, _delivery: &Delivery) -> Result<()> {
        Err(Error::Other("inventory service down".to_string()))
    }
}

#[tokio::test]
async fn processing_failure_stops_consumer_and_requeues() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");
    publish_all(&broker, &spec, &orders(2, 10)).await;

    let failing = consumer(&broker, &spec, 1).await;
    match failing.run(&Failing).await {
        Err(Error::Processing(msg)) => assert!(msg.contains("inventory service down")),
        other => panic!("expected processing failure, got {other:?}"),
    }

    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count("orders-task"), 2);

    let handler = Arc::new(Recording::default());
    let report = drain(&broker, &spec, 1, Arc::clone(&handler), 2).await;
    assert_eq!(report.acked, 2);
    let redelivered: Vec<bool> = handler.seen.lock().unwrap().iter().map(|s| s.1).collect();
    assert_eq!(redelivered, vec![true, false]);
}

#[tokio::test]
async fn malformed_payload_is_discarded_and_consumption_continues() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");

    let session = broker.connect(&endpoint(), &guest()).await.unwrap();
    session.declare_queue(&spec).await.unwrap();
    session
        .publish("orders-task", b"{\"customerId\":", PublishOptions::default())
        .await
        .unwrap();
    session.close().await.unwrap();
    publish_all(&broker, &spec, &orders(1, 12)).await;

    let handler = Arc::new(Recording::default());
    let report = drain(&broker, &spec, 1, Arc::clone(&handler), 1).await;
    assert_eq!(report.acked, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(handler.seen.lock().unwrap().len(), 1);

    let journal = broker.journal();
    assert_eq!(count(&journal, JournalKind::Rejected), 1);
    assert_eq!(count(&journal, JournalKind::Requeued), 0);
    assert_eq!(broker.ready_count("orders-task"), 0);
}

#[tokio::test]
async fn delivery_limit_drops_message_after_max_deliveries() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task").max_deliveries(Some(2));
    publish_all(&broker, &spec, &orders(1, 13)).await;

    for attempt in 0..2 {
        let session = broker.connect(&endpoint(), &guest()).await.unwrap();
        session.set_prefetch(1).await.unwrap();
        let mut deliveries = session.subscribe("orders-task", "t").await.unwrap();
        let delivery = deliveries.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.redelivered(), attempt > 0);
        session.close().await.unwrap();
    }

    assert_eq!(broker.ready_count("orders-task"), 0);
    assert_eq!(count(&broker.journal(), JournalKind::Dropped), 1);
}

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restart_keeps_durable_queue_and_persistent_messages_only() {
    let broker = MemoryBroker::new();
    let session = broker.connect(&endpoint(), &guest()).await.unwrap();
    let durable = QueueSpec::durable("orders-task");
    let transient_queue = QueueSpec {
        durable: false,
        ..QueueSpec::durable("scratch")
    };
    session.declare_queue(&durable).await.unwrap();
    session.declare_queue(&transient_queue).await.unwrap();

    let persistent = PublishOptions::default();
    let transient = PublishOptions {
        persistent: false,
        ..PublishOptions::default()
    };
    session.publish("orders-task", b"kept", persistent).await.unwrap();
    session.publish("orders-task", b"lost", transient).await.unwrap();
    session.publish("scratch", b"lost", persistent).await.unwrap();

    broker.restart();

    assert!(broker.queue_exists("orders-task"));
    assert!(!broker.queue_exists("scratch"));
    assert_eq!(broker.ready_count("orders-task"), 1);

    let session = broker.connect(&endpoint(), &guest()).await.unwrap();
    let mut deliveries = session.subscribe("orders-task", "t").await.unwrap();
    let delivery = deliveries.next_delivery().await.unwrap().unwrap();
    assert_eq!(delivery.payload(), b"kept");
}

#[tokio::test]
async fn unacked_persistent_delivery_survives_restart() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");
    publish_all(&broker, &spec, &orders(1, 14)).await;

    let session = broker.connect(&endpoint(), &guest()).await.unwrap();
    let mut deliveries = session.subscribe("orders-task", "t").await.unwrap();
    let _held = deliveries.next_delivery().await.unwrap().unwrap();

    broker.restart();
    assert!(deliveries.next_delivery().await.is_none());
    assert_eq!(broker.ready_count("orders-task"), 1);
}

#[tokio::test]
async fn shutdown_ends_an_idle_consumer() {
    let broker = MemoryBroker::new();
    let spec = QueueSpec::durable("orders-task");
    let consumer = consumer(&broker, &spec, 1).await;
    let shutdown = consumer.shutdown_handle();
    shutdown.trigger();

    let report = tokio::time::timeout(Duration::from_secs(5), consumer.run(&Recording::default()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.acked, 0);
}

/// Signals when work starts, then takes a while to finish.
struct SignalOnEntry {
    entered: Arc<Notify>,
    delay: Duration,
}

#[async_trait]
impl OrderHandler for SignalOnEntry {
    async fn handle(&self, _order: &Order, _delivery: &Delivery) -> Result<()> {
        self.entered.notify_one();
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_during_work_finishes_current_order_and_takes_no_more() {
    // Several rounds: with more orders ready, the loop must still prefer shutdown.
    for round in 0..10 {
        let broker = MemoryBroker::new();
        let spec = QueueSpec::durable("orders-task");
        publish_all(&broker, &spec, &orders(3, 100 + round)).await;

        let consumer = consumer(&broker, &spec, 1).await;
        let shutdown = consumer.shutdown_handle();
        let entered = Arc::new(Notify::new());
        let handler = SignalOnEntry {
            entered: Arc::clone(&entered),
            delay: Duration::from_millis(20),
        };
        let task = tokio::spawn(async move { consumer.run(&handler).await });

        entered.notified().await;
        shutdown.trigger();

        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.acked, 1, "round {round}");
        assert_eq!(broker.ready_count("orders-task"), 2, "round {round}");
        assert_eq!(broker.unacked_count(), 0);

        let journal = broker.journal();
        assert_eq!(count(&journal, JournalKind::Delivered), 1, "round {round}");
    }
}
