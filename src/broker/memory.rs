//! In-process broker.
//!
//! Implements the same queue contract the producer and consumer rely on from
//! RabbitMQ: idempotent declaration, mandatory publish, per-session prefetch,
//! manual acknowledgment, requeue of unacknowledged deliveries when a session
//! closes, and restart semantics for durable queues and persistent messages.
//!
//! Every publish, delivery and settlement is appended to a journal with its
//! timestamp so tests can check ordering and in-flight bounds.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{Delivery, DeliveryStream, DeliveryTag, PublishOptions, QueueSpec, Session, Transport};
use crate::config::secrets::ExposeSecret;
use crate::config::{Credentials, Endpoint};
use crate::error::{Error, Result};

/// What happened to a message, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    Published,
    Delivered,
    Acked,
    Rejected,
    Requeued,
    /// Discarded after exceeding the queue's delivery limit.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub at: Instant,
    pub kind: JournalKind,
    pub queue: String,
    /// Broker-wide message id, stable across redeliveries.
    pub message_id: u64,
    /// Session that published, received or settled the message.
    pub session: u64,
    pub tag: Option<DeliveryTag>,
}

/// Cheaply cloneable handle to one in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Default)]
struct State {
    down: bool,
    users: HashMap<String, String>,
    queues: HashMap<String, QueueState>,
    sessions: HashMap<u64, SessionState>,
    next_session: u64,
    next_message: u64,
    journal: Vec<JournalEntry>,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    owner: Option<u64>,
    consumers: usize,
}

#[derive(Clone)]
struct StoredMessage {
    id: u64,
    payload: Vec<u8>,
    persistent: bool,
    deliveries: u32,
    returns: u32,
}

#[derive(Default)]
struct SessionState {
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    subscriptions: Vec<String>,
}

impl MemoryBroker {
    /// A broker that accepts any credentials.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require this username/password pair. Once any user is registered,
    /// unknown credentials are rejected.
    pub fn with_user(self, username: &str, password: &str) -> Self {
        self.lock()
            .users
            .insert(username.to_string(), password.to_string());
        self
    }

    /// Make the broker refuse (or accept again) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().down = !reachable;
    }

    /// Simulate a broker restart: every session is dropped, non-durable
    /// queues vanish, and only persistent messages survive in durable ones.
    /// Unacknowledged messages go back to their queues first.
    pub fn restart(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            close_session(&mut state, id);
        }
        state.queues.retain(|_, q| q.spec.durable);
        for queue in state.queues.values_mut() {
            queue.ready.retain(|m| m.persistent);
            queue.consumers = 0;
            queue.owner = None;
        }
        drop(state);
        self.inner.changed.notify_waiters();
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Number of queues currently declared.
    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    /// Messages waiting for delivery (not counting unacknowledged ones).
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered-but-unacknowledged messages across all open sessions.
    pub fn unacked_count(&self) -> usize {
        self.lock().sessions.values().map(|s| s.unacked.len()).sum()
    }

    /// Snapshot of the event journal.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl State {
    fn record(
        &mut self,
        kind: JournalKind,
        queue: &str,
        message_id: u64,
        session: u64,
        tag: Option<DeliveryTag>,
    ) {
        self.journal.push(JournalEntry {
            at: Instant::now(),
            kind,
            queue: queue.to_string(),
            message_id,
            session,
            tag,
        });
    }
}

/// Return a session's unacked messages to their queues and drop its
/// exclusive and auto-delete queues.
fn close_session(state: &mut State, id: u64) {
    let Some(session) = state.sessions.remove(&id) else {
        return;
    };

    // Highest tag first so push_front restores the original order.
    for (tag, (queue, message)) in session.unacked.into_iter().rev() {
        requeue(state, id, &queue, DeliveryTag(tag), message);
    }

    for queue in &session.subscriptions {
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers = q.consumers.saturating_sub(1);
        }
    }

    state.queues.retain(|name, q| {
        let owned = q.owner == Some(id);
        let orphaned =
            q.spec.auto_delete && q.consumers == 0 && session.subscriptions.contains(name);
        !(owned || orphaned)
    });
}

fn requeue(
    state: &mut State,
    session: u64,
    queue: &str,
    tag: DeliveryTag,
    mut message: StoredMessage,
) {
    let Some(q) = state.queues.get_mut(queue) else {
        return;
    };
    message.returns += 1;
    let id = message.id;
    if q.spec.delivery_limit.is_some_and(|limit| message.returns > limit) {
        state.record(JournalKind::Dropped, queue, id, session, Some(tag));
        return;
    }
    q.ready.push_front(message);
    state.record(JournalKind::Requeued, queue, id, session, Some(tag));
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[async_trait]
impl Transport for MemoryBroker {
    type Session = MemorySession;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<MemorySession> {
        let mut state = self.lock();
        if state.down {
            return Err(Error::Connection(format!(
                "broker at {endpoint} is unreachable"
            )));
        }
        if !state.users.is_empty() {
            let accepted = state
                .users
                .get(&credentials.username)
                .is_some_and(|p| p == credentials.password.expose_secret());
            if !accepted {
                return Err(Error::Connection(format!(
                    "broker at {endpoint} refused login for {}",
                    credentials.username
                )));
            }
        }

        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(id, SessionState::default());
        debug!(session = id, "memory session opened");

        Ok(MemorySession {
            inner: Arc::clone(&self.inner),
            id,
        })
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One open session. Dropping it has the same effect as closing it.
pub struct MemorySession {
    inner: Arc<Inner>,
    id: u64,
}

impl MemorySession {
    /// Broker-assigned session id, as recorded in the journal.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn open_state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.inner.lock();
        if state.sessions.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(Error::SessionClosed)
        }
    }

    fn settle(&self, delivery: Delivery, kind: JournalKind) -> Result<()> {
        let mut state = self.open_state()?;
        let tag = delivery.tag();
        let entry = state
            .sessions
            .get_mut(&self.id)
            .and_then(|s| s.unacked.remove(&tag.0));
        let Some((queue, message)) = entry else {
            return Err(Error::Other(format!("unknown delivery tag {tag}")));
        };
        match kind {
            JournalKind::Requeued => requeue(&mut state, self.id, &queue, tag, message),
            _ => state.record(kind, &queue, message.id, self.id, Some(tag)),
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        if state.sessions.contains_key(&self.id) {
            close_session(&mut state, self.id);
            debug!(session = self.id, "memory session closed");
            drop(state);
            self.inner.changed.notify_waiters();
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    type Deliveries = MemoryDeliveries;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec != *spec {
                return Err(Error::QueueConflict {
                    queue: spec.name.clone(),
                    reason: format!("declared as {:?}, requested {:?}", existing.spec, spec),
                });
            }
            if existing.owner.is_some_and(|o| o != self.id) {
                return Err(Error::QueueConflict {
                    queue: spec.name.clone(),
                    reason: "exclusive to another session".to_string(),
                });
            }
            return Ok(());
        }
        state.queues.insert(
            spec.name.clone(),
            QueueState {
                spec: spec.clone(),
                ready: VecDeque::new(),
                owner: spec.exclusive.then_some(self.id),
                consumers: 0,
            },
        );
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.prefetch = count;
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        let mut state = self.open_state()?;
        state.next_message += 1;
        let id = state.next_message;
        let Some(q) = state.queues.get_mut(queue) else {
            if options.mandatory {
                return Err(Error::Unroutable {
                    queue: queue.to_string(),
                });
            }
            return Ok(());
        };
        q.ready.push_back(StoredMessage {
            id,
            payload: payload.to_vec(),
            persistent: options.persistent,
            deliveries: 0,
            returns: 0,
        });
        state.record(JournalKind::Published, queue, id, self.id, None);
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<MemoryDeliveries> {
        let mut state = self.open_state()?;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(Error::Other(format!("no queue '{queue}' to consume from")));
        };
        q.consumers += 1;
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.subscriptions.push(queue.to_string());
        }
        debug!(session = self.id, queue, consumer_tag, "memory consumer registered");
        Ok(MemoryDeliveries {
            inner: Arc::clone(&self.inner),
            session: self.id,
            queue: queue.to_string(),
        })
    }

    async fn ack(&self, delivery: Delivery) -> Result<()> {
        self.settle(delivery, JournalKind::Acked)
    }

    async fn reject(&self, delivery: Delivery, requeue: bool) -> Result<()> {
        let kind = if requeue {
            JournalKind::Requeued
        } else {
            JournalKind::Rejected
        };
        self.settle(delivery, kind)
    }

    async fn close(self) -> Result<()> {
        // Drop does the work.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

/// Receive side of a memory subscription.
pub struct MemoryDeliveries {
    inner: Arc<Inner>,
    session: u64,
    queue: String,
}

impl MemoryDeliveries {
    /// Try to hand out one message. `Err(())` means the subscription is gone.
    fn try_take(&self) -> std::result::Result<Option<Delivery>, ()> {
        let mut state = self.inner.lock();
        let state = &mut *state;

        let Some(session) = state.sessions.get_mut(&self.session) else {
            return Err(());
        };
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(());
        };
        if session.prefetch != 0 && session.unacked.len() >= usize::from(session.prefetch) {
            return Ok(None);
        }
        let Some(mut message) = queue.ready.pop_front() else {
            return Ok(None);
        };

        let redelivered = message.deliveries > 0;
        message.deliveries += 1;
        session.next_tag += 1;
        let tag = DeliveryTag(session.next_tag);
        let delivery = Delivery::new(tag, message.payload.clone(), redelivered);
        let message_id = message.id;
        session.unacked.insert(tag.0, (self.queue.clone(), message));

        state.journal.push(JournalEntry {
            at: Instant::now(),
            kind: JournalKind::Delivered,
            queue: self.queue.clone(),
            message_id,
            session: self.session,
            tag: Some(tag),
        });
        Ok(Some(delivery))
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveries {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            // Register interest before looking so no wakeup is missed.
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            match self.try_take() {
                Ok(Some(delivery)) => return Some(Ok(delivery)),
                Ok(None) => changed.await,
                Err(()) => return None,
            }
        }
    }
}
