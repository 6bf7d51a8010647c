//! Job — the unit of broadcast for one generation task.
//!
//! A job owns a cancellation handle, an append-only ordered history, and a
//! dynamic set of bounded subscriber mailboxes. Subscribing snapshots the
//! history and registers the mailbox in one atomic step, so a subscriber's
//! snapshot plus its first live event are always contiguous: no gap, no
//! duplicate.
//!
//! History grows unbounded for the life of the job; jobs are short-lived
//! request/response cycles, not long streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use relay_core::{Event, EventKind, OwnerId, Priority, SessionKey};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::delivery::DeliveryConfig;

/// Identifier of one subscriber mailbox within a job.
pub type SubscriberId = u64;

/// Lifecycle state of a job. Transitions are one-way:
/// `Created → Running → {Completed | Cancelled | Errored}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Registered but the producer has not started.
    Created,
    /// Producer is running.
    Running,
    /// Producer finished normally.
    Completed,
    /// Cancelled (client stop, replacement, or shutdown).
    Cancelled,
    /// Producer failed or panicked.
    Errored,
}

impl JobState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Cancelled => 3,
            Self::Errored => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            4 => Self::Errored,
            _ => Self::Created,
        }
    }

    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Errored)
    }
}

/// A registered subscriber: the history snapshot taken at subscription time
/// plus the live mailbox that receives every later broadcast.
pub struct Subscription {
    /// Handle for [`Job::unsubscribe`].
    pub id: SubscriberId,
    /// Live event mailbox (bounded).
    pub rx: mpsc::Receiver<Arc<Event>>,
    /// History as of the moment of subscription.
    pub snapshot: Vec<Arc<Event>>,
}

struct JobInner {
    history: Vec<Arc<Event>>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<Event>>>,
}

/// Broadcast state for one generation task.
pub struct Job {
    key: SessionKey,
    owner: OwnerId,
    cancel: CancellationToken,
    delivery: DeliveryConfig,
    created_at: Instant,
    state: AtomicU8,
    next_subscriber: AtomicU64,
    inner: Mutex<JobInner>,
}

impl Job {
    /// Create a new job in the `Created` state.
    #[must_use]
    pub fn new(key: SessionKey, owner: OwnerId, delivery: DeliveryConfig) -> Self {
        Self {
            key,
            owner,
            cancel: CancellationToken::new(),
            delivery,
            created_at: Instant::now(),
            state: AtomicU8::new(JobState::Created.as_u8()),
            next_subscriber: AtomicU64::new(0),
            inner: Mutex::new(JobInner {
                history: Vec::new(),
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Session key this job streams for.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Principal that started the job.
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Delivery policy in effect for this job.
    pub fn delivery(&self) -> &DeliveryConfig {
        &self.delivery
    }

    /// When the job was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Clone of the job's cancellation token, handed to the producer.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation (idempotent).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Mark the producer as running. No-op unless currently `Created`.
    pub fn set_running(&self) {
        let _ = self.state.compare_exchange(
            JobState::Created.as_u8(),
            JobState::Running.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Latch a terminal state. Returns `true` only for the caller that
    /// performed the transition; later attempts (any terminal target) lose.
    pub fn finish(&self, terminal: JobState) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if JobState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                terminal.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Register a new subscriber.
    ///
    /// The history snapshot and mailbox registration happen under one lock
    /// hold, guaranteeing the snapshot plus the first live event are
    /// contiguous with respect to concurrent broadcasts.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.delivery.capacity());
        let snapshot = {
            let mut inner = self.inner.lock();
            let _ = inner.subscribers.insert(id, tx);
            inner.history.clone()
        };
        debug!(session = %self.key, subscriber = id, replayed = snapshot.len(), "subscriber joined");
        Subscription { id, rx, snapshot }
    }

    /// Remove a subscriber. Safe to call more than once.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let removed = self.inner.lock().subscribers.remove(&id).is_some();
        if removed {
            debug!(session = %self.key, subscriber = id, "subscriber left");
        }
    }

    /// Append an event to history and deliver it to every current
    /// subscriber according to its priority tier.
    ///
    /// Deliveries run concurrently, so one slow subscriber never delays its
    /// siblings; each send is bounded by the tier's budget. Critical events
    /// that miss the budget get one detached retry and a loud log if that
    /// also fails; they are never silently lost. Lower tiers are dropped
    /// for the stalled subscriber only (the event stays in history for any
    /// future joiner).
    ///
    /// Sequencing happens under the history lock; delivery does not. With
    /// a single producer per job that makes mailbox arrival order match
    /// history order. The one concurrent-broadcast case is a superseded
    /// job whose terminal races a still-running producer's emit: those two
    /// events may arrive in either order per subscriber, but `seq` still
    /// reflects history order and forwarders stop at the first terminal
    /// they see.
    pub async fn broadcast(&self, kind: EventKind, data: Value) {
        let (event, targets) = {
            let mut inner = self.inner.lock();
            let seq = inner.history.len() as u64;
            let event = Arc::new(Event::new(kind, data, seq));
            inner.history.push(Arc::clone(&event));
            let targets: Vec<(SubscriberId, mpsc::Sender<Arc<Event>>)> = inner
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect();
            (event, targets)
        };

        debug!(
            session = %self.key,
            event_type = %event.kind,
            seq = event.seq,
            subscribers = targets.len(),
            "broadcast"
        );

        let sends = targets.into_iter().map(|(id, tx)| {
            deliver(
                self.key.clone(),
                id,
                tx,
                Arc::clone(&event),
                self.delivery.clone(),
            )
        });
        let _ = futures::future::join_all(sends).await;
    }

    /// Close every subscriber mailbox and clear the set. Idempotent; used
    /// during eviction.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        if !inner.subscribers.is_empty() {
            debug!(session = %self.key, closed = inner.subscribers.len(), "closing subscribers");
        }
        inner.subscribers.clear();
    }

    /// Number of events broadcast so far.
    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Deliver one event to one subscriber mailbox under the tier policy.
async fn deliver(
    session: SessionKey,
    subscriber: SubscriberId,
    tx: mpsc::Sender<Arc<Event>>,
    event: Arc<Event>,
    cfg: DeliveryConfig,
) {
    // Fast path: mailbox has room.
    match tx.try_send(Arc::clone(&event)) {
        Ok(()) => return,
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(session = %session, subscriber, "mailbox closed, skipping");
            return;
        }
        Err(mpsc::error::TrySendError::Full(_)) => {}
    }

    let priority = event.priority();
    let budget = cfg.send_timeout(priority);
    match priority {
        Priority::Critical => {
            match timeout(budget, tx.send(Arc::clone(&event))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!(session = %session, subscriber, "mailbox closed during critical send");
                }
                Err(_) => {
                    warn!(
                        session = %session,
                        subscriber,
                        event_type = %event.kind,
                        "critical send timed out, retrying once"
                    );
                    // Detached retry so the broadcast itself stays bounded.
                    let _ = tokio::spawn(async move {
                        if timeout(budget, tx.send(Arc::clone(&event))).await != Ok(Ok(())) {
                            error!(
                                session = %session,
                                subscriber,
                                event_type = %event.kind,
                                seq = event.seq,
                                "critical event lost for subscriber after retry"
                            );
                        }
                    });
                }
            }
        }
        Priority::High => {
            if timeout(budget, tx.send(event.clone())).await != Ok(Ok(())) {
                warn!(
                    session = %session,
                    subscriber,
                    event_type = %event.kind,
                    seq = event.seq,
                    priority = priority.label(),
                    "dropping event for slow subscriber"
                );
            }
        }
        Priority::Medium => {
            if timeout(budget, tx.send(event.clone())).await != Ok(Ok(())) {
                debug!(
                    session = %session,
                    subscriber,
                    event_type = %event.kind,
                    priority = priority.label(),
                    "dropping event for slow subscriber"
                );
            }
        }
        Priority::Low => {
            // Best-effort only; the try_send above was the whole budget.
            debug!(
                session = %session,
                subscriber,
                event_type = %event.kind,
                priority = priority.label(),
                "dropping event for slow subscriber"
            );
        }
    }
}
