//! Job registry — concurrency-safe keyed store of live jobs.
//!
//! At most one job is discoverable per session key at any instant. Entries
//! are created on demand, replaced (old one cancelled and evicted) when a
//! new job starts for the same key, and removed on completion, error, or
//! explicit cancellation. Backed by a sharded-lock map so contention stays
//! bounded as session count grows.

use std::sync::Arc;

use dashmap::DashMap;
use relay_core::{EventKind, OwnerId, SessionKey};
use serde_json::json;
use tracing::{debug, info};

use crate::delivery::DeliveryConfig;
use crate::job::{Job, JobState};

/// Keyed store mapping session keys to at most one live [`Job`].
pub struct JobRegistry {
    jobs: DashMap<SessionKey, Arc<Job>>,
    delivery: DeliveryConfig,
}

impl JobRegistry {
    /// Create a registry whose jobs share the given delivery policy.
    #[must_use]
    pub fn new(delivery: DeliveryConfig) -> Self {
        Self {
            jobs: DashMap::new(),
            delivery,
        }
    }

    /// Install a fresh job for `key`, displacing any existing one.
    ///
    /// The map swap is atomic, so no caller can observe both jobs as live.
    /// The displaced job is cancelled, its subscribers receive a terminal
    /// `done` broadcast, and its mailboxes are closed.
    pub async fn create_or_replace(&self, key: &SessionKey, owner: &OwnerId) -> Arc<Job> {
        let job = Arc::new(Job::new(key.clone(), owner.clone(), self.delivery.clone()));
        let displaced = self.jobs.insert(key.clone(), Arc::clone(&job));

        if let Some(old) = displaced {
            info!(session = %key, "replacing active job");
            old.cancel();
            if old.finish(JobState::Cancelled) {
                old.broadcast(EventKind::Done, json!({"reason": "superseded"}))
                    .await;
            }
            old.close_all();
        } else {
            debug!(session = %key, owner = %owner, "job created");
        }
        job
    }

    /// Look up the live job for `key`.
    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Job>> {
        self.jobs.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Evict the job for `key`: cancel, close subscribers, delete the
    /// entry. Returns `false` if no job was registered (idempotent).
    pub fn remove(&self, key: &SessionKey) -> bool {
        if let Some((_, job)) = self.jobs.remove(key) {
            job.cancel();
            job.close_all();
            debug!(session = %key, "job removed");
            true
        } else {
            false
        }
    }

    /// Evict a specific job instance, but only if it is still the one
    /// registered for its key.
    ///
    /// The producer's cleanup path runs after its job may already have been
    /// displaced by [`Self::create_or_replace`]; a plain keyed remove would
    /// then evict the *replacement*. Pointer identity guards against that.
    pub fn remove_job(&self, job: &Arc<Job>) -> bool {
        let removed = self
            .jobs
            .remove_if(job.key(), |_, registered| Arc::ptr_eq(registered, job));
        if let Some((key, removed_job)) = removed {
            removed_job.cancel();
            removed_job.close_all();
            debug!(session = %key, "job removed");
            true
        } else {
            false
        }
    }

    /// Request cancellation of every live job (shutdown path).
    pub fn cancel_all(&self) {
        for entry in &self.jobs {
            entry.value().cancel();
        }
    }

    /// Number of live jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no jobs are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Whether a job is registered for `key`.
    #[must_use]
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.jobs.contains_key(key)
    }
}
