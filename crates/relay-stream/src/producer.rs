//! Producer execution — runs the external generation engine for one job.
//!
//! The engine itself is out of scope; it is consumed through the
//! [`Generator`] contract: a cancellation-aware task that emits events via
//! a [`JobEmitter`] and returns a terminal outcome. [`run_job`] wraps one
//! generator invocation with the guarantees the engine owes its
//! subscribers: every path — success, failure, cancellation, even a panic
//! in the producer — ends with exactly one terminal broadcast and exactly
//! one registry eviction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{EventKind, SessionKey};
use serde_json::{Value, json};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::errors::GenerateError;
use crate::job::{Job, JobState};
use crate::registry::JobRegistry;

/// Input to one generation run.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GenerateInput {
    /// The user's query.
    pub query: String,
    /// Attached file references.
    #[serde(default)]
    pub files: Vec<String>,
}

/// Execution context handed to a producer.
///
/// Producers must observe `cancel` at each yield point and return within a
/// bounded time of it firing.
#[derive(Clone)]
pub struct GenerateContext {
    /// The owning job's cancellation token.
    pub cancel: CancellationToken,
}

impl GenerateContext {
    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Cheap-clone handle a producer uses to broadcast progress events into
/// its job.
#[derive(Clone)]
pub struct JobEmitter {
    job: Arc<Job>,
}

impl JobEmitter {
    /// Wrap a job.
    #[must_use]
    pub fn new(job: Arc<Job>) -> Self {
        Self { job }
    }

    /// Broadcast one event to the job's subscribers (and history).
    pub async fn emit(&self, kind: EventKind, data: Value) {
        self.job.broadcast(kind, data).await;
    }

    /// The session this emitter feeds.
    #[must_use]
    pub fn session_key(&self) -> &SessionKey {
        self.job.key()
    }
}

/// Contract for the external generation engine.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Run one generation task, emitting meaningful progress events and
    /// returning the terminal outcome payload.
    async fn run(
        &self,
        ctx: GenerateContext,
        input: GenerateInput,
        emit: JobEmitter,
    ) -> Result<Value, GenerateError>;
}

/// Terminal outcome of one producer run.
enum Terminal {
    Completed(Value),
    Cancelled,
    Errored(String),
}

impl Terminal {
    fn state(&self) -> JobState {
        match self {
            Self::Completed(_) => JobState::Completed,
            Self::Cancelled => JobState::Cancelled,
            Self::Errored(_) => JobState::Errored,
        }
    }

    fn into_event(self) -> (EventKind, Value) {
        match self {
            Self::Completed(value) => (EventKind::Done, value),
            Self::Cancelled => (EventKind::Done, json!({"cancelled": true})),
            Self::Errored(message) => (EventKind::Error, json!({"message": message})),
        }
    }
}

/// Spawn the producer task for a job.
///
/// The generator runs on its own task so a panic is contained at the join
/// boundary. On cancellation the producer gets the configured grace period
/// to return on its own; after that it is aborted and eviction proceeds
/// regardless. Whatever happens, the job's subscribers observe exactly one
/// terminal event and the job leaves the registry exactly once.
pub fn run_job(
    registry: Arc<JobRegistry>,
    job: Arc<Job>,
    generator: Arc<dyn Generator>,
    input: GenerateInput,
) -> JoinHandle<()> {
    tokio::spawn(drive(registry, job, generator, input))
}

#[instrument(skip_all, fields(session = %job.key()))]
async fn drive(
    registry: Arc<JobRegistry>,
    job: Arc<Job>,
    generator: Arc<dyn Generator>,
    input: GenerateInput,
) {
    job.set_running();
    let ctx = GenerateContext {
        cancel: job.cancel_token(),
    };
    let emitter = JobEmitter::new(Arc::clone(&job));

    let mut producer = tokio::spawn(async move { generator.run(ctx, input, emitter).await });

    let cancel = job.cancel_token();
    let grace = job.delivery().cancel_grace();

    let terminal = tokio::select! {
        res = &mut producer => settle(res),
        () = cancel.cancelled() => {
            // Bounded grace for the producer to observe its token.
            match timeout(grace, &mut producer).await {
                Ok(res) => settle(res),
                Err(_) => {
                    producer.abort();
                    warn!(?grace, "producer ignored cancellation, evicting anyway");
                    Terminal::Cancelled
                }
            }
        }
    };

    let state = terminal.state();
    if job.finish(state) {
        let (kind, data) = terminal.into_event();
        job.broadcast(kind, data).await;
    }
    let _ = registry.remove_job(&job);
    info!(state = ?state, events = job.history_len(), "producer finished");
}

/// Map a producer join result to its terminal outcome, recovering panics.
fn settle(res: Result<Result<Value, GenerateError>, JoinError>) -> Terminal {
    match res {
        Ok(Ok(value)) => Terminal::Completed(value),
        Ok(Err(GenerateError::Cancelled)) => Terminal::Cancelled,
        Ok(Err(err)) => {
            warn!(category = err.category(), "producer failed");
            Terminal::Errored(err.to_string())
        }
        Err(join) if join.is_panic() => {
            error!("producer panicked");
            Terminal::Errored("internal error".into())
        }
        // Aborted after the cancellation grace expired.
        Err(_) => Terminal::Cancelled,
    }
}

/// Reference generator: streams the query back in small chunks, then
/// reports how much it echoed. Used by the demo binary and integration
/// tests as a stand-in for the real generation engine.
pub struct EchoGenerator {
    /// Characters per `chunk` event.
    pub chunk_size: usize,
    /// Pause between chunks (gives cancellation something to interrupt).
    pub chunk_delay: Duration,
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self {
            chunk_size: 8,
            chunk_delay: Duration::from_millis(5),
        }
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn run(
        &self,
        ctx: GenerateContext,
        input: GenerateInput,
        emit: JobEmitter,
    ) -> Result<Value, GenerateError> {
        let chars: Vec<char> = input.query.chars().collect();
        let mut emitted = 0usize;
        for chunk in chars.chunks(self.chunk_size.max(1)) {
            if ctx.is_cancelled() {
                return Err(GenerateError::Cancelled);
            }
            let text: String = chunk.iter().collect();
            emit.emit(EventKind::Chunk, json!(text)).await;
            emitted += 1;

            tokio::select! {
                () = ctx.cancelled() => return Err(GenerateError::Cancelled),
                () = tokio::time::sleep(self.chunk_delay) => {}
            }
        }
        Ok(json!({"chunks": emitted}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryConfig;
    use relay_core::{Event, OwnerId};
    use std::time::Duration;

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            mailbox_capacity: 64,
            critical_send_timeout_ms: 200,
            high_send_timeout_ms: 100,
            medium_send_timeout_ms: 50,
            low_send_timeout_ms: 50,
            cancel_grace_ms: 200,
        }
    }

    async fn setup() -> (Arc<JobRegistry>, Arc<Job>) {
        let registry = Arc::new(JobRegistry::new(fast_config()));
        let job = registry
            .create_or_replace(&SessionKey::from("sess-A"), &OwnerId::from("user-1"))
            .await;
        (registry, job)
    }

    async fn collect_events(sub: &mut crate::job::Subscription) -> Vec<Arc<Event>> {
        let mut events: Vec<Arc<Event>> = sub.snapshot.clone();
        while let Some(event) = sub.rx.recv().await {
            events.push(event);
        }
        events
    }

    struct FailingGenerator;

    #[async_trait]
    impl Generator for FailingGenerator {
        async fn run(
            &self,
            _ctx: GenerateContext,
            _input: GenerateInput,
            _emit: JobEmitter,
        ) -> Result<Value, GenerateError> {
            Err(GenerateError::Failed("model unavailable".into()))
        }
    }

    struct PanickingGenerator;

    #[async_trait]
    impl Generator for PanickingGenerator {
        async fn run(
            &self,
            _ctx: GenerateContext,
            _input: GenerateInput,
            _emit: JobEmitter,
        ) -> Result<Value, GenerateError> {
            panic!("boom");
        }
    }

    struct StubbornGenerator;

    #[async_trait]
    impl Generator for StubbornGenerator {
        async fn run(
            &self,
            _ctx: GenerateContext,
            _input: GenerateInput,
            _emit: JobEmitter,
        ) -> Result<Value, GenerateError> {
            // Never observes cancellation.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!(null))
        }
    }

    #[tokio::test]
    async fn successful_run_ends_with_done_and_eviction() {
        let (registry, job) = setup().await;
        let mut sub = job.subscribe();

        run_job(
            Arc::clone(&registry),
            Arc::clone(&job),
            Arc::new(EchoGenerator::default()),
            GenerateInput {
                query: "Hi there".into(),
                files: vec![],
            },
        )
        .await
        .unwrap();

        let events = collect_events(&mut sub).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Done);
        assert_eq!(last.data["chunks"], 1);
        assert!(events[..events.len() - 1]
            .iter()
            .all(|e| e.kind == EventKind::Chunk));

        assert_eq!(job.state(), JobState::Completed);
        assert!(registry.get(job.key()).is_none());
    }

    #[tokio::test]
    async fn failure_converts_to_error_event() {
        let (registry, job) = setup().await;
        let mut sub = job.subscribe();

        run_job(
            Arc::clone(&registry),
            Arc::clone(&job),
            Arc::new(FailingGenerator),
            GenerateInput::default(),
        )
        .await
        .unwrap();

        let events = collect_events(&mut sub).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Error);
        assert!(
            last.data["message"]
                .as_str()
                .unwrap()
                .contains("model unavailable")
        );
        assert_eq!(job.state(), JobState::Errored);
        assert!(registry.get(job.key()).is_none());
    }

    #[tokio::test]
    async fn panic_is_recovered_and_converted() {
        let (registry, job) = setup().await;
        let mut sub = job.subscribe();

        run_job(
            Arc::clone(&registry),
            Arc::clone(&job),
            Arc::new(PanickingGenerator),
            GenerateInput::default(),
        )
        .await
        .unwrap();

        let events = collect_events(&mut sub).await;
        assert_eq!(events.last().unwrap().kind, EventKind::Error);
        assert_eq!(job.state(), JobState::Errored);
        assert!(registry.get(job.key()).is_none());
    }

    #[tokio::test]
    async fn cooperative_cancellation_within_grace() {
        let (registry, job) = setup().await;
        let mut sub = job.subscribe();

        let handle = run_job(
            Arc::clone(&registry),
            Arc::clone(&job),
            Arc::new(EchoGenerator {
                chunk_size: 1,
                chunk_delay: Duration::from_millis(20),
            }),
            GenerateInput {
                query: "a very long query that will be cancelled".into(),
                files: vec![],
            },
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        job.cancel();
        handle.await.unwrap();

        let events = collect_events(&mut sub).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Done);
        assert_eq!(last.data["cancelled"], true);
        assert_eq!(job.state(), JobState::Cancelled);
        assert!(registry.get(job.key()).is_none());
    }

    #[tokio::test]
    async fn stubborn_producer_evicted_after_grace() {
        let (registry, job) = setup().await;
        let mut sub = job.subscribe();

        let handle = run_job(
            Arc::clone(&registry),
            Arc::clone(&job),
            Arc::new(StubbornGenerator),
            GenerateInput::default(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        job.cancel();

        // Eviction proceeds within the 200ms grace despite the producer
        // ignoring its token.
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("eviction must not wait on an unresponsive producer")
            .unwrap();

        let events = collect_events(&mut sub).await;
        assert_eq!(events.last().unwrap().kind, EventKind::Done);
        assert!(registry.get(job.key()).is_none());
    }

    #[tokio::test]
    async fn replaced_job_does_not_evict_replacement() {
        let (registry, job) = setup().await;

        let handle = run_job(
            Arc::clone(&registry),
            Arc::clone(&job),
            Arc::new(StubbornGenerator),
            GenerateInput::default(),
        );

        // Replace while the first producer is still running.
        let replacement = registry
            .create_or_replace(&SessionKey::from("sess-A"), &OwnerId::from("user-1"))
            .await;

        // Replacement cancelled the first job; its cleanup must leave the
        // new entry in place.
        handle.await.unwrap();
        let found = registry.get(&SessionKey::from("sess-A")).unwrap();
        assert!(Arc::ptr_eq(&found, &replacement));
    }

    #[tokio::test]
    async fn echo_generator_chunks_input() {
        let (registry, job) = setup().await;
        let mut sub = job.subscribe();

        run_job(
            Arc::clone(&registry),
            Arc::clone(&job),
            Arc::new(EchoGenerator {
                chunk_size: 2,
                chunk_delay: Duration::from_millis(1),
            }),
            GenerateInput {
                query: "abcdef".into(),
                files: vec![],
            },
        )
        .await
        .unwrap();

        let events = collect_events(&mut sub).await;
        let chunks: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == EventKind::Chunk)
            .map(|e| e.data.as_str().unwrap())
            .collect();
        assert_eq!(chunks, vec!["ab", "cd", "ef"]);
        assert_eq!(events.last().unwrap().data["chunks"], 3);
    }

    #[tokio::test]
    async fn emitter_exposes_session_key() {
        let (_registry, job) = setup().await;
        let emitter = JobEmitter::new(Arc::clone(&job));
        assert_eq!(emitter.session_key().as_str(), "sess-A");
    }
}
