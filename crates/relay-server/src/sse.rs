//! Server-Sent Events adapter.
//!
//! A read-only view of the same jobs the WebSocket adapter serves: GET
//! attaches to an existing stream, POST starts (or replaces) one and
//! streams it. Each response owns a private subscription whose history
//! snapshot is replayed before live events, so an SSE consumer observes
//! the identical contiguous sequence a WebSocket subscriber would.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Json;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Sse};
use axum::response::sse::{Event as SseFrame, KeepAlive};
use futures::{Stream, StreamExt};
use relay_core::{Event, EventKind, OwnerId, SessionKey};
use relay_stream::job::{Job, SubscriberId};
use relay_stream::{GenerateInput, run_job};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::server::AppState;

/// One subscription rendered as an event stream: snapshot replay first,
/// then the live mailbox, ending after the terminal event. Dropping the
/// stream (client went away) detaches the subscription from the job.
pub struct JobEventStream {
    job: Option<Arc<Job>>,
    sub_id: SubscriberId,
    snapshot: VecDeque<Arc<Event>>,
    rx: Option<mpsc::Receiver<Arc<Event>>>,
    finished: bool,
}

impl JobEventStream {
    /// Subscribe to a live job.
    pub fn attached(job: Arc<Job>) -> Self {
        let sub = job.subscribe();
        Self {
            job: Some(job),
            sub_id: sub.id,
            snapshot: sub.snapshot.into(),
            rx: Some(sub.rx),
            finished: false,
        }
    }

    /// Stream for a session with no active job: a single terminal `done`
    /// so the client never hangs waiting for events that cannot come.
    pub fn not_found() -> Self {
        let done = Arc::new(Event::new(
            EventKind::Done,
            json!("No active stream found"),
            0,
        ));
        Self {
            job: None,
            sub_id: 0,
            snapshot: VecDeque::from([done]),
            rx: None,
            finished: false,
        }
    }
}

impl Stream for JobEventStream {
    type Item = Arc<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if let Some(event) = self.snapshot.pop_front() {
            if event.kind.is_terminal() {
                self.finished = true;
            }
            return Poll::Ready(Some(event));
        }
        let Some(rx) = self.rx.as_mut() else {
            self.finished = true;
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.kind.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for JobEventStream {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            job.unsubscribe(self.sub_id);
        }
    }
}

/// Render one engine event as an SSE frame: the full wire envelope as the
/// `data:` line, so SSE and WebSocket clients parse identical JSON.
fn sse_frame(event: &Event) -> SseFrame {
    SseFrame::default().data(event.wire_json())
}

fn sse_response(stream: JobEventStream) -> impl IntoResponse {
    let frames = stream.map(|event| Ok::<_, Infallible>(sse_frame(&event)));
    Sse::new(frames).keep_alive(KeepAlive::default())
}

/// Query parameters for GET /stream.
#[derive(Debug, Deserialize)]
pub struct AttachQuery {
    /// Session to attach to.
    pub session: String,
}

/// GET /stream?session=… — attach to an existing stream.
pub async fn sse_attach(
    State(state): State<AppState>,
    Query(query): Query<AttachQuery>,
) -> impl IntoResponse {
    let key = SessionKey::from(query.session);
    match state.registry.get(&key) {
        Some(job) => {
            debug!(session = %key, "sse attach");
            sse_response(JobEventStream::attached(job))
        }
        None => {
            debug!(session = %key, "sse attach to missing stream");
            sse_response(JobEventStream::not_found())
        }
    }
}

/// Body for POST /stream.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    /// Session to start (an existing job under this key is replaced).
    pub session_key: String,
    /// Generation input.
    #[serde(default)]
    pub input: String,
    /// File references accompanying the input.
    #[serde(default)]
    pub files: Vec<String>,
    /// Owning principal; generated when absent.
    pub owner: Option<String>,
}

/// POST /stream — start a stream and consume it over SSE.
///
/// A blank input attaches instead of starting, mirroring the WebSocket
/// `start` command.
pub async fn sse_start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    let key = SessionKey::from(req.session_key);
    if req.input.trim().is_empty() && req.files.is_empty() {
        return match state.registry.get(&key) {
            Some(job) => sse_response(JobEventStream::attached(job)),
            None => sse_response(JobEventStream::not_found()),
        };
    }

    let owner = req.owner.map_or_else(OwnerId::new, OwnerId::from);
    let job = state.registry.create_or_replace(&key, &owner).await;
    state.hub.set_cancel(&owner, job.cancel_token());

    // Subscribe before the producer starts so no events are missed.
    let stream = JobEventStream::attached(Arc::clone(&job));
    let _ = run_job(
        Arc::clone(&state.registry),
        job,
        Arc::clone(&state.generator),
        GenerateInput {
            query: req.input,
            files: req.files,
        },
    );
    sse_response(stream)
}
