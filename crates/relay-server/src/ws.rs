//! WebSocket connection adapter.
//!
//! One adapter per physical connection, two independent loops: the inbound
//! loop parses `start`/`stop`/`ping` commands and drives the engine, the
//! outbound loop drains the connection mailbox onto the wire and enforces
//! ping/pong liveness. A bad frame or a slow peer affects this connection
//! only; sibling subscribers of the same job are untouched.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use relay_core::{ClientCommand, ConnectionId, Event, EventKind, OwnerId, SessionKey};
use relay_stream::job::{Job, SubscriberId, Subscription};
use relay_stream::{GenerateInput, run_job};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::ClientConnection;
use crate::server::AppState;

/// Query parameters for the WebSocket upgrade.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Owning principal; generated when absent (auth is out of scope).
    pub owner: Option<String>,
}

/// GET /ws — upgrade to a WebSocket session.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.hub.total_connections() >= state.config.max_connections {
        warn!(
            limit = state.config.max_connections,
            "rejecting connection, server at capacity"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let owner = query.owner.map_or_else(OwnerId::new, OwnerId::from);
    let max_size = state.config.max_message_size;
    ws.max_message_size(max_size)
        .on_upgrade(move |socket| run_ws_session(socket, state, owner))
}

/// Forwards one job subscription into a connection mailbox: replays the
/// history snapshot in order, then live events, stopping at the terminal
/// event. Lossless (awaited) sends, so backpressure lands on the job's
/// subscriber mailbox where the tiered drop policy lives.
pub(crate) struct StreamPump {
    job: Arc<Job>,
    sub_id: SubscriberId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StreamPump {
    pub(crate) fn spawn(
        job: Arc<Job>,
        sub: Subscription,
        tx: mpsc::Sender<Arc<Event>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let sub_id = sub.id;
        let handle = tokio::spawn(pump_loop(sub, tx, cancel.clone()));
        Self {
            job,
            sub_id,
            cancel,
            handle,
        }
    }

    /// Detach from the job and stop forwarding.
    pub(crate) fn stop(self) {
        self.cancel.cancel();
        self.job.unsubscribe(self.sub_id);
        self.handle.abort();
    }
}

async fn pump_loop(
    mut sub: Subscription,
    tx: mpsc::Sender<Arc<Event>>,
    cancel: CancellationToken,
) {
    for event in std::mem::take(&mut sub.snapshot) {
        let terminal = event.kind.is_terminal();
        if tx.send(event).await.is_err() {
            return;
        }
        if terminal {
            return;
        }
    }
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            event = sub.rx.recv() => {
                let Some(event) = event else { return };
                let terminal = event.kind.is_terminal();
                if tx.send(event).await.is_err() {
                    return;
                }
                if terminal {
                    return;
                }
            }
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection with the hub
/// 2. Dispatches incoming text frames as client commands
/// 3. Forwards outbound events via the connection mailbox
/// 4. Sends periodic Ping frames and disconnects unresponsive peers
/// 5. Cleans up on disconnect
#[instrument(skip_all, fields(owner = %owner))]
pub async fn run_ws_session(ws: WebSocket, state: AppState, owner: OwnerId) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let conn_id = ConnectionId::new();
    let (out_tx, mut out_rx) = mpsc::channel::<Arc<Event>>(state.config.delivery.capacity());
    let connection = Arc::new(ClientConnection::new(
        conn_id.clone(),
        owner.clone(),
        out_tx.clone(),
    ));
    state.hub.register(&owner, &conn_id, out_tx);
    info!(connection = %conn_id, "client connected");

    let ping_interval = Duration::from_secs(state.config.heartbeat_interval_secs);
    let pong_timeout = Duration::from_secs(state.config.heartbeat_timeout_secs);

    // Outbound loop: mailbox drain plus liveness pings. Cancels the
    // session token on exit so the inbound loop cannot outlive a dead
    // socket (a silently gone peer never sends the Close frame that would
    // end `ws_rx`).
    let session_gone = CancellationToken::new();
    let outbound_conn = Arc::clone(&connection);
    let outbound = tokio::spawn({
        let session_gone = session_gone.clone();
        async move {
            let mut ping = tokio::time::interval(ping_interval);
            // Skip the immediate first tick.
            let _ = ping.tick().await;

            loop {
                tokio::select! {
                    event = out_rx.recv() => {
                        match event {
                            Some(event) => {
                                if ws_tx.send(Message::Text(event.wire_json().into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ping.tick() => {
                        if !outbound_conn.check_alive()
                            && outbound_conn.last_pong_elapsed() > pong_timeout
                        {
                            warn!("client unresponsive for {pong_timeout:?}, disconnecting");
                            break;
                        }
                        if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            session_gone.cancel();
        }
    });

    // Inbound loop.
    let mut pump: Option<StreamPump> = None;
    loop {
        let msg = tokio::select! {
            () = session_gone.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(msg)) => msg,
                _ => break,
            },
        };
        let text = match msg {
            Message::Text(ref t) => Some(t.to_string()),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(s) => Some(s.to_owned()),
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    None
                }
            },
            Message::Close(_) => {
                info!(connection = %conn_id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                connection.mark_alive();
                None
            }
        };
        let Some(text) = text else { continue };
        connection.mark_alive();

        match ClientCommand::parse(&text) {
            Ok(cmd) => handle_command(cmd, &state, &connection, &mut pump).await,
            Err(e) => {
                warn!(connection = %conn_id, "malformed command");
                let _ = connection.send(Arc::new(Event::new(
                    EventKind::Error,
                    json!({"message": format!("invalid command: {e}")}),
                    0,
                )));
            }
        }
    }

    // Cleanup: this connection only.
    if let Some(pump) = pump.take() {
        pump.stop();
    }
    state.hub.unregister(&owner, &conn_id);
    outbound.abort();
    info!(connection = %conn_id, age = ?connection.age(), drops = connection.drop_count(), "client disconnected");
}

/// Dispatch one parsed client command.
pub(crate) async fn handle_command(
    cmd: ClientCommand,
    state: &AppState,
    connection: &Arc<ClientConnection>,
    pump: &mut Option<StreamPump>,
) {
    let is_attach = cmd.is_attach();
    match cmd {
        ClientCommand::Ping => {
            let _ = connection.send(Arc::new(Event::new(EventKind::Pong, json!(null), 0)));
        }
        ClientCommand::Stop => {
            let _ = state.hub.cancel(connection.owner());
        }
        ClientCommand::Start {
            session_key,
            input,
            files,
        } => {
            let key = SessionKey::from(session_key);
            if is_attach {
                attach(&key, state, connection, pump);
            } else {
                start(
                    key,
                    GenerateInput {
                        query: input,
                        files,
                    },
                    state,
                    connection,
                    pump,
                )
                .await;
            }
        }
    }
}

/// Reconnection path: attach to the existing stream, replaying history.
/// Without a live job the client gets an immediate terminal `done` instead
/// of hanging.
fn attach(
    key: &SessionKey,
    state: &AppState,
    connection: &Arc<ClientConnection>,
    pump: &mut Option<StreamPump>,
) {
    match state.registry.get(key) {
        Some(job) => {
            debug!(session = %key, "attaching to existing stream");
            if let Some(old) = pump.take() {
                old.stop();
            }
            let sub = job.subscribe();
            *pump = Some(StreamPump::spawn(job, sub, connection.sender()));
        }
        None => {
            debug!(session = %key, "no active stream to attach");
            let _ = connection.send(Arc::new(Event::new(
                EventKind::Done,
                json!("No active stream found"),
                0,
            )));
        }
    }
}

/// Fresh start: install a job for the session (displacing any previous
/// one), record the cancellation handle, subscribe this connection, and
/// hand off to the producer.
async fn start(
    key: SessionKey,
    input: GenerateInput,
    state: &AppState,
    connection: &Arc<ClientConnection>,
    pump: &mut Option<StreamPump>,
) {
    let owner = connection.owner();
    let job = state.registry.create_or_replace(&key, owner).await;
    state.hub.set_cancel(owner, job.cancel_token());

    // Let the owner's other open connections know a stream began.
    let announce = Arc::new(Event::new(
        EventKind::SessionCreated,
        json!({
            "session": key.as_str(),
            "createdAt": chrono::Utc::now().to_rfc3339(),
        }),
        0,
    ));
    let _ = state.hub.broadcast_to_owner(owner, &announce);

    // Subscribe before the producer starts so no events are missed.
    if let Some(old) = pump.take() {
        old.stop();
    }
    let sub = job.subscribe();
    *pump = Some(StreamPump::spawn(
        Arc::clone(&job),
        sub,
        connection.sender(),
    ));

    let _ = run_job(
        Arc::clone(&state.registry),
        job,
        Arc::clone(&state.generator),
        input,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::AppState;
    use relay_stream::EchoGenerator;
    use std::time::Duration;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_secs(2);

    fn make_state() -> AppState {
        let config = ServerConfig {
            delivery: relay_stream::DeliveryConfig {
                mailbox_capacity: 64,
                cancel_grace_ms: 200,
                ..relay_stream::DeliveryConfig::default()
            },
            ..ServerConfig::default()
        };
        AppState::new(
            config,
            Arc::new(EchoGenerator {
                chunk_size: 4,
                chunk_delay: Duration::from_millis(1),
            }),
        )
    }

    fn make_conn(
        state: &AppState,
        owner: &str,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(64);
        let conn_id = ConnectionId::new();
        let owner = OwnerId::from(owner);
        state.hub.register(&owner, &conn_id, tx.clone());
        (
            Arc::new(ClientConnection::new(conn_id, owner, tx)),
            rx,
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<Arc<Event>>) -> Arc<Event> {
        timeout(TICK, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let state = make_state();
        let (conn, mut rx) = make_conn(&state, "u1");
        let mut pump = None;

        handle_command(ClientCommand::Ping, &state, &conn, &mut pump).await;
        let event = recv(&mut rx).await;
        assert_eq!(event.kind, EventKind::Pong);
    }

    #[tokio::test]
    async fn start_streams_chunks_then_done() {
        let state = make_state();
        let (conn, mut rx) = make_conn(&state, "u1");
        let mut pump = None;

        handle_command(
            ClientCommand::Start {
                session_key: "sess-A".into(),
                input: "hello world".into(),
                files: vec![],
            },
            &state,
            &conn,
            &mut pump,
        )
        .await;

        let mut kinds = Vec::new();
        loop {
            let event = recv(&mut rx).await;
            let terminal = event.kind.is_terminal();
            kinds.push(event.kind.clone());
            if terminal {
                break;
            }
        }
        // session_created announce first (same owner), then chunks, then done.
        assert_eq!(kinds[0], EventKind::SessionCreated);
        assert!(kinds[1..kinds.len() - 1]
            .iter()
            .all(|k| *k == EventKind::Chunk));
        assert_eq!(*kinds.last().unwrap(), EventKind::Done);
    }

    #[tokio::test]
    async fn attach_to_missing_job_yields_done_immediately() {
        let state = make_state();
        let (conn, mut rx) = make_conn(&state, "u1");
        let mut pump = None;

        handle_command(
            ClientCommand::Start {
                session_key: "ghost".into(),
                input: String::new(),
                files: vec![],
            },
            &state,
            &conn,
            &mut pump,
        )
        .await;

        let event = recv(&mut rx).await;
        assert_eq!(event.kind, EventKind::Done);
        assert_eq!(event.data, json!("No active stream found"));
        assert!(pump.is_none());
    }

    #[tokio::test]
    async fn attach_replays_history_then_live() {
        let state = make_state();

        // A job with history but no producer.
        let key = SessionKey::from("sess-A");
        let job = state
            .registry
            .create_or_replace(&key, &OwnerId::from("u1"))
            .await;
        job.broadcast(EventKind::Chunk, json!("Hi")).await;
        job.broadcast(EventKind::Chunk, json!(" there")).await;

        let (conn, mut rx) = make_conn(&state, "u1");
        let mut pump = None;
        handle_command(
            ClientCommand::Start {
                session_key: "sess-A".into(),
                input: String::new(),
                files: vec![],
            },
            &state,
            &conn,
            &mut pump,
        )
        .await;

        job.broadcast(EventKind::Done, json!(null)).await;

        let a = recv(&mut rx).await;
        let b = recv(&mut rx).await;
        let c = recv(&mut rx).await;
        assert_eq!((a.seq, b.seq, c.seq), (0, 1, 2));
        assert_eq!(a.data, json!("Hi"));
        assert_eq!(b.data, json!(" there"));
        assert_eq!(c.kind, EventKind::Done);
        assert!(pump.is_some());
    }

    #[tokio::test]
    async fn stop_cancels_current_job() {
        // A slow echo so the job is still running when stop arrives.
        let state = AppState::new(
            ServerConfig {
                delivery: relay_stream::DeliveryConfig {
                    cancel_grace_ms: 500,
                    ..relay_stream::DeliveryConfig::default()
                },
                ..ServerConfig::default()
            },
            Arc::new(EchoGenerator {
                chunk_size: 1,
                chunk_delay: Duration::from_millis(50),
            }),
        );
        let (conn, mut rx) = make_conn(&state, "u1");
        let mut pump = None;

        handle_command(
            ClientCommand::Start {
                session_key: "sess-A".into(),
                input: "a long input to cancel".into(),
                files: vec![],
            },
            &state,
            &conn,
            &mut pump,
        )
        .await;
        handle_command(ClientCommand::Stop, &state, &conn, &mut pump).await;

        // Job ends with a cancelled terminal within the grace bound.
        let mut saw_cancelled_done = false;
        while let Ok(Some(event)) = timeout(TICK, rx.recv()).await {
            if event.kind == EventKind::Done && event.data["cancelled"] == json!(true) {
                saw_cancelled_done = true;
                break;
            }
        }
        assert!(saw_cancelled_done, "stop must produce a cancelled done");
        // Evicted.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.registry.get(&SessionKey::from("sess-A")).is_none());
    }

    #[tokio::test]
    async fn second_start_replaces_first_job() {
        let state = make_state();
        let (conn, mut rx) = make_conn(&state, "u1");
        let mut pump = None;

        let key = SessionKey::from("sess-A");
        // Manually install a producer-less job with a subscriber.
        let first = state
            .registry
            .create_or_replace(&key, &OwnerId::from("u1"))
            .await;
        let mut first_sub = first.subscribe();

        handle_command(
            ClientCommand::Start {
                session_key: "sess-A".into(),
                input: "fresh".into(),
                files: vec![],
            },
            &state,
            &conn,
            &mut pump,
        )
        .await;

        // First job's subscriber observes the superseded terminal.
        let mut saw_superseded = false;
        while let Some(event) = first_sub.rx.recv().await {
            if event.kind == EventKind::Done && event.data["reason"] == json!("superseded") {
                saw_superseded = true;
            }
        }
        assert!(saw_superseded);
        assert!(first.is_cancelled());

        // New connection sees the fresh stream through to done.
        loop {
            let event = recv(&mut rx).await;
            if event.kind == EventKind::Done {
                break;
            }
        }
    }
}
