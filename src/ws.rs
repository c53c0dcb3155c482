//! WebSocket surface on the streaming port.
//!
//! A fresh connection is implicitly subscribed to the `global` topic and
//! greeted with `connection_established`. Explicit subscriptions follow the
//! snapshot-then-delta contract: one `initial_state` built from the live
//! engine registry (or the store for finished executions), then that
//! topic's events in publication order.
//!
//! Delivery is at-most-once. A subscriber that falls a full buffer behind
//! (broadcast `Lagged`), or whose socket stays unwritable past the send
//! timeout, is disconnected with an `overloaded` error so it reconnects
//! and resynchronizes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{load_execution_detail, SharedState};
use crate::errors::ErrorCode;
use crate::hub::{EventHub, HubEvent};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// An unwritable socket is dropped after this long.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-connection outbound queue; together with the broadcast buffer this
/// is the subscriber high-water mark.
const OUTBOUND_BUFFER: usize = 256;

pub fn ws_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { execution_id: String },
    Unsubscribe { execution_id: String },
    GetStatus { execution_id: String },
    Ping,
}

enum Outbound {
    Event(String),
    Overloaded(u64),
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, state).await;
}

/// Core connection loop: outbound queue draining, client messages, and
/// ping/pong keepalive in a single select.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    state: SharedState,
) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);

    let greeting = HubEvent::ConnectionEstablished {
        client_id: client_id.clone(),
        server_time: chrono::Utc::now(),
    };
    if sender.send(Message::Text(greeting.envelope())).await.is_err() {
        return;
    }

    // Implicit global subscription.
    let global_task = spawn_forwarder(
        state.hub.subscribe_global(),
        out_tx.clone(),
        state.hub.clone(),
    );
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Outbound queue ──────────────────────────────────────
            outbound = out_rx.recv() => {
                match outbound {
                    Some(Outbound::Event(msg)) => {
                        match tokio::time::timeout(SEND_TIMEOUT, sender.send(Message::Text(msg))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => break,
                            Err(_) => {
                                warn!(client_id = %client_id, "socket unwritable, dropping subscriber");
                                break;
                            }
                        }
                    }
                    Some(Outbound::Overloaded(n)) => {
                        let error = HubEvent::Error {
                            code: ErrorCode::Overloaded.as_str().to_string(),
                            message: format!("subscriber too slow; {} events dropped", n),
                        };
                        let _ = tokio::time::timeout(
                            SEND_TIMEOUT,
                            sender.send(Message::Text(error.envelope())),
                        )
                        .await;
                        break;
                    }
                    None => break,
                }
            }

            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    // Connection is dead, no pong received in time.
                    break;
                }
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &out_tx, &mut subscriptions, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and Ping frames are ignored.
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    global_task.abort();
    for (execution_id, task) in subscriptions.drain() {
        task.abort();
        state.hub.gc_topic(&execution_id);
    }
    let _ = sender.send(Message::Close(None)).await;
    debug!(client_id = %client_id, "websocket closed");
}

async fn handle_client_message(
    state: &SharedState,
    out_tx: &mpsc::Sender<Outbound>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    text: &str,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            send_error(
                out_tx,
                ErrorCode::Validation,
                format!("invalid message: {}", e),
            )
            .await;
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { execution_id } => {
            if subscriptions.contains_key(&execution_id) {
                return;
            }
            // Subscribe before the snapshot so deltas published while the
            // snapshot is built are buffered, not lost.
            let rx = state.hub.subscribe_execution(&execution_id);
            match load_execution_detail(state, &execution_id).await {
                Ok(detail) => {
                    let initial = HubEvent::InitialState(detail);
                    if out_tx
                        .send(Outbound::Event(initial.envelope()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    let task = spawn_forwarder(rx, out_tx.clone(), state.hub.clone());
                    subscriptions.insert(execution_id, task);
                }
                Err(_) => {
                    drop(rx);
                    send_error(
                        out_tx,
                        ErrorCode::NotFound,
                        format!("execution {} not found", execution_id),
                    )
                    .await;
                }
            }
        }
        ClientMessage::Unsubscribe { execution_id } => {
            if let Some(task) = subscriptions.remove(&execution_id) {
                task.abort();
                state.hub.gc_topic(&execution_id);
            }
        }
        ClientMessage::GetStatus { execution_id } => {
            match load_execution_detail(state, &execution_id).await {
                Ok(detail) => {
                    let initial = HubEvent::InitialState(detail);
                    let _ = out_tx.send(Outbound::Event(initial.envelope())).await;
                }
                Err(_) => {
                    send_error(
                        out_tx,
                        ErrorCode::NotFound,
                        format!("execution {} not found", execution_id),
                    )
                    .await;
                }
            }
        }
        ClientMessage::Ping => {
            let _ = out_tx
                .send(Outbound::Event(HubEvent::Pong {}.envelope()))
                .await;
        }
    }
}

async fn send_error(out_tx: &mpsc::Sender<Outbound>, code: ErrorCode, message: String) {
    let event = HubEvent::Error {
        code: code.as_str().to_string(),
        message,
    };
    let _ = out_tx.send(Outbound::Event(event.envelope())).await;
}

/// Forward one broadcast topic into the connection's outbound queue until
/// the topic closes, the connection goes away, or the subscriber lags.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<String>,
    out_tx: mpsc::Sender<Outbound>,
    hub: Arc<EventHub>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if out_tx.send(Outbound::Event(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    hub.note_dropped(n);
                    // The queue may well be full; if this fails the
                    // connection is already being torn down by the send
                    // timeout.
                    let _ = out_tx.try_send(Outbound::Overloaded(n));
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
