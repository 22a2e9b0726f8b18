use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::{ApiError, SharedState};
use crate::messages::{ClientCommand, ServerMessage};
use crate::models::Project;
use crate::pipeline::PipelineRunner;
use crate::registry::{ChannelSubscriber, ConnectionRegistry, Subscriber, SubscriberId};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound messages buffered per connection before deliveries start to wait.
const OUTBOUND_CAPACITY: usize = 64;

// ── Stats ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct WsStats {
    pub total_connections: usize,
    pub active_projects: usize,
    pub connections_by_project: BTreeMap<i64, usize>,
}

pub async fn ws_stats(State(state): State<SharedState>) -> Json<WsStats> {
    let registry = state.runner.registry();
    let connections_by_project = registry.project_counts();
    Json(WsStats {
        total_connections: registry.count(None),
        active_projects: connections_by_project.len(),
        connections_by_project,
    })
}

// ── WebSocket handler ────────────────────────────────────────────────

/// Upgrade to a project's event stream. Unknown projects get a 404 before
/// any upgrade happens.
pub async fn ws_handler(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> Response {
    let lookup = state
        .runner
        .db()
        .call(move |db| db.get_project(project_id))
        .await;
    let project = match lookup {
        Ok(Some(project)) => project,
        Ok(None) => {
            return ApiError::NotFound(format!("Project {} not found", project_id)).into_response();
        }
        Err(e) => return ApiError::Internal(e.to_string()).into_response(),
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let runner = state.runner.clone();
    upgrade.on_upgrade(move |socket| handle_socket(socket, runner, project))
}

async fn handle_socket(socket: WebSocket, runner: Arc<PipelineRunner>, project: Project) {
    let registry = runner.registry().clone();
    let project_id = project.id;
    let (subscriber_id, outbound) = subscribe(&registry, &project).await;
    info!(project_id, subscriber = subscriber_id, "websocket connected");

    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, outbound, &runner, project_id).await;

    registry.unregister(subscriber_id, project_id);
    info!(project_id, subscriber = subscriber_id, "websocket disconnected");
}

/// Open a subscription whose first queued message is `connected`.
///
/// The greeting is queued before the subscriber is visible to broadcasts.
/// After registration the registry holds the only sender: if it drops the
/// subscriber, the returned receiver closes.
async fn subscribe(
    registry: &ConnectionRegistry,
    project: &Project,
) -> (SubscriberId, mpsc::Receiver<String>) {
    let subscriber_id = registry.next_subscriber_id();
    let (subscriber, outbound) = ChannelSubscriber::new(subscriber_id, OUTBOUND_CAPACITY);
    let connected = ServerMessage::Connected {
        project_id: project.id,
        project_name: project.name.clone(),
        message: format!("Subscribed to analysis updates for {}", project.name),
    };
    match connected.to_json() {
        Ok(json) => {
            if let Err(e) = subscriber.deliver(&json).await {
                warn!(subscriber = subscriber_id, error = %e, "failed to queue connected message");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize server message"),
    }
    registry.register(Arc::new(subscriber), project.id);
    (subscriber_id, outbound)
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards registry deliveries in order, answers client commands, and
/// pings every [`PING_INTERVAL`]. If no Pong arrives within
/// [`PONG_TIMEOUT`] after a Ping, the connection is considered dead.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut outbound: mpsc::Receiver<String>,
    runner: &PipelineRunner,
    project_id: i64,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(project_id, "pong timeout, closing websocket");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            queued = outbound.recv() => {
                match queued {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let Some(command) = ClientCommand::parse(text.as_str()) else {
                            continue;
                        };
                        let reply = command_reply(command, runner, project_id).await;
                        match reply.to_json() {
                            Ok(json) => {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to serialize reply"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Answer a client command for `project_id`.
pub(crate) async fn command_reply(
    command: ClientCommand,
    runner: &PipelineRunner,
    project_id: i64,
) -> ServerMessage {
    match command {
        ClientCommand::Ping => ServerMessage::Pong { project_id },
        ClientCommand::Status => {
            match runner.db().call(move |db| db.get_project(project_id)).await {
                Ok(Some(project)) => ServerMessage::Status {
                    project_id,
                    status: project.status,
                    updated_at: project.updated_at,
                },
                Ok(None) => ServerMessage::Error {
                    project_id,
                    error: format!("Project {} not found", project_id),
                },
                Err(e) => {
                    warn!(project_id, error = %e, "status lookup failed");
                    ServerMessage::Error {
                        project_id,
                        error: "Status lookup failed".to_string(),
                    }
                }
            }
        }
    }
}
