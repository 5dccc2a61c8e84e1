use crate::bridge::{ConsoleBridge, Inbound, Outbound};
use crate::cluster::Orchestrator;
use crate::config::BridgeConfig;
use crate::console;
use crate::error::{BridgeError, BridgeResult};
use crate::locator;
use crate::model::{ClientMessage, WorkloadKind, WorkloadRef};
use crate::status::{Feed, NodeFeed, OwnerFilter, StatusHub, WorkloadFeed, run_private_feed};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const OUTBOUND_BUFFER: usize = 256;
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<dyn Orchestrator>,
    config: Arc<BridgeConfig>,
    hub: Arc<StatusHub>,
    conn_counter: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        config: Arc<BridgeConfig>,
        hub: Arc<StatusHub>,
    ) -> Self {
        Self {
            orchestrator,
            config,
            hub,
            conn_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/console/", get(console_default))
        .route("/ws/console/{namespace}/{workload}", get(console_workload))
        .route(
            "/ws/console/{namespace}/{workload}/{container}",
            get(console_container),
        )
        .route("/ws/status/", get(status_shared))
        .route("/ws/status/owner/{owner}", get(status_owner))
        .route("/ws/nodes/", get(nodes_feed))
        .route(
            "/api/workloads/{kind}/{namespace}/{name}/scale",
            post(scale_workload),
        )
        .route("/api/console/{namespace}/{name}/command", post(send_command))
        .route("/api/status", get(status_snapshot))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn console_default(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let workload = state.config.default_workload();
    ws.on_upgrade(move |socket| handle_console(state, socket, workload))
}

async fn console_workload(
    ws: WebSocketUpgrade,
    Path((namespace, workload)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let workload = WorkloadRef::new(namespace, workload, state.config.container.clone());
    ws.on_upgrade(move |socket| handle_console(state, socket, workload))
}

async fn console_container(
    ws: WebSocketUpgrade,
    Path((namespace, workload, container)): Path<(String, String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let workload = WorkloadRef::new(namespace, workload, container);
    ws.on_upgrade(move |socket| handle_console(state, socket, workload))
}

async fn status_shared(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_shared_status(state, socket))
}

async fn status_owner(
    ws: WebSocketUpgrade,
    Path(owner): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let feed = WorkloadFeed::new(
        state.orchestrator.clone(),
        state.config.kind,
        Some(state.config.namespace.clone()),
        &state.config.status,
    )
    .for_owner(OwnerFilter {
        key: state.config.status.owner_key.clone(),
        owner,
    });
    let feed: Arc<dyn Feed> = Arc::new(feed);
    ws.on_upgrade(move |socket| handle_private_feed(state, socket, feed))
}

async fn nodes_feed(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let feed: Arc<dyn Feed> = Arc::new(NodeFeed::new(state.orchestrator.clone()));
    ws.on_upgrade(move |socket| handle_private_feed(state, socket, feed))
}

async fn handle_console(state: AppState, socket: WebSocket, workload: WorkloadRef) {
    let conn_id = state.next_conn_id();
    let (ws_sender, ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let write_task = tokio::spawn(write_frames(conn_id, ws_sender, rx));

    let bridge = ConsoleBridge::new(
        conn_id,
        state.orchestrator.clone(),
        state.config.clone(),
        workload,
    );
    bridge.run(inbound_events(ws_receiver), tx).await;
    let _ = write_task.await;
}

async fn handle_shared_status(state: AppState, socket: WebSocket) {
    let conn_id = state.next_conn_id();
    let (ws_sender, ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let write_task = tokio::spawn(write_frames(conn_id, ws_sender, rx));

    state.hub.subscribe(conn_id, tx).await;
    wait_for_disconnect(inbound_events(ws_receiver)).await;
    state.hub.unsubscribe(conn_id).await;
    write_task.abort();
}

async fn handle_private_feed(state: AppState, socket: WebSocket, feed: Arc<dyn Feed>) {
    let conn_id = state.next_conn_id();
    let (ws_sender, ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let write_task = tokio::spawn(write_frames(conn_id, ws_sender, rx));

    info!(conn_id, feed = feed.name(), "private status feed opened");
    let feed_task = tokio::spawn(run_private_feed(
        conn_id,
        feed,
        state.config.status.interval,
        tx,
    ));
    wait_for_disconnect(inbound_events(ws_receiver)).await;
    feed_task.abort();
    write_task.abort();
    info!(conn_id, "private status feed closed");
}

/// Status sockets ignore browser messages; only the disconnect matters.
async fn wait_for_disconnect(mut inbound: BoxStream<'static, Inbound>) {
    while let Some(event) = inbound.next().await {
        if event == Inbound::Closed {
            break;
        }
    }
}

fn inbound_events(receiver: SplitStream<WebSocket>) -> BoxStream<'static, Inbound> {
    receiver
        .filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(Inbound::Text(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => {
                    Some(Inbound::Text(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => None,
                Ok(Message::Close(_)) => Some(Inbound::Closed),
                Err(error) => {
                    debug!(error = %error, "browser socket read failed");
                    Some(Inbound::Closed)
                }
            }
        })
        .boxed()
}

async fn write_frames(
    conn_id: u64,
    mut sender: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = frames.recv().await {
        let (message, last) = match frame {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Close { reason } => (
                Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        match timeout(WRITE_TIMEOUT, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!(conn_id, error = %error, "browser socket write failed");
                break;
            }
            Err(_) => {
                warn!(conn_id, "browser socket write timed out");
                break;
            }
        }
        if last {
            break;
        }
    }
}

async fn status_snapshot(State(state): State<AppState>) -> Response {
    let feed = WorkloadFeed::new(
        state.orchestrator.clone(),
        state.config.kind,
        Some(state.config.namespace.clone()),
        &state.config.status,
    );
    match feed.snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(error) => bridge_error_response(&error),
    }
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    replicas: i32,
}

async fn scale_workload(
    State(state): State<AppState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    Json(request): Json<ScaleRequest>,
) -> Response {
    let Some(kind) = WorkloadKind::from_token(&kind) else {
        return error_body(
            StatusCode::BAD_REQUEST,
            "unsupported_kind",
            &format!("unsupported workload kind '{kind}'"),
        );
    };
    if request.replicas < 0 {
        return error_body(
            StatusCode::BAD_REQUEST,
            "invalid_replicas",
            "replicas must not be negative",
        );
    }

    match state
        .orchestrator
        .patch_replicas(kind, &namespace, &name, request.replicas)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "kind": kind,
                "namespace": namespace,
                "name": name,
                "replicas": request.replicas,
            })),
        )
            .into_response(),
        Err(error) => bridge_error_response(&error),
    }
}

async fn send_command(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(message): Json<ClientMessage>,
) -> Response {
    let workload = WorkloadRef::new(namespace, name, state.config.container.clone());
    match inject(&state, &workload, &message.command).await {
        Ok(output) => (StatusCode::OK, Json(serde_json::json!({ "output": output }))).into_response(),
        Err(error) => {
            warn!(workload = %workload, error = %error, "console command failed");
            bridge_error_response(&error)
        }
    }
}

async fn inject(state: &AppState, workload: &WorkloadRef, command: &str) -> BridgeResult<String> {
    let orchestrator = state.orchestrator.as_ref();
    let session = &state.config.session;
    let target = locator::resolve(orchestrator, &state.config, workload).await?;
    let label = console::find_session(orchestrator, session, &target).await?;
    console::inject_command(orchestrator, session, &target, &label, command).await
}

fn bridge_error_response(error: &BridgeError) -> Response {
    let status = match error {
        BridgeError::NotFound { .. } | BridgeError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        BridgeError::ContainerNotReady { .. } => StatusCode::CONFLICT,
        BridgeError::MalformedInput(_) => StatusCode::BAD_REQUEST,
        BridgeError::ChannelClosed => StatusCode::GONE,
        BridgeError::Transport { .. } | BridgeError::Orchestrator { .. } => StatusCode::BAD_GATEWAY,
    };
    error_body(status, error.kind(), &error.to_string())
}

fn error_body(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message, "kind": kind })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::{AppState, ScaleRequest, scale_workload, send_command, status_snapshot};
    use crate::cluster::Orchestrator;
    use crate::config::BridgeConfig;
    use crate::model::{ClientMessage, WorkloadKind};
    use crate::status::{StatusHub, WorkloadFeed};
    use crate::testing::{FakeOrchestrator, running_instance, workload};
    use axum::Json;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use std::sync::Arc;

    fn state(fake: &Arc<FakeOrchestrator>) -> AppState {
        let orchestrator: Arc<dyn Orchestrator> = fake.clone();
        let config = Arc::new(BridgeConfig::default());
        let hub = Arc::new(StatusHub::new(
            WorkloadFeed::new(
                orchestrator.clone(),
                config.kind,
                Some(config.namespace.clone()),
                &config.status,
            ),
            config.status.interval,
        ));
        AppState::new(orchestrator, config, hub)
    }

    #[tokio::test]
    async fn status_endpoint_returns_current_snapshot() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.set_workloads(
            WorkloadKind::StatefulSet,
            vec![
                workload("default", "survival", 1, 1),
                workload("default", "creative", 1, 0),
            ],
        );

        let response = status_snapshot(State(state(&fake))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("status body");
        let snapshot: serde_json::Value = serde_json::from_slice(&body).expect("status json");
        assert_eq!(snapshot["type"], "statefulset_status");
        assert_eq!(snapshot["data"][0]["name"], "creative");
        assert_eq!(snapshot["data"][0]["status"], "Stopped");
        assert_eq!(snapshot["data"][1]["status"], "Running");
    }

    #[tokio::test]
    async fn status_endpoint_reports_orchestrator_failure() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.fail_workload_listing(true);
        let response = status_snapshot(State(state(&fake))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn scale_patches_replicas_for_known_kind() {
        let fake = Arc::new(FakeOrchestrator::new());
        let response = scale_workload(
            State(state(&fake)),
            Path((
                "sts".to_string(),
                "default".to_string(),
                "survival".to_string(),
            )),
            Json(ScaleRequest { replicas: 0 }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            fake.patches(),
            vec![(
                WorkloadKind::StatefulSet,
                "default".to_string(),
                "survival".to_string(),
                0
            )]
        );
    }

    #[tokio::test]
    async fn scale_rejects_unknown_kind_and_negative_counts() {
        let fake = Arc::new(FakeOrchestrator::new());
        let unknown = scale_workload(
            State(state(&fake)),
            Path(("job".to_string(), "default".to_string(), "x".to_string())),
            Json(ScaleRequest { replicas: 1 }),
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

        let negative = scale_workload(
            State(state(&fake)),
            Path(("deploy".to_string(), "default".to_string(), "x".to_string())),
            Json(ScaleRequest { replicas: -1 }),
        )
        .await;
        assert_eq!(negative.status(), StatusCode::BAD_REQUEST);
        assert!(fake.patches().is_empty());
    }

    #[tokio::test]
    async fn command_is_injected_into_discovered_session() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.add_instances("app=survival", vec![running_instance("default", "survival-0")]);
        fake.set_listing("\t777.minecraft\t(Detached)\n");

        let response = send_command(
            State(state(&fake)),
            Path(("default".to_string(), "survival".to_string())),
            Json(ClientMessage {
                command: "save-all".to_string(),
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let injected = fake.invocations().pop().expect("inject invocation");
        assert_eq!(
            injected.command,
            vec!["screen", "-S", "777", "-X", "stuff", "save-all\n"]
        );
    }

    #[tokio::test]
    async fn command_for_missing_workload_is_not_found() {
        let fake = Arc::new(FakeOrchestrator::new());
        let response = send_command(
            State(state(&fake)),
            Path(("default".to_string(), "ghost".to_string())),
            Json(ClientMessage {
                command: "list".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
