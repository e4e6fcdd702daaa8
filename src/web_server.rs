use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json},
    routing::get,
    serve, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::conversation::{respond, Conversation, Turn};
use crate::pipeline::{Pipeline, PipelineEvent};

/// Envelope for every WebSocket message, in both directions.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BroadcastMessage {
    pub message_type: String,
    pub payload: serde_json::Value,
}

impl BroadcastMessage {
    fn new(message_type: &str, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            payload,
        }
    }

    fn from_event(event: PipelineEvent) -> Self {
        match event {
            PipelineEvent::Acknowledged(text) => {
                Self::new("Acknowledged", serde_json::json!({ "text": text }))
            }
            PipelineEvent::StageStarted {
                index,
                total,
                label,
            } => Self::new(
                "StageStarted",
                serde_json::json!({ "index": index, "total": total, "label": label }),
            ),
            PipelineEvent::Chunk { stage, text } => {
                Self::new("Chunk", serde_json::json!({ "stage": stage, "text": text }))
            }
            PipelineEvent::Completed(turn) => Self::new("AssistantTurn", turn_payload(&turn)),
            PipelineEvent::Failed(message) => {
                Self::new("Error", serde_json::json!({ "message": message }))
            }
        }
    }
}

fn turn_payload(turn: &Turn) -> serde_json::Value {
    serde_json::to_value(turn).unwrap_or_else(|e| {
        error!("Failed to serialize turn: {}", e);
        serde_json::Value::Null
    })
}

#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    // Channel for broadcasting messages to all connected WebSocket clients
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    // Held for the whole turn, so turns never interleave.
    pipeline: Arc<Mutex<Pipeline>>,
    // Only locked to read or append turns, never across a remote call.
    conversation: Arc<RwLock<Conversation>>,
    available: bool,
    stage_names: Arc<Vec<&'static str>>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(1024);
        Self {
            templates: Arc::new(create_minijinja_env()),
            broadcast_tx,
            available: pipeline.is_available(),
            stage_names: Arc::new(pipeline.stage_names()),
            pipeline: Arc::new(Mutex::new(pipeline)),
            conversation: Arc::new(RwLock::new(Conversation::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.broadcast_tx.subscribe()
    }
}

fn create_minijinja_env() -> AutoReloader {
    AutoReloader::new(|notifier| {
        let loader = path_loader("templates");
        let mut env = Environment::new();
        env.set_loader(loader);
        notifier.watch_path("templates", true);
        Ok(env)
    })
}

async fn index_handler(
    State(state): State<AppState>,
) -> Result<axum::response::Html<String>, axum::response::Html<String>> {
    let available = state.available;
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                let context = minijinja::context! {
                    title => "AI Super Assistant",
                    caption => "Your advanced AI partner for coding, ML, and more. Powered by Gemini.",
                    available => available,
                };
                tmpl.render(context)
            })
        })
        .map(axum::response::Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            axum::response::Html(format!("Internal Server Error: {}", e))
        })
}

async fn history_handler(State(state): State<AppState>) -> Json<Vec<Turn>> {
    let conversation = state.conversation.read().await;
    Json(conversation.turns().to_vec())
}

async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "available": state.available,
        "stages": state.stage_names.as_slice(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one user message through the pipeline, broadcasting progress to every
/// connected client.
pub async fn run_turn(state: AppState, text: String) {
    let mut pipeline = state.pipeline.lock().await;
    let user_turn = Turn::user(text.as_str());
    let _ = state
        .broadcast_tx
        .send(BroadcastMessage::new("UserTurn", turn_payload(&user_turn)));
    state.conversation.write().await.push(user_turn);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let broadcast_tx = state.broadcast_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if broadcast_tx.send(BroadcastMessage::from_event(event)).is_err() {
                warn!("Failed to broadcast pipeline event: No active receivers?");
            }
        }
    });

    let turn = respond(&mut pipeline, &text, Some(&tx)).await;
    state.conversation.write().await.push(turn);
    drop(tx);
    if let Err(e) = forwarder.await {
        error!("Event forwarder task failed: {:?}", e);
    }
}

/// Start a turn for a `UserMessage`; anything else is logged and ignored.
fn handle_client_text(state: &AppState, text: &str) -> Option<tokio::task::JoinHandle<()>> {
    let msg: BroadcastMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Ignoring malformed client message: {}", e);
            return None;
        }
    };
    match msg.message_type.as_str() {
        "UserMessage" => {
            let Some(user_text) = msg.payload.get("text").and_then(|t| t.as_str()) else {
                warn!("UserMessage without text");
                return None;
            };
            let user_text = user_text.trim();
            if user_text.is_empty() {
                return None;
            }
            Some(tokio::spawn(run_turn(state.clone(), user_text.to_string())))
        }
        other => {
            warn!("Unknown client message type: {}", other);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("New WebSocket connection established");
    let mut broadcast_rx = state.broadcast_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let welcome_msg = BroadcastMessage::new(
        "Info",
        serde_json::json!({"message": "Connected to the assistant"}),
    );
    if let Ok(json_msg) = serde_json::to_string(&welcome_msg) {
        if sender.send(Message::Text(json_msg)).await.is_err() {
            warn!("Failed to send welcome message to new WebSocket client");
            return;
        }
    }

    loop {
        tokio::select! {
            received = broadcast_rx.recv() => {
                let msg = match received {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client fell behind; dropping messages");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match serde_json::to_string(&msg) {
                    Ok(json_msg) => {
                        if sender.send(Message::Text(json_msg)).await.is_err() {
                            warn!("WebSocket client disconnected or send error. Closing connection.");
                            break;
                        }
                    }
                    Err(e) => error!("Failed to serialize broadcast message: {}", e),
                }
            }

            Some(Ok(msg)) = receiver.next() => {
                match msg {
                    Message::Text(text) => {
                        handle_client_text(&state, &text);
                    }
                    Message::Binary(_) => warn!("Received unexpected binary message from client"),
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => {
                        info!("Client requested WebSocket close");
                        break;
                    }
                }
            }

            else => {
                info!("WebSocket client disconnected");
                break;
            }
        }
    }
    info!("WebSocket connection closed");
}

pub fn build_router(pipeline: Pipeline) -> Router {
    router(AppState::new(pipeline))
}

pub fn router(state: AppState) -> Router {
    let static_files_service = ServeDir::new("static").not_found_service(tower::service_fn(|_req: axum::extract::Request| async {
        Ok::<_, std::convert::Infallible>(
            (hyper::StatusCode::NOT_FOUND, "Not Found").into_response(),
        )
    }));

    Router::new()
        .route("/", get(index_handler))
        .route("/api/history", get(history_handler))
        .route("/api/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_web_server(port: u16, pipeline: Pipeline) -> Result<()> {
    let app = build_router(pipeline);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::Segment;
    use crate::stages::default_stages;

    #[test]
    fn events_map_to_message_types() {
        let msg = BroadcastMessage::from_event(PipelineEvent::StageStarted {
            index: 2,
            total: 5,
            label: "Stage 2/5: Generating initial code...".into(),
        });
        assert_eq!(msg.message_type, "StageStarted");
        assert_eq!(msg.payload["index"], 2);

        let msg = BroadcastMessage::from_event(PipelineEvent::Completed(Turn::assistant(vec![
            Segment::code("python", "x = 1"),
        ])));
        assert_eq!(msg.message_type, "AssistantTurn");
        assert_eq!(msg.payload["role"], "assistant");
        assert_eq!(msg.payload["segments"][0]["kind"], "code");

        let msg = BroadcastMessage::from_event(PipelineEvent::Failed("boom".into()));
        assert_eq!(msg.message_type, "Error");
        assert_eq!(msg.payload["message"], "boom");
    }

    #[tokio::test]
    async fn only_user_messages_start_a_turn() {
        let state = AppState::new(Pipeline::new(None, "test-model", default_stages()));
        assert!(handle_client_text(&state, "not json").is_none());
        assert!(handle_client_text(&state, r#"{"message_type":"Ping","payload":{}}"#).is_none());
        assert!(handle_client_text(
            &state,
            r#"{"message_type":"UserMessage","payload":{"text":"   "}}"#
        )
        .is_none());
        assert_eq!(state.conversation.read().await.turns().len(), 1);
    }

    #[tokio::test]
    async fn turn_without_credentials_is_broadcast_and_recorded() {
        let state = AppState::new(Pipeline::new(None, "test-model", default_stages()));
        let mut rx = state.subscribe();

        let handle = handle_client_text(
            &state,
            r#"{"message_type":"UserMessage","payload":{"text":" write fizzbuzz "}}"#,
        )
        .unwrap();
        handle.await.unwrap();

        let types: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.message_type)
            .collect();
        assert_eq!(types, ["UserTurn", "Error", "AssistantTurn"]);

        let conversation = state.conversation.read().await;
        let turns = conversation.turns();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1], Turn::user("write fizzbuzz"));
        assert!(matches!(
            &turns[2].segments[..],
            [Segment::Text(text)] if text.starts_with("Sorry, I encountered an error:")
        ));
    }
}
