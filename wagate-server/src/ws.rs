//! WebSocket fan-out endpoint. The handshake query carries the user id
//! (replaced by a JWT in production). The socket is split: a writer task
//! drains an outbound queue, and one forwarder task per subscribed topic
//! pumps bus events into that queue.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use wagate_core::eventbus::{events, topics, GatewayEvent};

use crate::context::ServerContext;

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new().route("/ws", get(upgrade)).with_state(ctx)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    user_id: Uuid,
}

async fn upgrade(
    State(ctx): State<Arc<ServerContext>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(ctx, query.user_id, socket))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientCommand {
    event: String,
    session_id: Option<String>,
    campaign_id: Option<i64>,
}

/// Forward every event from a bus subscription into the socket's outbound
/// queue. One task per topic; aborted on unsubscribe or socket close.
fn spawn_forwarder(
    ctx: &ServerContext,
    topic: String,
    out: mpsc::Sender<WsMessage>,
) -> JoinHandle<()> {
    let bus = Arc::clone(&ctx.bus);
    tokio::spawn(async move {
        let mut rx = bus.subscribe(&topic, None).await;
        while let Some(event) = rx.recv().await {
            let Ok(payload) = serde_json::to_string(&event) else {
                continue;
            };
            if out.send(WsMessage::Text(payload)).await.is_err() {
                break;
            }
        }
    })
}

async fn handle_socket(ctx: Arc<ServerContext>, user_id: Uuid, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(64);

    // Writer task: drains the outbound queue until the socket dies or the
    // process shuts down.
    let mut shutdown = ctx.bus.shutdown_signal();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = out_rx.recv() => {
                    let Some(msg) = maybe else { break };
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });

    // Every socket follows its own user topic from the start.
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
    let user_topic = topics::user(&user_id);
    forwarders.insert(
        user_topic.clone(),
        spawn_forwarder(&ctx, user_topic, out_tx.clone()),
    );
    debug!(%user_id, "websocket subscriber connected");

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            WsMessage::Text(text) => {
                if let Err(e) =
                    handle_command(&ctx, user_id, &text, &mut forwarders, &out_tx).await
                {
                    warn!(%user_id, "websocket command failed: {}", e);
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    for (_, task) in forwarders {
        task.abort();
    }
    writer.abort();
    debug!(%user_id, "websocket subscriber gone");
}

async fn handle_command(
    ctx: &ServerContext,
    user_id: Uuid,
    raw: &str,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    out: &mpsc::Sender<WsMessage>,
) -> Result<(), wagate_common::Error> {
    let command: ClientCommand = match serde_json::from_str(raw) {
        Ok(cmd) => cmd,
        Err(_) if raw.trim() == "ping" => ClientCommand {
            event: "ping".to_string(),
            session_id: None,
            campaign_id: None,
        },
        Err(e) => {
            debug!("unparseable websocket command: {}", e);
            return Ok(());
        }
    };

    match command.event.as_str() {
        "ping" => {
            let _ = out
                .send(WsMessage::Text(json!({ "event": "pong" }).to_string()))
                .await;
        }
        "subscribe:session" => {
            let Some(session_id) = command.session_id else {
                return Ok(());
            };
            // Subscriptions are scoped to sessions the user owns.
            let Some(row) = ctx.sessions.get_owned(&session_id, user_id).await? else {
                let _ = out
                    .send(WsMessage::Text(
                        json!({ "event": "error", "data": { "message": "unknown session" } })
                            .to_string(),
                    ))
                    .await;
                return Ok(());
            };
            let topic = topics::session(&session_id);
            forwarders
                .entry(topic.clone())
                .or_insert_with(|| spawn_forwarder(ctx, topic, out.clone()));
            // Replay a still-valid QR so a late subscriber can pair
            // without waiting for the next refresh.
            if row.qr_valid_at(ctx.clock.now()) {
                let event = GatewayEvent::new(
                    events::SESSION_QR,
                    json!({ "qr": row.qr_code, "expiresAt": row.qr_expires_at }),
                );
                if let Ok(payload) = serde_json::to_string(&event) {
                    let _ = out.send(WsMessage::Text(payload)).await;
                }
            }
        }
        "unsubscribe:session" => {
            if let Some(session_id) = command.session_id {
                if let Some(task) = forwarders.remove(&topics::session(&session_id)) {
                    task.abort();
                }
            }
        }
        "subscribe:broadcast" => {
            if let Some(campaign_id) = command.campaign_id {
                if ctx.broadcasts.detail(campaign_id, user_id).await?.is_some() {
                    let topic = topics::broadcast(campaign_id);
                    forwarders
                        .entry(topic.clone())
                        .or_insert_with(|| spawn_forwarder(ctx, topic, out.clone()));
                }
            }
        }
        "unsubscribe:broadcast" => {
            if let Some(campaign_id) = command.campaign_id {
                if let Some(task) = forwarders.remove(&topics::broadcast(campaign_id)) {
                    task.abort();
                }
            }
        }
        other => debug!("unknown websocket event '{}'", other),
    }
    Ok(())
}
