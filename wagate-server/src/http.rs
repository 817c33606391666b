//! HTTP surface. Every response wraps a `{success, data?, error?}`
//! envelope; domain errors map onto 4xx/5xx statuses, with rate-limit
//! denials carrying a Retry-After hint.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use wagate_common::models::{CampaignStatus, Direction, Message, MessageStatus, MessageType, Session, SessionStatus};
use wagate_common::Error;
use wagate_core::broadcast::CreateCampaignInput;
use wagate_core::transport::jid;
use wagate_core::util::phone;

use crate::context::ServerContext;

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/:sid/status", get(session_status))
        .route("/api/sessions/:sid/qr", get(session_qr))
        .route("/api/sessions/:sid/connect", post(connect_session))
        .route("/api/sessions/:sid/disconnect", post(disconnect_session))
        .route("/api/sessions/:sid/cleanup", post(cleanup_session))
        .route("/api/sessions/:sid", delete(delete_session))
        .route("/api/broadcasts", post(create_broadcast).get(list_broadcasts))
        .route("/api/broadcasts/:cid", get(broadcast_detail))
        .route("/api/broadcasts/:cid/execute", post(execute_broadcast))
        .route("/api/broadcasts/:cid/cancel", post(cancel_broadcast))
        .route("/api/contacts/:sid/scrape", post(scrape_contacts))
        .route("/api/contacts/:sid/status", get(scrape_status))
        .route("/api/contacts/:sid", get(list_contacts))
        .route("/api/groups/:sid/scrape", post(scrape_groups))
        .route("/api/groups/:sid", get(list_groups))
        .route("/api/groups/members/:gid/scrape", post(scrape_group_members))
        .route("/api/group-broadcast/:sid/send", post(group_broadcast))
        .route("/api/send-message", post(send_message))
        .route("/api/send-media", post(send_media))
        .with_state(ctx)
}

/// Error wrapper so handlers can use `?` on core errors.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after_ms) = match &self.0 {
            Error::InvalidArgument(_) | Error::Json(_) => (StatusCode::BAD_REQUEST, None),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, None),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, None),
            Error::Precondition(_) => (StatusCode::CONFLICT, None),
            Error::RateLimited { retry_after_ms, .. } => {
                (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after_ms))
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("request failed: {}", self.0);
        }
        let body = Json(json!({ "success": false, "error": self.0.to_string() }));
        let mut response = (status, body).into_response();
        if let Some(ms) = retry_after_ms {
            let secs = (ms + 999) / 1000;
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

fn envelope<T: serde::Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Authentication is an external collaborator; the gateway trusts the
/// user id placed on the request by the fronting proxy.
fn user_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| ApiError(Error::Forbidden("missing or invalid x-user-id".to_string())))
}

async fn owned_session(
    ctx: &ServerContext,
    session_id: &str,
    user: Uuid,
) -> Result<Session, ApiError> {
    ctx.sessions
        .get_owned(session_id, user)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound(format!("session '{}'", session_id))))
}

// ---------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    session_id: Option<String>,
    display_name: String,
    ai_assistant_type: Option<String>,
    ai_config: Option<Value>,
    webhook_url: Option<String>,
    settings: Option<Value>,
}

async fn create_session(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    if body.display_name.trim().is_empty() {
        return Err(ApiError(Error::InvalidArgument(
            "displayName is required".to_string(),
        )));
    }
    let session_id = body
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let now = Utc::now();
    let row = Session {
        id: 0,
        session_id,
        user_id: user,
        display_name: body.display_name,
        phone_number: None,
        status: SessionStatus::QrPending,
        qr_code: None,
        qr_expires_at: None,
        ai_assistant_type: body.ai_assistant_type,
        ai_config: body.ai_config.unwrap_or_else(|| json!({})),
        webhook_url: body.webhook_url,
        settings: body.settings.unwrap_or_else(|| json!({})),
        last_connected_at: None,
        last_disconnected_at: None,
        is_active: true,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    };
    let created = ctx.sessions.create(&row).await?;
    ctx.manager.create(&created.session_id, user).await?;
    Ok(envelope(created))
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    active: Option<bool>,
}

async fn list_sessions(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let rows = ctx
        .sessions
        .list_for_user(user, query.active.unwrap_or(false))
        .await?;
    Ok(envelope(rows))
}

async fn session_status(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let row = owned_session(&ctx, &sid, user).await?;
    // Reconcile the persisted status against the live transport.
    let connected = ctx.manager.is_connected(&sid).await;
    Ok(envelope(json!({
        "sessionId": row.session_id,
        "status": row.status,
        "phoneNumber": row.phone_number,
        "active": ctx.manager.is_active(&sid).await,
        "connected": connected,
        "lastConnectedAt": row.last_connected_at,
        "lastDisconnectedAt": row.last_disconnected_at,
    })))
}

async fn session_qr(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let row = owned_session(&ctx, &sid, user).await?;
    let now = ctx.clock.now();
    Ok(envelope(json!({
        "qr": row.qr_code,
        "expiresAt": row.qr_expires_at,
        "expired": !row.qr_valid_at(now),
    })))
}

async fn connect_session(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    owned_session(&ctx, &sid, user).await?;
    ctx.manager.create(&sid, user).await?;
    Ok(envelope(json!({ "sessionId": sid, "connecting": true })))
}

#[derive(Debug, Deserialize, Default)]
struct DisconnectBody {
    logout: Option<bool>,
}

async fn disconnect_session(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    body: Option<Json<DisconnectBody>>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    owned_session(&ctx, &sid, user).await?;
    let logout = body.and_then(|Json(b)| b.logout).unwrap_or(false);
    ctx.manager.disconnect(&sid, logout).await?;
    Ok(envelope(json!({ "sessionId": sid, "disconnected": true, "logout": logout })))
}

async fn cleanup_session(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    owned_session(&ctx, &sid, user).await?;
    ctx.manager.cleanup(&sid).await?;
    Ok(envelope(json!({ "sessionId": sid, "cleaned": true })))
}

async fn delete_session(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    owned_session(&ctx, &sid, user).await?;
    ctx.manager.disconnect(&sid, false).await?;
    ctx.sessions.soft_delete(&sid).await?;
    Ok(envelope(json!({ "sessionId": sid, "deleted": true })))
}

// ---------------------------------------------------------------------
// Broadcasts
// ---------------------------------------------------------------------

async fn create_broadcast(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(input): Json<CreateCampaignInput>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let created = ctx.broadcasts.create(user, input).await?;
    Ok(envelope(created))
}

#[derive(Debug, Deserialize)]
struct ListBroadcastsQuery {
    status: Option<CampaignStatus>,
}

async fn list_broadcasts(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Query(query): Query<ListBroadcastsQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    // Listing goes through the campaign gateway the executor owns.
    let rows = ctx.broadcasts.list(user, query.status).await?;
    Ok(envelope(rows))
}

async fn broadcast_detail(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(cid): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let campaign = ctx
        .broadcasts
        .detail(cid, user)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound(format!("campaign {}", cid))))?;
    Ok(envelope(campaign))
}

async fn execute_broadcast(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(cid): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    ctx.broadcasts.execute(cid, user).await?;
    Ok(envelope(json!({ "campaignId": cid, "started": true })))
}

async fn cancel_broadcast(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(cid): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    ctx.broadcasts.cancel(cid, user).await?;
    Ok(envelope(json!({ "campaignId": cid, "cancelled": true })))
}

// ---------------------------------------------------------------------
// Contacts & groups
// ---------------------------------------------------------------------

async fn scrape_contacts(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let total = ctx.scraper.scrape_contacts(user, &sid).await?;
    Ok(envelope(json!({ "sessionId": sid, "totalScraped": total })))
}

async fn scrape_status(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    owned_session(&ctx, &sid, user).await?;
    let status = ctx.scraper.quota_status(user, &sid).await?;
    Ok(envelope(status))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_contacts(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    owned_session(&ctx, &sid, user).await?;
    let limit = page.limit.unwrap_or(100).clamp(1, 500);
    let offset = page.offset.unwrap_or(0).max(0);
    let rows = ctx.contacts.list(user, &sid, limit, offset).await?;
    let total = ctx.contacts.count(user, &sid).await?;
    Ok(envelope(json!({ "contacts": rows, "total": total })))
}

async fn scrape_groups(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let total = ctx.scraper.scrape_groups(user, &sid).await?;
    Ok(envelope(json!({ "sessionId": sid, "totalScraped": total })))
}

async fn list_groups(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    owned_session(&ctx, &sid, user).await?;
    let rows = ctx.groups.list(user, &sid).await?;
    Ok(envelope(rows))
}

async fn scrape_group_members(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(gid): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let total = ctx.scraper.scrape_group_members(user, gid).await?;
    Ok(envelope(json!({ "groupId": gid, "totalScraped": total })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupBroadcastBody {
    group_ids: Vec<String>,
    message: String,
}

async fn group_broadcast(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<GroupBroadcastBody>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let report = ctx
        .broadcasts
        .send_to_groups(user, &sid, &body.group_ids, &body.message)
        .await?;
    Ok(envelope(report))
}

// ---------------------------------------------------------------------
// One-shot sends
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    session_id: String,
    to: String,
    message: String,
}

async fn send_message(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let session = owned_session(&ctx, &body.session_id, user).await?;
    if body.message.trim().is_empty() {
        return Err(ApiError(Error::InvalidArgument(
            "message is required".to_string(),
        )));
    }

    let decision = ctx.limiter.check(&body.session_id).await?;
    if !decision.can_send {
        return Err(ApiError(decision.into_error()));
    }

    let to = phone::normalize(&body.to);
    if !phone::is_plausible(&to) {
        return Err(ApiError(Error::InvalidArgument(format!(
            "invalid destination '{}'",
            body.to
        ))));
    }
    let receipt = ctx
        .manager
        .send_text(&body.session_id, &jid::jid_from_phone(&to), &body.message)
        .await?;
    ctx.limiter.record_sent(&body.session_id).await?;

    record_outgoing(
        &ctx,
        &session,
        &receipt.message_id,
        MessageType::Text,
        &to,
        Some(body.message.as_str()),
        Value::Null,
    )
    .await;
    Ok(envelope(json!({ "messageId": receipt.message_id, "to": to })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMediaBody {
    session_id: String,
    to: String,
    media_url: String,
    caption: Option<String>,
    #[serde(rename = "type")]
    media_type: Option<String>,
    mimetype: Option<String>,
}

async fn send_media(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(body): Json<SendMediaBody>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let session = owned_session(&ctx, &body.session_id, user).await?;
    if body.media_url.trim().is_empty() {
        return Err(ApiError(Error::InvalidArgument(
            "mediaUrl is required".to_string(),
        )));
    }

    let decision = ctx.limiter.check(&body.session_id).await?;
    if !decision.can_send {
        return Err(ApiError(decision.into_error()));
    }

    let to = phone::normalize(&body.to);
    if !phone::is_plausible(&to) {
        return Err(ApiError(Error::InvalidArgument(format!(
            "invalid destination '{}'",
            body.to
        ))));
    }
    let to_jid = jid::jid_from_phone(&to);
    let caption = body.caption.as_deref();

    let (receipt, message_type) = match body.media_type.as_deref().unwrap_or("image") {
        "document" => {
            let mimetype = body.mimetype.as_deref().unwrap_or("application/octet-stream");
            let receipt = ctx
                .manager
                .send_document(&body.session_id, &to_jid, &body.media_url, mimetype, caption)
                .await?;
            (receipt, MessageType::Document)
        }
        "image" => {
            let receipt = ctx
                .manager
                .send_image(&body.session_id, &to_jid, &body.media_url, caption)
                .await?;
            (receipt, MessageType::Image)
        }
        other => {
            return Err(ApiError(Error::InvalidArgument(format!(
                "unsupported media type '{}'",
                other
            ))))
        }
    };
    ctx.limiter.record_sent(&body.session_id).await?;

    record_outgoing(
        &ctx,
        &session,
        &receipt.message_id,
        message_type,
        &to,
        caption,
        json!({ "mediaUrl": body.media_url, "mimetype": body.mimetype }),
    )
    .await;
    Ok(envelope(json!({ "messageId": receipt.message_id, "to": to })))
}

#[allow(clippy::too_many_arguments)]
async fn record_outgoing(
    ctx: &ServerContext,
    session: &Session,
    message_id: &str,
    message_type: MessageType,
    to: &str,
    content: Option<&str>,
    media: Value,
) {
    let now: DateTime<Utc> = ctx.clock.now();
    let row = Message {
        id: 0,
        session_id: session.session_id.clone(),
        message_id: message_id.to_string(),
        direction: Direction::Outgoing,
        message_type,
        from_number: session.phone_number.clone().unwrap_or_default(),
        to_number: to.to_string(),
        push_name: None,
        content: content.map(str::to_string),
        media,
        status: MessageStatus::Sent,
        is_auto_reply: false,
        auto_reply_source: None,
        reply_context: Value::Null,
        sent_at: Some(now),
        delivered_at: None,
        read_at: None,
        created_at: now,
    };
    if let Err(e) = ctx.messages.insert_outgoing(&row).await {
        warn!(message_id, "outgoing message bookkeeping failed: {}", e);
    }
}
