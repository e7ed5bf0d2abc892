use super::{AppState, ensure_ready, probe_engine_state};
use crate::engine::{AckLevel, ClientInfo, ConnectionState, MediaPayload, SentMessage};
use crate::error::GatewayError;
use crate::qr_cache::QrChallenge;
use crate::qr_render::render_data_url;
use crate::send::{GroupRef, Target};
use crate::session::AuthPhase;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Serialize)]
pub(super) struct StatusResponse {
    ok: bool,
    state: Option<String>,
    phase: AuthPhase,
    me: Option<ClientInfo>,
    ready: bool,
    qr_required: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct QrResponse {
    ok: bool,
    #[serde(rename = "dataURL")]
    data_url: String,
    ts: i64,
}

#[derive(Debug, Serialize)]
pub(super) struct SendResponse {
    ok: bool,
    id: String,
    to: String,
    ack: AckLevel,
}

impl From<SentMessage> for SendResponse {
    fn from(sent: SentMessage) -> Self {
        Self {
            ok: true,
            id: sent.id,
            to: sent.to,
            ack: sent.ack,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SendTextRequest {
    #[serde(default, deserialize_with = "loose_string")]
    to: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendGroupRequest {
    #[serde(default, deserialize_with = "loose_string")]
    group_id: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    group_name: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMediaRequest {
    #[serde(default, deserialize_with = "loose_string")]
    to: Option<String>,
    #[serde(default)]
    is_group: Option<bool>,
    #[serde(default, deserialize_with = "loose_string")]
    base64: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    mime_type: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    filename: Option<String>,
}

/// Accepts strings and numbers, and treats `null` or an empty string as absent.
fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// An empty body reads as an empty request so field validation reports what is missing.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::Validation(format!("invalid JSON body: {e}")))
}

fn decode_base64(raw: &str) -> Result<Vec<u8>, GatewayError> {
    let encoded = match raw.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => raw,
    };
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64_STANDARD
        .decode(compact)
        .map_err(|e| GatewayError::Validation(format!("base64 is not valid: {e}")))
}

fn qr_response(challenge: &QrChallenge) -> Result<Response, GatewayError> {
    Ok(Json(QrResponse {
        ok: true,
        data_url: render_data_url(&challenge.payload)?,
        ts: challenge.timestamp_millis(),
    })
    .into_response())
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

pub(super) async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.lifecycle.tracker().snapshot();
    let probed = probe_engine_state(&state.lifecycle).await;

    let me = match snapshot.me {
        Some(me) => Some(me),
        None => match state.lifecycle.engine().await {
            Ok(engine) if snapshot.phase.is_authenticated() => engine.info().await,
            _ => None,
        },
    };

    Json(StatusResponse {
        ok: true,
        state: probed
            .map(|s| s.as_str().to_string())
            .or(snapshot.engine_state),
        phase: snapshot.phase,
        me,
        ready: snapshot.phase == AuthPhase::Ready
            && probed == Some(ConnectionState::Connected),
        qr_required: snapshot.qr_required,
    })
}

pub(super) async fn qr(State(state): State<AppState>) -> Result<Response, GatewayError> {
    match state.lifecycle.tracker().current_qr() {
        Some(challenge) => qr_response(&challenge),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub(super) async fn qr_wait(State(state): State<AppState>) -> Result<Response, GatewayError> {
    match state.lifecycle.tracker().wait_for_qr(state.qr_wait).await {
        Some(challenge) => qr_response(&challenge),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub(super) async fn send_text(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SendResponse>, GatewayError> {
    ensure_ready(&state).await?;
    let request: SendTextRequest = parse_body(&body)?;
    let (Some(to), Some(message)) = (request.to, request.message) else {
        return Err(GatewayError::Validation("to & message required".into()));
    };

    let sent = state.sender.send_text(&Target::Phone(to), &message).await?;
    Ok(Json(sent.into()))
}

pub(super) async fn send_group(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SendResponse>, GatewayError> {
    ensure_ready(&state).await?;
    let request: SendGroupRequest = parse_body(&body)?;
    let group = match (request.group_id, request.group_name) {
        (Some(id), _) => GroupRef::Id(id),
        (None, Some(name)) => GroupRef::Name(name),
        (None, None) => return Err(group_fields_missing()),
    };
    let message = request.message.ok_or_else(group_fields_missing)?;

    let sent = state.sender.send_text(&Target::Group(group), &message).await?;
    Ok(Json(sent.into()))
}

fn group_fields_missing() -> GatewayError {
    GatewayError::Validation("message & (groupId or groupName) required".into())
}

pub(super) async fn send_media(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SendResponse>, GatewayError> {
    ensure_ready(&state).await?;
    let request: SendMediaRequest = parse_body(&body)?;
    let (Some(to), Some(encoded), Some(mime_type)) = (request.to, request.base64, request.mime_type)
    else {
        return Err(GatewayError::Validation("to, base64, mimeType required".into()));
    };

    let media = MediaPayload {
        mime_type,
        data: decode_base64(&encoded)?,
        filename: request.filename,
    };
    let target = if request.is_group.unwrap_or(false) {
        Target::Group(GroupRef::parse(&to))
    } else {
        Target::Phone(to)
    };

    let sent = state.sender.send_media(&target, media).await?;
    Ok(Json(sent.into()))
}

pub(super) async fn warmup(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    state.lifecycle.prefetch_chats().await?;
    Ok(Json(json!({ "ok": true })))
}
