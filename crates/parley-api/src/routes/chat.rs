use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, Multipart, Path, Query, Request, State,
    },
    http::{header, StatusCode},
    Json,
};
use parley_core::AppState;
use parley_media::StoredMedia;
use parley_models::message::{DeleteScope, MessageContent, MessageType};
use parley_util::pagination::PageParams;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChatRequest {
    #[serde(with = "parley_util::id_string")]
    pub recipient_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageRequest {
    pub delete_for: DeleteScope,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardMessageRequest {
    #[serde(with = "parley_util::id_string::vec")]
    pub target_thread_ids: Vec<i64>,
}

pub async fn start_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    body: Result<Json<StartChatRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(body) = body?;
    let (thread, created) = state
        .threads
        .start_or_get_thread(auth.user_id, body.recipient_id)
        .await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "success": true, "data": thread }))))
}

pub async fn list_chats(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let threads = state.threads.list_threads(auth.user_id).await?;
    Ok(Json(json!({ "success": true, "data": threads })))
}

pub async fn get_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    path: Result<Path<i64>, PathRejection>,
    query: Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(thread_id) = path?;
    let Query(params) = query?;
    let page = state
        .threads
        .get_messages(thread_id, auth.user_id, params)
        .await?;
    Ok(Json(json!({ "success": true, "data": page })))
}

/// Accepts a JSON body or a multipart form with a `text` field and an
/// optional `media` file part.
pub async fn send_message(
    State(state): State<AppState>,
    auth: AuthUser,
    path: Result<Path<i64>, PathRejection>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Path(thread_id) = path?;
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let (content, upload) = if is_multipart {
        let multipart = Multipart::from_request(request, &state).await?;
        read_multipart_message(&state, multipart).await?
    } else {
        let Json(content) = Json::<MessageContent>::from_request(request, &state).await?;
        (content, None)
    };

    let sent = state
        .router
        .send_message(thread_id, &auth.identity(), &content)
        .await;
    let message = match sent {
        Ok(message) => message,
        Err(err) => {
            if let Some(upload) = upload {
                if let Err(cleanup) = state.media.remove(&upload.key).await {
                    tracing::warn!(key = %upload.key, error = %cleanup, "failed to remove orphaned upload");
                }
            }
            return Err(err.into());
        }
    };
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": message })),
    ))
}

struct PendingUpload {
    filename: String,
    content_type: Option<String>,
    data: axum::body::Bytes,
}

/// Every field is read before anything touches the media store, so a bad
/// form leaves nothing behind.
async fn read_multipart_message(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<(MessageContent, Option<StoredMedia>), ApiError> {
    let mut text = None;
    let mut message_type = None;
    let mut pending: Option<PendingUpload> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("text") => text = Some(field.text().await?),
            Some("messageType") => {
                let raw = field.text().await?;
                message_type = Some(
                    MessageType::parse(&raw)
                        .ok_or_else(|| ApiError::BadRequest(format!("unknown messageType '{raw}'")))?,
                );
            }
            Some("media") if pending.is_none() => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await?;
                if data.is_empty() {
                    return Err(ApiError::BadRequest("Empty file".into()));
                }
                pending = Some(PendingUpload {
                    filename,
                    content_type,
                    data,
                });
            }
            _ => {}
        }
    }

    let upload = match pending {
        Some(file) => Some(
            state
                .media
                .store_upload(&file.filename, file.content_type.as_deref(), &file.data)
                .await?,
        ),
        None => None,
    };

    let content = MessageContent {
        text,
        message_type: message_type
            .filter(|t| *t != MessageType::Text)
            .or_else(|| upload.as_ref().map(StoredMedia::message_type)),
        media: upload.as_ref().map(StoredMedia::media_ref),
    };
    Ok((content, upload))
}

pub async fn delete_message(
    State(state): State<AppState>,
    auth: AuthUser,
    path: Result<Path<(i64, i64)>, PathRejection>,
    body: Result<Json<DeleteMessageRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path((thread_id, message_id)) = path?;
    let Json(body) = body?;
    let message = state
        .router
        .delete_message(thread_id, message_id, &auth.identity(), body.delete_for)
        .await?;
    let note = match body.delete_for {
        DeleteScope::Me => "Message deleted for you",
        DeleteScope::Everyone => "Message deleted for everyone",
    };
    Ok(Json(json!({ "success": true, "message": note, "data": message })))
}

pub async fn toggle_pin(
    State(state): State<AppState>,
    auth: AuthUser,
    path: Result<Path<(i64, i64)>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path((thread_id, message_id)) = path?;
    let is_pinned = state
        .router
        .toggle_pin(thread_id, message_id, &auth.identity())
        .await?;
    Ok(Json(json!({
        "success": true,
        "data": {
            "messageId": message_id.to_string(),
            "isPinned": is_pinned,
        }
    })))
}

pub async fn forward_message(
    State(state): State<AppState>,
    auth: AuthUser,
    path: Result<Path<(i64, i64)>, PathRejection>,
    body: Result<Json<ForwardMessageRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path((thread_id, message_id)) = path?;
    let Json(body) = body?;
    if body.target_thread_ids.is_empty() {
        return Err(ApiError::BadRequest(
            "targetThreadIds must not be empty".into(),
        ));
    }
    let copies = state
        .router
        .forward_message(thread_id, message_id, &body.target_thread_ids, &auth.identity())
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Message forwarded to {} chat(s)", copies.len()),
        "data": copies,
    })))
}
