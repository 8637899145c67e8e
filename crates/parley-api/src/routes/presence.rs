use axum::{
    extract::{rejection::PathRejection, Path, State},
    Json,
};
use parley_core::AppState;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;

pub async fn get_presence(
    State(state): State<AppState>,
    _auth: AuthUser,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(user_id) = path?;
    let presence = state.presence.presence(user_id).await;
    Ok(Json(json!({
        "success": true,
        "data": {
            "userId": user_id.to_string(),
            "isOnline": presence.as_ref().is_some_and(|p| p.is_online),
            "lastSeen": presence.map(|p| p.last_seen),
        }
    })))
}
