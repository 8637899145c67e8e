use chrono::{DateTime, Utc};
use parley_util::id_string;
use serde::{Deserialize, Serialize};

/// Snapshot of a user's presence. Connection handles are tracked by the
/// registry and are not part of the public view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[serde(with = "id_string")]
    pub user_id: i64,
    pub username: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}
