use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

const THREAD_COLUMNS: &str = "t.id, t.user_lo, t.user_hi, t.last_message_text, t.last_message_sender_id,
     t.last_message_at, t.message_count, t.created_at, t.updated_at";

#[derive(Debug, Clone)]
pub struct ThreadRow {
    pub id: i64,
    pub user_lo: i64,
    pub user_hi: i64,
    pub last_message_text: Option<String>,
    pub last_message_sender_id: Option<i64>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadRow {
    pub fn participants(&self) -> [i64; 2] {
        [self.user_lo, self.user_hi]
    }

    pub fn has_participant(&self, user_id: i64) -> bool {
        self.user_lo == user_id || self.user_hi == user_id
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ThreadRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let last_message_at_raw: Option<String> = row.try_get("last_message_at")?;
        let created_at_raw: String = row.try_get("created_at")?;
        let updated_at_raw: String = row.try_get("updated_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_lo: row.try_get("user_lo")?,
            user_hi: row.try_get("user_hi")?,
            last_message_text: row.try_get("last_message_text")?,
            last_message_sender_id: row.try_get("last_message_sender_id")?,
            last_message_at: last_message_at_raw
                .as_deref()
                .map(datetime_from_db_text)
                .transpose()?,
            message_count: row.try_get("message_count")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
            updated_at: datetime_from_db_text(&updated_at_raw)?,
        })
    }
}

/// A thread as seen from one participant's list.
#[derive(Debug, Clone)]
pub struct ThreadListRow {
    pub thread: ThreadRow,
    pub unread_count: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ThreadListRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            thread: ThreadRow::from_row(row)?,
            unread_count: row.try_get("unread_count")?,
        })
    }
}

/// Order-independent key for a participant pair.
pub fn canonical_pair(user_a: i64, user_b: i64) -> (i64, i64) {
    if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    }
}

pub async fn find_thread_between(
    pool: &DbPool,
    user_a: i64,
    user_b: i64,
) -> Result<Option<ThreadRow>, DbError> {
    let (lo, hi) = canonical_pair(user_a, user_b);
    let row = sqlx::query_as::<_, ThreadRow>(&format!(
        "SELECT {THREAD_COLUMNS} FROM chat_threads t WHERE t.user_lo = $1 AND t.user_hi = $2"
    ))
    .bind(lo)
    .bind(hi)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Insert a thread for the pair unless one exists. Returns the stored thread
/// and whether this call created it. Concurrent callers converge on one row
/// through the unique pair index.
pub async fn create_thread(
    pool: &DbPool,
    thread_id: i64,
    user_a: i64,
    user_b: i64,
) -> Result<(ThreadRow, bool), DbError> {
    let (lo, hi) = canonical_pair(user_a, user_b);
    let now = datetime_to_db_text(Utc::now());
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO chat_threads (id, user_lo, user_hi, message_count, created_at, updated_at)
         VALUES ($1, $2, $3, 0, $4, $4)
         ON CONFLICT (user_lo, user_hi) DO NOTHING",
    )
    .bind(thread_id)
    .bind(lo)
    .bind(hi)
    .bind(&now)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if inserted {
        sqlx::query(
            "INSERT INTO chat_participants (thread_id, user_id, unread_count)
             VALUES ($1, $2, 0), ($1, $3, 0)",
        )
        .bind(thread_id)
        .bind(lo)
        .bind(hi)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    let row = find_thread_between(pool, lo, hi)
        .await?
        .ok_or(DbError::NotFound)?;
    Ok((row, inserted))
}

pub async fn get_thread(pool: &DbPool, thread_id: i64) -> Result<Option<ThreadRow>, DbError> {
    let row = sqlx::query_as::<_, ThreadRow>(&format!(
        "SELECT {THREAD_COLUMNS} FROM chat_threads t WHERE t.id = $1"
    ))
    .bind(thread_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Threads the user takes part in, most recent activity first. Threads
/// without messages sort after active ones, newest first.
pub async fn list_user_threads(
    pool: &DbPool,
    user_id: i64,
) -> Result<Vec<ThreadListRow>, DbError> {
    let rows = sqlx::query_as::<_, ThreadListRow>(&format!(
        "SELECT {THREAD_COLUMNS}, p.unread_count
         FROM chat_threads t
         INNER JOIN chat_participants p ON p.thread_id = t.id AND p.user_id = $1
         ORDER BY CASE WHEN t.last_message_at IS NULL THEN 1 ELSE 0 END,
                  t.last_message_at DESC, t.created_at DESC, t.id DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_unread_counts(pool: &DbPool, thread_id: i64) -> Result<Vec<(i64, i64)>, DbError> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT user_id, unread_count FROM chat_participants WHERE thread_id = $1 ORDER BY user_id",
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn is_participant(pool: &DbPool, thread_id: i64, user_id: i64) -> Result<bool, DbError> {
    let exists: Option<(i64,)> = sqlx::query_as(
        "SELECT thread_id FROM chat_participants WHERE thread_id = $1 AND user_id = $2",
    )
    .bind(thread_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(exists.is_some())
}

pub async fn reset_unread(pool: &DbPool, thread_id: i64, user_id: i64) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE chat_participants SET unread_count = 0 WHERE thread_id = $1 AND user_id = $2",
    )
    .bind(thread_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}
