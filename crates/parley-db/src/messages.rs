use crate::{bool_from_any_row, datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

const MESSAGE_COLUMNS: &str = "m.id, m.thread_id, m.seq, m.sender_id, m.content, m.message_type,
     m.media_url, m.media_filename, m.status, m.pinned, m.deleted, m.forwarded_from, m.created_at";

/// Hides messages the viewer deleted for themselves.
const VISIBLE_TO_VIEWER: &str = "NOT EXISTS (
         SELECT 1 FROM chat_message_hidden h WHERE h.message_id = m.id AND h.user_id = $2)";

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub thread_id: i64,
    pub seq: i64,
    pub sender_id: i64,
    pub content: Option<String>,
    pub message_type: String,
    pub media_url: Option<String>,
    pub media_filename: Option<String>,
    pub status: i64,
    pub pinned: bool,
    pub deleted: bool,
    pub forwarded_from: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            thread_id: row.try_get("thread_id")?,
            seq: row.try_get("seq")?,
            sender_id: row.try_get("sender_id")?,
            content: row.try_get("content")?,
            message_type: row.try_get("message_type")?,
            media_url: row.try_get("media_url")?,
            media_filename: row.try_get("media_filename")?,
            status: row.try_get("status")?,
            pinned: bool_from_any_row(row, "pinned")?,
            deleted: bool_from_any_row(row, "deleted")?,
            forwarded_from: row.try_get("forwarded_from")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub id: i64,
    pub thread_id: i64,
    pub sender_id: i64,
    pub content: Option<&'a str>,
    pub message_type: &'a str,
    pub media_url: Option<&'a str>,
    pub media_filename: Option<&'a str>,
    pub forwarded_from: Option<i64>,
    /// Text shown in the thread list for this message.
    pub preview: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Append a message at the end of the thread log. In one transaction this
/// assigns the next sequence number, refreshes the last-message summary and
/// bumps the unread counter of every participant other than the sender.
pub async fn append_message(pool: &DbPool, new: &NewMessage<'_>) -> Result<MessageRow, DbError> {
    let created_at = datetime_to_db_text(new.created_at);
    let mut tx = pool.begin().await?;

    let seq: Option<i64> = sqlx::query_scalar(
        "UPDATE chat_threads
         SET message_count = message_count + 1,
             last_message_text = $2,
             last_message_sender_id = $3,
             last_message_at = $4,
             updated_at = $4
         WHERE id = $1
         RETURNING message_count",
    )
    .bind(new.thread_id)
    .bind(new.preview)
    .bind(new.sender_id)
    .bind(&created_at)
    .fetch_optional(&mut *tx)
    .await?;
    let seq = seq.ok_or(DbError::NotFound)?;

    let row = sqlx::query_as::<_, MessageRow>(
        "INSERT INTO chat_messages
             (id, thread_id, seq, sender_id, content, message_type, media_url, media_filename,
              status, pinned, deleted, forwarded_from, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, 0, 0, $9, $10)
         RETURNING id, thread_id, seq, sender_id, content, message_type, media_url, media_filename,
                   status, pinned, deleted, forwarded_from, created_at",
    )
    .bind(new.id)
    .bind(new.thread_id)
    .bind(seq)
    .bind(new.sender_id)
    .bind(new.content)
    .bind(new.message_type)
    .bind(new.media_url)
    .bind(new.media_filename)
    .bind(new.forwarded_from)
    .bind(&created_at)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE chat_participants SET unread_count = unread_count + 1
         WHERE thread_id = $1 AND user_id <> $2",
    )
    .bind(new.thread_id)
    .bind(new.sender_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

pub async fn get_message(
    pool: &DbPool,
    thread_id: i64,
    message_id: i64,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages m WHERE m.id = $1 AND m.thread_id = $2"
    ))
    .bind(message_id)
    .bind(thread_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn count_visible_messages(
    pool: &DbPool,
    thread_id: i64,
    viewer_id: i64,
) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM chat_messages m WHERE m.thread_id = $1 AND {VISIBLE_TO_VIEWER}"
    ))
    .bind(thread_id)
    .bind(viewer_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Newest-first slice of the messages visible to `viewer_id`.
pub async fn page_visible_messages(
    pool: &DbPool,
    thread_id: i64,
    viewer_id: i64,
    limit: i64,
    offset: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages m
         WHERE m.thread_id = $1 AND {VISIBLE_TO_VIEWER}
         ORDER BY m.seq DESC
         LIMIT $3 OFFSET $4"
    ))
    .bind(thread_id)
    .bind(viewer_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// `(message_id, user_id)` pairs of delete-for-me marks within a sequence range.
pub async fn hidden_marks_in_range(
    pool: &DbPool,
    thread_id: i64,
    min_seq: i64,
    max_seq: i64,
) -> Result<Vec<(i64, i64)>, DbError> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT h.message_id, h.user_id
         FROM chat_message_hidden h
         INNER JOIN chat_messages m ON m.id = h.message_id
         WHERE m.thread_id = $1 AND m.seq BETWEEN $2 AND $3
         ORDER BY h.message_id, h.user_id",
    )
    .bind(thread_id)
    .bind(min_seq)
    .bind(max_seq)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn hidden_for_message(pool: &DbPool, message_id: i64) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM chat_message_hidden WHERE message_id = $1 ORDER BY user_id",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Raise the stored status to `rank` if it is currently lower. Returns whether
/// the row changed; a lower or equal rank is a no-op.
pub async fn advance_status(
    pool: &DbPool,
    thread_id: i64,
    message_id: i64,
    rank: i64,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE chat_messages SET status = $3 WHERE id = $1 AND thread_id = $2 AND status < $3",
    )
    .bind(message_id)
    .bind(thread_id)
    .bind(rank)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn hide_for_user(pool: &DbPool, message_id: i64, user_id: i64) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO chat_message_hidden (message_id, user_id) VALUES ($1, $2)
         ON CONFLICT (message_id, user_id) DO NOTHING",
    )
    .bind(message_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace the message with a tombstone for every participant. When it is the
/// newest message of the thread, the thread preview is replaced as well.
pub async fn mark_deleted(
    pool: &DbPool,
    thread_id: i64,
    message_id: i64,
    tombstone: &str,
) -> Result<MessageRow, DbError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, MessageRow>(
        "UPDATE chat_messages
         SET deleted = 1, content = $3, media_url = NULL, media_filename = NULL
         WHERE id = $1 AND thread_id = $2
         RETURNING id, thread_id, seq, sender_id, content, message_type, media_url, media_filename,
                   status, pinned, deleted, forwarded_from, created_at",
    )
    .bind(message_id)
    .bind(thread_id)
    .bind(tombstone)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(DbError::NotFound)?;

    sqlx::query(
        "UPDATE chat_threads SET last_message_text = $2
         WHERE id = $1 AND message_count = $3",
    )
    .bind(thread_id)
    .bind(tombstone)
    .bind(row.seq)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

/// Flip the pinned flag. Returns the new value, or `None` for an unknown message.
pub async fn toggle_pin(
    pool: &DbPool,
    thread_id: i64,
    message_id: i64,
) -> Result<Option<bool>, DbError> {
    let pinned: Option<i64> = sqlx::query_scalar(
        "UPDATE chat_messages SET pinned = 1 - pinned
         WHERE id = $1 AND thread_id = $2
         RETURNING pinned",
    )
    .bind(message_id)
    .bind(thread_id)
    .fetch_optional(pool)
    .await?;
    Ok(pinned.map(|p| p != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_pool, threads};

    fn text_message(id: i64, thread_id: i64, sender_id: i64, text: &'static str) -> NewMessage<'static> {
        NewMessage {
            id,
            thread_id,
            sender_id,
            content: Some(text),
            message_type: "text",
            media_url: None,
            media_filename: None,
            forwarded_from: None,
            preview: text,
            created_at: Utc::now(),
        }
    }

    async fn setup_thread(pool: &DbPool) -> i64 {
        threads::create_thread(pool, 10, 1, 2).await.unwrap();
        10
    }

    #[tokio::test]
    async fn append_assigns_sequence_and_updates_thread() {
        let pool = test_pool().await;
        let thread_id = setup_thread(&pool).await;

        let first = append_message(&pool, &text_message(1000, thread_id, 1, "hello"))
            .await
            .unwrap();
        let second = append_message(&pool, &text_message(1001, thread_id, 1, "again"))
            .await
            .unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(first.status, 0);
        assert!(!first.pinned && !first.deleted);

        let thread = threads::get_thread(&pool, thread_id).await.unwrap().unwrap();
        assert_eq!(thread.message_count, 2);
        assert_eq!(thread.last_message_text.as_deref(), Some("again"));
        assert_eq!(thread.last_message_sender_id, Some(1));
        assert_eq!(
            threads::get_unread_counts(&pool, thread_id).await.unwrap(),
            vec![(1, 0), (2, 2)]
        );
    }

    #[tokio::test]
    async fn append_to_missing_thread_is_not_found() {
        let pool = test_pool().await;
        let err = append_message(&pool, &text_message(1, 999, 1, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound));
    }

    #[tokio::test]
    async fn status_only_moves_forward() {
        let pool = test_pool().await;
        let thread_id = setup_thread(&pool).await;
        append_message(&pool, &text_message(2000, thread_id, 1, "hi"))
            .await
            .unwrap();

        assert!(advance_status(&pool, thread_id, 2000, 2).await.unwrap());
        assert!(!advance_status(&pool, thread_id, 2000, 1).await.unwrap());
        let msg = get_message(&pool, thread_id, 2000).await.unwrap().unwrap();
        assert_eq!(msg.status, 2);
    }

    #[tokio::test]
    async fn hidden_messages_are_excluded_for_that_viewer_only() {
        let pool = test_pool().await;
        let thread_id = setup_thread(&pool).await;
        for (i, text) in ["a", "b", "c"].into_iter().enumerate() {
            append_message(&pool, &text_message(3000 + i as i64, thread_id, 1, text))
                .await
                .unwrap();
        }
        hide_for_user(&pool, 3001, 2).await.unwrap();
        hide_for_user(&pool, 3001, 2).await.unwrap();

        assert_eq!(count_visible_messages(&pool, thread_id, 2).await.unwrap(), 2);
        assert_eq!(count_visible_messages(&pool, thread_id, 1).await.unwrap(), 3);

        let page = page_visible_messages(&pool, thread_id, 2, 10, 0).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3002, 3000]);

        assert_eq!(hidden_for_message(&pool, 3001).await.unwrap(), vec![2]);
        assert_eq!(
            hidden_marks_in_range(&pool, thread_id, 1, 3).await.unwrap(),
            vec![(3001, 2)]
        );
    }

    #[tokio::test]
    async fn mark_deleted_replaces_preview_of_newest_message() {
        let pool = test_pool().await;
        let thread_id = setup_thread(&pool).await;
        append_message(&pool, &text_message(4000, thread_id, 1, "old"))
            .await
            .unwrap();
        append_message(&pool, &text_message(4001, thread_id, 1, "new"))
            .await
            .unwrap();

        let deleted = mark_deleted(&pool, thread_id, 4000, "gone").await.unwrap();
        assert!(deleted.deleted);
        let thread = threads::get_thread(&pool, thread_id).await.unwrap().unwrap();
        assert_eq!(thread.last_message_text.as_deref(), Some("new"));

        mark_deleted(&pool, thread_id, 4001, "gone").await.unwrap();
        let thread = threads::get_thread(&pool, thread_id).await.unwrap().unwrap();
        assert_eq!(thread.last_message_text.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn toggle_pin_flips_and_reports_unknown() {
        let pool = test_pool().await;
        let thread_id = setup_thread(&pool).await;
        append_message(&pool, &text_message(5000, thread_id, 2, "pin me"))
            .await
            .unwrap();

        assert_eq!(toggle_pin(&pool, thread_id, 5000).await.unwrap(), Some(true));
        assert_eq!(toggle_pin(&pool, thread_id, 5000).await.unwrap(), Some(false));
        assert_eq!(toggle_pin(&pool, thread_id, 5999).await.unwrap(), None);
    }
}
