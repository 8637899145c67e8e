use crate::error::CoreError;
use crate::thread_locks::{ThreadGuard, ThreadLocks};
use parley_db::messages::{MessageRow, NewMessage};
use parley_db::threads::ThreadRow;
use parley_db::DbPool;
use parley_models::message::{
    DeleteScope, MediaRef, Message, MessageContent, MessageStatus, MessageType, TOMBSTONE_TEXT,
};
use parley_models::thread::{LastMessage, MessagePage, Thread, ThreadSummary, UnreadCount};
use parley_util::pagination::PageParams;
use parley_util::{snowflake, validation};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Durable chat threads and their message logs.
///
/// Appends, deletes for everyone and history reads of one thread are
/// serialized through a per-thread lock so sequence numbers, unread counters
/// and the last-message preview always agree. Status updates and pin toggles
/// are single conditional statements and skip the lock.
#[derive(Clone)]
pub struct ThreadStore {
    pool: DbPool,
    locks: Arc<ThreadLocks>,
    worker_id: u16,
}

impl ThreadStore {
    pub fn new(pool: DbPool, worker_id: u16) -> Self {
        Self {
            pool,
            locks: Arc::new(ThreadLocks::new()),
            worker_id,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn lock(&self, thread_id: i64) -> ThreadGuard {
        self.locks.acquire(thread_id).await
    }

    pub fn prune_locks(&self) -> usize {
        self.locks.prune_idle()
    }

    /// Return the thread for the pair, creating it on first use. The flag is
    /// true only for the call that created it.
    pub async fn start_or_get_thread(
        &self,
        user_a: i64,
        user_b: i64,
    ) -> Result<(Thread, bool), CoreError> {
        if user_a == user_b {
            return Err(CoreError::BadRequest(
                "Cannot start a chat with yourself".into(),
            ));
        }

        let (row, created) = match parley_db::threads::find_thread_between(&self.pool, user_a, user_b)
            .await?
        {
            Some(row) => (row, false),
            None => {
                let id = snowflake::generate(self.worker_id);
                parley_db::threads::create_thread(&self.pool, id, user_a, user_b).await?
            }
        };
        if created {
            tracing::debug!(thread_id = row.id, user_a, user_b, "thread created");
        }

        let thread = self.load_thread(row).await?;
        Ok((thread, created))
    }

    pub async fn get_thread(&self, thread_id: i64) -> Result<Thread, CoreError> {
        let row = self.thread_row(thread_id).await?;
        self.load_thread(row).await
    }

    pub async fn list_threads(&self, user_id: i64) -> Result<Vec<ThreadSummary>, CoreError> {
        let rows = parley_db::threads::list_user_threads(&self.pool, user_id).await?;
        Ok(rows
            .into_iter()
            .map(|entry| ThreadSummary {
                id: entry.thread.id,
                counterpart_id: counterpart(&entry.thread, user_id),
                last_message: last_message_of(&entry.thread),
                unread_count: entry.unread_count,
                created_at: entry.thread.created_at,
                updated_at: entry.thread.updated_at,
            })
            .collect())
    }

    pub async fn is_participant(&self, thread_id: i64, user_id: i64) -> Result<bool, CoreError> {
        Ok(parley_db::threads::is_participant(&self.pool, thread_id, user_id).await?)
    }

    pub async fn append_message(
        &self,
        thread_id: i64,
        sender_id: i64,
        content: &MessageContent,
    ) -> Result<Message, CoreError> {
        self.append_message_with(thread_id, sender_id, content, |_, _| {})
            .await
    }

    /// Append and run `on_append` before the thread lock is released, so
    /// anything it publishes is observed in log order.
    pub async fn append_message_with<F>(
        &self,
        thread_id: i64,
        sender_id: i64,
        content: &MessageContent,
        on_append: F,
    ) -> Result<Message, CoreError>
    where
        F: FnOnce(&Message, [i64; 2]),
    {
        validate_content(content)?;
        let thread = self.thread_row(thread_id).await?;
        if !thread.has_participant(sender_id) {
            return Err(CoreError::Forbidden);
        }

        let guard = self.lock(thread_id).await;
        let message = self.append_locked(&guard, sender_id, content, None).await?;
        on_append(&message, thread.participants());
        Ok(message)
    }

    async fn append_locked(
        &self,
        guard: &ThreadGuard,
        sender_id: i64,
        content: &MessageContent,
        forwarded_from: Option<i64>,
    ) -> Result<Message, CoreError> {
        let text = validation::non_blank(content.text.as_deref());
        let message_type = content.resolved_type();
        let preview = preview_text(text, message_type);
        let new = NewMessage {
            id: snowflake::generate(self.worker_id),
            thread_id: guard.thread_id(),
            sender_id,
            content: text,
            message_type: message_type.as_str(),
            media_url: content.media.as_ref().map(|m| m.url.as_str()),
            media_filename: content.media.as_ref().and_then(|m| m.filename.as_deref()),
            forwarded_from,
            preview: &preview,
            created_at: chrono::Utc::now(),
        };
        let row = parley_db::messages::append_message(&self.pool, &new).await?;
        Ok(message_from_row(row, Vec::new()))
    }

    /// One page of history for `requester_id`, oldest first within the page.
    /// Page 1 holds the newest messages. Clears the requester's unread count.
    pub async fn get_messages(
        &self,
        thread_id: i64,
        requester_id: i64,
        params: PageParams,
    ) -> Result<MessagePage, CoreError> {
        if params.page == Some(0) {
            return Err(CoreError::BadRequest("page must be at least 1".into()));
        }
        let thread = self.thread_row(thread_id).await?;
        if !thread.has_participant(requester_id) {
            return Err(CoreError::Forbidden);
        }

        let limit = i64::from(params.limit());
        let offset = params.offset() as i64;

        let _guard = self.lock(thread_id).await;
        let total =
            parley_db::messages::count_visible_messages(&self.pool, thread_id, requester_id)
                .await?;
        let mut rows = parley_db::messages::page_visible_messages(
            &self.pool,
            thread_id,
            requester_id,
            limit,
            offset,
        )
        .await?;
        parley_db::threads::reset_unread(&self.pool, thread_id, requester_id).await?;

        rows.reverse();
        let mut hidden = self.hidden_marks(thread_id, &rows).await?;
        let has_more = offset + (rows.len() as i64) < total;
        let messages = rows
            .into_iter()
            .map(|row| {
                let deleted_for = hidden.remove(&row.id).unwrap_or_default();
                message_from_row(row, deleted_for)
            })
            .collect();

        Ok(MessagePage { messages, has_more })
    }

    /// Raise a message's status on behalf of its recipient. Returns false
    /// when the stored status is already at or past `status`.
    pub async fn set_message_status(
        &self,
        thread_id: i64,
        message_id: i64,
        reader_id: i64,
        status: MessageStatus,
    ) -> Result<bool, CoreError> {
        let thread = self.thread_row(thread_id).await?;
        if !thread.has_participant(reader_id) {
            return Err(CoreError::Forbidden);
        }
        let message = self.message_row(thread_id, message_id).await?;
        if message.sender_id == reader_id {
            return Err(CoreError::Forbidden);
        }
        Ok(
            parley_db::messages::advance_status(&self.pool, thread_id, message_id, status.rank())
                .await?,
        )
    }

    pub async fn delete_message(
        &self,
        thread_id: i64,
        message_id: i64,
        requester_id: i64,
        scope: DeleteScope,
    ) -> Result<Message, CoreError> {
        let thread = self.thread_row(thread_id).await?;
        if !thread.has_participant(requester_id) {
            return Err(CoreError::Forbidden);
        }
        let existing = self.message_row(thread_id, message_id).await?;

        let row = match scope {
            DeleteScope::Me => {
                parley_db::messages::hide_for_user(&self.pool, message_id, requester_id).await?;
                existing
            }
            DeleteScope::Everyone => {
                if existing.sender_id != requester_id {
                    return Err(CoreError::Forbidden);
                }
                let _guard = self.lock(thread_id).await;
                parley_db::messages::mark_deleted(&self.pool, thread_id, message_id, TOMBSTONE_TEXT)
                    .await?
            }
        };

        let deleted_for = parley_db::messages::hidden_for_message(&self.pool, message_id).await?;
        Ok(message_from_row(row, deleted_for))
    }

    /// Flip the pinned flag and return the new value.
    pub async fn toggle_pin(
        &self,
        thread_id: i64,
        message_id: i64,
        requester_id: i64,
    ) -> Result<bool, CoreError> {
        if !self.thread_row(thread_id).await?.has_participant(requester_id) {
            return Err(CoreError::Forbidden);
        }
        parley_db::messages::toggle_pin(&self.pool, thread_id, message_id)
            .await?
            .ok_or(CoreError::NotFound)
    }

    pub async fn forward_message(
        &self,
        source_thread_id: i64,
        message_id: i64,
        target_thread_ids: &[i64],
        forwarder_id: i64,
    ) -> Result<Vec<Message>, CoreError> {
        self.forward_message_with(
            source_thread_id,
            message_id,
            target_thread_ids,
            forwarder_id,
            |_, _| {},
        )
        .await
    }

    /// Copy a message into every target thread the forwarder belongs to.
    /// Unknown targets and targets the forwarder is not part of are skipped.
    /// `on_copy` runs under each target's lock.
    pub async fn forward_message_with<F>(
        &self,
        source_thread_id: i64,
        message_id: i64,
        target_thread_ids: &[i64],
        forwarder_id: i64,
        mut on_copy: F,
    ) -> Result<Vec<Message>, CoreError>
    where
        F: FnMut(&Message, [i64; 2]),
    {
        if !self
            .thread_row(source_thread_id)
            .await?
            .has_participant(forwarder_id)
        {
            return Err(CoreError::Forbidden);
        }
        let source = self.message_row(source_thread_id, message_id).await?;
        if source.deleted {
            return Err(CoreError::BadRequest(
                "Cannot forward a deleted message".into(),
            ));
        }

        let content = MessageContent {
            text: source.content.clone(),
            message_type: MessageType::parse(&source.message_type),
            media: source.media_url.clone().map(|url| MediaRef {
                url,
                filename: source.media_filename.clone(),
            }),
        };

        let mut seen = HashSet::new();
        let mut copies = Vec::new();
        for &target_id in target_thread_ids {
            if !seen.insert(target_id) {
                continue;
            }
            let Some(target) = parley_db::threads::get_thread(&self.pool, target_id).await? else {
                tracing::debug!(target_id, "forward: skipping unknown thread");
                continue;
            };
            if !target.has_participant(forwarder_id) {
                tracing::debug!(target_id, forwarder_id, "forward: skipping foreign thread");
                continue;
            }

            let guard = self.lock(target_id).await;
            let copy = self
                .append_locked(&guard, forwarder_id, &content, Some(source_thread_id))
                .await?;
            on_copy(&copy, target.participants());
            copies.push(copy);
        }
        Ok(copies)
    }

    async fn thread_row(&self, thread_id: i64) -> Result<ThreadRow, CoreError> {
        parley_db::threads::get_thread(&self.pool, thread_id)
            .await?
            .ok_or(CoreError::NotFound)
    }

    async fn message_row(&self, thread_id: i64, message_id: i64) -> Result<MessageRow, CoreError> {
        parley_db::messages::get_message(&self.pool, thread_id, message_id)
            .await?
            .ok_or(CoreError::NotFound)
    }

    async fn load_thread(&self, row: ThreadRow) -> Result<Thread, CoreError> {
        let unread = parley_db::threads::get_unread_counts(&self.pool, row.id).await?;
        Ok(Thread {
            id: row.id,
            participants: row.participants().to_vec(),
            last_message: last_message_of(&row),
            unread_count: unread
                .into_iter()
                .map(|(user_id, count)| UnreadCount { user_id, count })
                .collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn hidden_marks(
        &self,
        thread_id: i64,
        rows: &[MessageRow],
    ) -> Result<HashMap<i64, Vec<i64>>, CoreError> {
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Ok(HashMap::new());
        };
        let marks = parley_db::messages::hidden_marks_in_range(
            &self.pool,
            thread_id,
            first.seq.min(last.seq),
            first.seq.max(last.seq),
        )
        .await?;
        let mut by_message: HashMap<i64, Vec<i64>> = HashMap::new();
        for (message_id, user_id) in marks {
            by_message.entry(message_id).or_default().push(user_id);
        }
        Ok(by_message)
    }
}

fn validate_content(content: &MessageContent) -> Result<(), CoreError> {
    validation::validate_message_body(
        content.text.as_deref(),
        content.media.as_ref().map(|m| m.url.as_str()),
    )?;
    Ok(())
}

fn preview_text(text: Option<&str>, message_type: MessageType) -> String {
    match (text, message_type) {
        (Some(text), _) => text.to_string(),
        (None, MessageType::Image) => "Photo".to_string(),
        (None, MessageType::Video) => "Video".to_string(),
        (None, MessageType::Document) => "Document".to_string(),
        // Validation rules out a text message with no text.
        (None, MessageType::Text) => String::new(),
    }
}

fn counterpart(thread: &ThreadRow, user_id: i64) -> i64 {
    if thread.user_lo == user_id {
        thread.user_hi
    } else {
        thread.user_lo
    }
}

fn last_message_of(row: &ThreadRow) -> Option<LastMessage> {
    match (
        &row.last_message_text,
        row.last_message_sender_id,
        row.last_message_at,
    ) {
        (Some(text), Some(sender_id), Some(timestamp)) => Some(LastMessage {
            text: text.clone(),
            sender_id,
            timestamp,
        }),
        _ => None,
    }
}

pub(crate) fn message_from_row(row: MessageRow, deleted_for: Vec<i64>) -> Message {
    let media = row.media_url.map(|url| MediaRef {
        url,
        filename: row.media_filename,
    });
    Message {
        id: row.id,
        thread_id: row.thread_id,
        sender_id: row.sender_id,
        text: row.content,
        message_type: MessageType::parse(&row.message_type).unwrap_or_default(),
        media,
        status: MessageStatus::from_rank(row.status).unwrap_or_default(),
        is_pinned: row.pinned,
        is_deleted: row.deleted,
        deleted_for,
        forwarded_from: row.forwarded_from,
        created_at: row.created_at,
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> ThreadStore {
    let pool = parley_db::create_pool("sqlite::memory:", 1)
        .await
        .expect("pool");
    parley_db::run_migrations(&pool).await.expect("migrations");
    ThreadStore::new(pool, 1)
}
