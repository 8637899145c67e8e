use crate::auth::Identity;
use crate::error::CoreError;
use crate::rooms::{ConnectionId, RoomHub, RoomId, ServerEvent};
use crate::thread_store::ThreadStore;
use parley_models::gateway::{
    EVENT_MESSAGE_DELETED, EVENT_MESSAGE_PINNED, EVENT_MESSAGE_STATUS_UPDATE, EVENT_NEW_MESSAGE,
};
use parley_models::message::{DeleteScope, Message, MessageContent, MessageStatus};
use serde_json::json;
use std::sync::Arc;

/// Persists chat mutations and fans the result out to connected clients.
#[derive(Clone)]
pub struct MessageRouter {
    threads: ThreadStore,
    rooms: Arc<dyn RoomHub>,
}

impl MessageRouter {
    pub fn new(threads: ThreadStore, rooms: Arc<dyn RoomHub>) -> Self {
        Self { threads, rooms }
    }

    /// Append a message and notify the other participant on every one of
    /// their connections. Nobody listening is not an error.
    pub async fn send_message(
        &self,
        thread_id: i64,
        sender: &Identity,
        content: &MessageContent,
    ) -> Result<Message, CoreError> {
        let rooms = &self.rooms;
        let message = self
            .threads
            .append_message_with(thread_id, sender.user_id, content, |message, participants| {
                notify_recipients(rooms.as_ref(), message, participants, sender);
            })
            .await?;
        tracing::debug!(
            thread_id,
            message_id = message.id,
            sender_id = sender.user_id,
            "router: message sent"
        );
        Ok(message)
    }

    /// Apply a delivery receipt. The update is relayed to the thread room,
    /// minus the reporting connection, only when it changed the status.
    pub async fn update_status(
        &self,
        thread_id: i64,
        message_id: i64,
        status: MessageStatus,
        acting_user: i64,
        origin: Option<ConnectionId>,
    ) -> Result<bool, CoreError> {
        let applied = self
            .threads
            .set_message_status(thread_id, message_id, acting_user, status)
            .await?;
        if applied {
            let event = ServerEvent::new(
                EVENT_MESSAGE_STATUS_UPDATE,
                json!({
                    "messageId": message_id.to_string(),
                    "threadId": thread_id.to_string(),
                    "status": status,
                }),
            );
            self.rooms.publish(RoomId::Thread(thread_id), &event, origin);
        }
        Ok(applied)
    }

    pub async fn delete_message(
        &self,
        thread_id: i64,
        message_id: i64,
        requester: &Identity,
        scope: DeleteScope,
    ) -> Result<Message, CoreError> {
        let message = self
            .threads
            .delete_message(thread_id, message_id, requester.user_id, scope)
            .await?;
        if scope == DeleteScope::Everyone {
            let event = ServerEvent::new(
                EVENT_MESSAGE_DELETED,
                json!({
                    "threadId": thread_id.to_string(),
                    "messageId": message_id.to_string(),
                    "deleteFor": scope,
                    "message": &message,
                }),
            );
            self.rooms.publish(RoomId::Thread(thread_id), &event, None);
        }
        Ok(message)
    }

    pub async fn toggle_pin(
        &self,
        thread_id: i64,
        message_id: i64,
        requester: &Identity,
    ) -> Result<bool, CoreError> {
        let is_pinned = self
            .threads
            .toggle_pin(thread_id, message_id, requester.user_id)
            .await?;
        let event = ServerEvent::new(
            EVENT_MESSAGE_PINNED,
            json!({
                "threadId": thread_id.to_string(),
                "messageId": message_id.to_string(),
                "isPinned": is_pinned,
                "userId": requester.user_id.to_string(),
            }),
        );
        self.rooms.publish(RoomId::Thread(thread_id), &event, None);
        Ok(is_pinned)
    }

    pub async fn forward_message(
        &self,
        source_thread_id: i64,
        message_id: i64,
        target_thread_ids: &[i64],
        forwarder: &Identity,
    ) -> Result<Vec<Message>, CoreError> {
        let rooms = &self.rooms;
        let copies = self
            .threads
            .forward_message_with(
                source_thread_id,
                message_id,
                target_thread_ids,
                forwarder.user_id,
                |copy, participants| {
                    notify_recipients(rooms.as_ref(), copy, participants, forwarder);
                },
            )
            .await?;
        tracing::debug!(
            source_thread_id,
            message_id,
            copies = copies.len(),
            "router: message forwarded"
        );
        Ok(copies)
    }
}

fn notify_recipients(rooms: &dyn RoomHub, message: &Message, participants: [i64; 2], sender: &Identity) {
    let event = ServerEvent::new(
        EVENT_NEW_MESSAGE,
        json!({
            "threadId": message.thread_id.to_string(),
            "message": message,
            "sender": {
                "userId": sender.user_id.to_string(),
                "username": &sender.username,
            },
        }),
    );
    for user_id in participants.into_iter().filter(|&p| p != sender.user_id) {
        rooms.publish(RoomId::User(user_id), &event, None);
    }
}
