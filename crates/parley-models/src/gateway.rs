use serde::{Deserialize, Serialize};
use serde_json::Value;

// Client -> Server events
pub const EVENT_AUTHENTICATE: &str = "authenticate";
pub const EVENT_JOIN_CHAT: &str = "joinChat";
pub const EVENT_LEAVE_CHAT: &str = "leaveChat";
pub const EVENT_TYPING: &str = "typing";
pub const EVENT_MESSAGE_DELIVERED: &str = "messageDelivered";
pub const EVENT_MESSAGE_SEEN: &str = "messageSeen";
pub const EVENT_SEND_MESSAGE: &str = "sendMessage";
pub const EVENT_CALL_USER: &str = "callUser";
pub const EVENT_ANSWER_CALL: &str = "answerCall";
pub const EVENT_REJECT_CALL: &str = "rejectCall";
pub const EVENT_END_CALL: &str = "endCall";

// Server -> Client events
pub const EVENT_READY: &str = "ready";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_USER_ONLINE: &str = "userOnline";
pub const EVENT_USER_OFFLINE: &str = "userOffline";
pub const EVENT_NEW_MESSAGE: &str = "newMessage";
pub const EVENT_MESSAGE_SENT: &str = "messageSent";
pub const EVENT_USER_TYPING: &str = "userTyping";
pub const EVENT_MESSAGE_STATUS_UPDATE: &str = "messageStatusUpdate";
pub const EVENT_MESSAGE_DELETED: &str = "messageDeleted";
pub const EVENT_MESSAGE_PINNED: &str = "messagePinned";
pub const EVENT_INCOMING_CALL: &str = "incomingCall";
pub const EVENT_CALL_ACCEPTED: &str = "callAccepted";
pub const EVENT_CALL_REJECTED: &str = "callRejected";
pub const EVENT_CALL_ENDED: &str = "callEnded";

/// Close code sent after an authentication failure (policy violation).
pub const CLOSE_AUTH_FAILED: u16 = 1008;

/// Maps a client call-signalling event to the event relayed to the room.
pub fn call_relay_event(client_event: &str) -> Option<&'static str> {
    match client_event {
        EVENT_CALL_USER => Some(EVENT_INCOMING_CALL),
        EVENT_ANSWER_CALL => Some(EVENT_CALL_ACCEPTED),
        EVENT_REJECT_CALL => Some(EVENT_CALL_REJECTED),
        EVENT_END_CALL => Some(EVENT_CALL_ENDED),
        _ => None,
    }
}

/// Every gateway frame, in both directions: `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl GatewayFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}
