//! Session state and observer events

use chrono::{DateTime, Utc};

use crate::audio::route::RouteEvent;
use crate::error::SessionError;
use crate::network::messages::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Identity of a live conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub chat_id: String,
    /// Pass back as `resumed_chat_group_id` to continue the conversation later
    pub chat_group_id: String,
    pub connected_at: DateTime<Utc>,
}

/// One-shot notifications from the controller
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected(SessionInfo),
    /// Teardown is about to begin
    WillDisconnect,
    Disconnected,
    /// Soft errors leave the session running; hard errors are followed by a disconnect
    Error(SessionError),
    /// Every inbound message, after the controller has acted on it
    Message(ServerMessage),
    ClipEnqueued { id: String, index: Option<u32> },
    /// Average microphone power in dBFS
    InputMeter(f32),
    /// Peak playback level in dBFS
    OutputMeter(f32),
    Route(RouteEvent),
}
