//! Conversation session: ties the audio hub to the chat channel

mod controller;
mod events;

pub use controller::ConnectionController;
pub use events::{SessionEvent, SessionInfo, SessionState};
