//! Network subsystem: wire messages and the duplex chat channel

pub mod auth;
pub mod channel;
pub mod messages;

pub use auth::{Credentials, StaticToken, TokenProvider};
pub use channel::{inbound, ChannelConnector, MessageChannel, SessionParams, WebSocketChannel, WebSocketConnector};
pub use messages::{AudioSettings, ClientMessage, ServerMessage, SessionSettings, WebSocketError};
