//! Wire messages for the chat socket
//!
//! Every frame is one JSON object discriminated by its `type` field.
//!
//! ```text
//! Client -> Server: session_settings, audio_input, assistant_input, user_input,
//!                   pause_assistant_message, resume_assistant_message,
//!                   tool_response, tool_error
//! Server -> Client: chat_metadata, audio_output, user_interruption, error,
//!                   user_message, assistant_message, assistant_prosody,
//!                   assistant_end, tool_call, tool_response, tool_error
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::audio::format::{AudioFormat, SoundClip};
use crate::constants::WIRE_ENCODING;
use crate::error::{AudioError, ChannelError};

// Client -> Server

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SessionSettings(SessionSettings),
    AudioInput(AudioInput),
    /// Text the assistant should speak
    AssistantInput(TextInput),
    /// Text sent as if the user had said it
    UserInput(TextInput),
    PauseAssistantMessage,
    ResumeAssistantMessage,
    ToolResponse(ToolResponse),
    ToolError(ToolError),
}

impl ClientMessage {
    /// Wire tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SessionSettings(_) => "session_settings",
            ClientMessage::AudioInput(_) => "audio_input",
            ClientMessage::AssistantInput(_) => "assistant_input",
            ClientMessage::UserInput(_) => "user_input",
            ClientMessage::PauseAssistantMessage => "pause_assistant_message",
            ClientMessage::ResumeAssistantMessage => "resume_assistant_message",
            ClientMessage::ToolResponse(_) => "tool_response",
            ClientMessage::ToolError(_) => "tool_error",
        }
    }

    pub fn to_json(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Encoding(e.to_string()))
    }

    /// One microphone chunk, tagged with the session's custom id when it has one
    pub fn audio(pcm: &[u8], custom_session_id: Option<&str>) -> Self {
        ClientMessage::AudioInput(AudioInput {
            custom_session_id: custom_session_id.map(str::to_string),
            ..AudioInput::from_pcm(pcm)
        })
    }

    pub fn assistant_input(text: impl Into<String>) -> Self {
        ClientMessage::AssistantInput(TextInput { text: text.into() })
    }

    pub fn user_input(text: impl Into<String>) -> Self {
        ClientMessage::UserInput(TextInput { text: text.into() })
    }
}

/// Session configuration sent right after the socket opens, and optionally
/// again mid-session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    /// Values substituted into the prompt's `{{placeholders}}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_model_api_key: Option<String>,
}

impl SessionSettings {
    pub fn with_audio(mut self, audio: AudioSettings) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }
}

/// Declared format of the `audio_input` stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub encoding: String,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioSettings {
    pub fn linear16(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: WIRE_ENCODING.to_string(),
            channels,
            sample_rate,
        }
    }

    /// Whether microphone chunks in `format` match this declaration
    pub fn matches(&self, format: &AudioFormat) -> bool {
        self.encoding == WIRE_ENCODING
            && self.channels == format.channels
            && self.sample_rate == format.sample_rate
            && format.bits_per_sample == 16
            && !format.is_float()
    }
}

impl From<AudioFormat> for AudioSettings {
    fn from(format: AudioFormat) -> Self {
        Self::linear16(format.sample_rate, format.channels)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Builtin,
    Function,
}

/// Tool the assistant may call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: ToolKind,
    pub name: String,
    /// JSON schema of the arguments, as a string
    pub parameters: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioInput {
    /// Base64 encoded PCM
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_session_id: Option<String>,
}

impl AudioInput {
    pub fn from_pcm(pcm: &[u8]) -> Self {
        Self {
            data: BASE64.encode(pcm),
            custom_session_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextInput {
    pub text: String,
}

/// Result of a tool call, sent by the client or echoed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub tool_call_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub tool_call_id: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_session_id: Option<String>,
}

// Server -> Client

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ChatMetadata(ChatMetadata),
    AudioOutput(AudioOutput),
    UserInterruption(UserInterruption),
    Error(WebSocketError),
    UserMessage(UserMessage),
    AssistantMessage(AssistantMessage),
    AssistantProsody(AssistantProsody),
    AssistantEnd(AssistantEnd),
    ToolCall(ToolCall),
    ToolResponse(ToolResponse),
    ToolError(ToolError),
}

impl ServerMessage {
    const TAGS: &'static [&'static str] = &[
        "chat_metadata",
        "audio_output",
        "user_interruption",
        "error",
        "user_message",
        "assistant_message",
        "assistant_prosody",
        "assistant_end",
        "tool_call",
        "tool_response",
        "tool_error",
    ];

    /// Decode one text frame. A tag we do not know is reported as
    /// `UnknownMessage` rather than a decoding failure.
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ChannelError::Decoding(e.to_string()))?;

        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ChannelError::Decoding("message has no type tag".to_string()))?;
        if !Self::TAGS.contains(&tag) {
            return Err(ChannelError::UnknownMessage(tag.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ChannelError::Decoding(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ChatMetadata(_) => "chat_metadata",
            ServerMessage::AudioOutput(_) => "audio_output",
            ServerMessage::UserInterruption(_) => "user_interruption",
            ServerMessage::Error(_) => "error",
            ServerMessage::UserMessage(_) => "user_message",
            ServerMessage::AssistantMessage(_) => "assistant_message",
            ServerMessage::AssistantProsody(_) => "assistant_prosody",
            ServerMessage::AssistantEnd(_) => "assistant_end",
            ServerMessage::ToolCall(_) => "tool_call",
            ServerMessage::ToolResponse(_) => "tool_response",
            ServerMessage::ToolError(_) => "tool_error",
        }
    }
}

/// First message on a new connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatMetadata {
    pub chat_id: String,
    pub chat_group_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AudioOutput {
    pub id: String,
    #[serde(default)]
    pub index: Option<u32>,
    /// Base64 WAV or headerless PCM
    pub data: String,
    #[serde(default)]
    pub custom_session_id: Option<String>,
}

impl AudioOutput {
    pub fn to_clip(&self) -> Result<SoundClip, AudioError> {
        SoundClip::from_base64(self.id.clone(), self.index, &self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserInterruption {
    #[serde(default)]
    pub time: Option<u64>,
    #[serde(default)]
    pub custom_session_id: Option<String>,
}

/// Server-side error report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketError {
    pub code: String,
    pub slug: String,
    pub message: String,
    #[serde(default)]
    pub custom_session_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl WebSocketError {
    pub fn known(&self) -> Option<KnownServerError> {
        KnownServerError::from_code(&self.code)
    }

    /// Message suitable for showing to a user
    pub fn display_message(&self) -> &str {
        match self.known() {
            Some(known) => known.message(),
            None => &self.message,
        }
    }
}

/// Server error codes with a fixed user-facing meaning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownServerError {
    ChatGroupNotFound,
    ChatResumeFailed,
}

impl KnownServerError {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "E0708" => Some(KnownServerError::ChatGroupNotFound),
            "E0710" => Some(KnownServerError::ChatResumeFailed),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            KnownServerError::ChatGroupNotFound => "E0708",
            KnownServerError::ChatResumeFailed => "E0710",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            KnownServerError::ChatGroupNotFound => {
                "Could not retrieve previous chat history. Please start a new chat"
            }
            KnownServerError::ChatResumeFailed => "Could not resume previous chat. Please start a new chat",
        }
    }
}

impl fmt::Display for KnownServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Transcript of what the user said
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserMessage {
    pub message: ChatMessage,
    #[serde(default)]
    pub interim: bool,
    #[serde(default)]
    pub from_text: bool,
    #[serde(default)]
    pub models: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub message: ChatMessage,
    #[serde(default)]
    pub from_text: bool,
    #[serde(default)]
    pub models: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantProsody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub models: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AssistantEnd {
    #[serde(default)]
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub name: String,
    /// JSON arguments, as a string
    pub parameters: String,
    #[serde(default)]
    pub response_required: bool,
    #[serde(default)]
    pub tool_type: Option<ToolKind>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_settings_wire_shape() {
        let msg = ClientMessage::SessionSettings(
            SessionSettings::default()
                .with_audio(AudioSettings::linear16(48000, 1))
                .with_system_prompt("be brief"),
        );
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "session_settings",
                "audio": {"encoding": "linear16", "channels": 1, "sample_rate": 48000},
                "system_prompt": "be brief"
            })
        );
    }

    #[test]
    fn test_unit_and_text_messages() {
        assert_eq!(
            ClientMessage::PauseAssistantMessage.to_json().unwrap(),
            r#"{"type":"pause_assistant_message"}"#
        );
        assert_eq!(
            ClientMessage::ResumeAssistantMessage.to_json().unwrap(),
            r#"{"type":"resume_assistant_message"}"#
        );
        assert_eq!(
            ClientMessage::assistant_input("hi").to_json().unwrap(),
            r#"{"type":"assistant_input","text":"hi"}"#
        );
        assert_eq!(
            ClientMessage::user_input("hello").to_json().unwrap(),
            r#"{"type":"user_input","text":"hello"}"#
        );
    }

    #[test]
    fn test_audio_input_is_base64() {
        let json = ClientMessage::audio(&[1, 2, 3, 4], None).to_json().unwrap();
        assert_eq!(json, r#"{"type":"audio_input","data":"AQIDBA=="}"#);

        let json = ClientMessage::audio(&[1, 2, 3, 4], Some("s-1")).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"audio_input","data":"AQIDBA==","custom_session_id":"s-1"}"#
        );
    }

    #[test]
    fn test_parse_chat_metadata() {
        let msg = ServerMessage::parse(
            r#"{"type":"chat_metadata","chat_id":"c1","chat_group_id":"g1","request_id":"r"}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::ChatMetadata(meta) => {
                assert_eq!(meta.chat_id, "c1");
                assert_eq!(meta.chat_group_id, "g1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_audio_output_to_clip() {
        let data = BASE64.encode([0u8, 1, 2, 3]);
        let text = format!(r#"{{"type":"audio_output","id":"a","index":3,"data":"{}"}}"#, data);
        let ServerMessage::AudioOutput(output) = ServerMessage::parse(&text).unwrap() else {
            panic!("expected audio_output");
        };
        let clip = output.to_clip().unwrap();
        assert_eq!(clip.index, Some(3));
        assert!(clip.header.is_none());
        assert_eq!(clip.headerless_data().len(), 4);
    }

    #[test]
    fn test_unknown_tag_is_not_dropped() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"brand_new_event"}"#),
            Err(ChannelError::UnknownMessage("brand_new_event".to_string()))
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(ServerMessage::parse("not json"), Err(ChannelError::Decoding(_))));
        assert!(matches!(ServerMessage::parse(r#"{"chat_id":"c"}"#), Err(ChannelError::Decoding(_))));
        // known tag, missing required field
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"chat_metadata","chat_id":"c"}"#),
            Err(ChannelError::Decoding(_))
        ));
    }

    #[test]
    fn test_known_server_errors() {
        let text = r#"{"type":"error","code":"E0710","slug":"resume_failed","message":"raw"}"#;
        let ServerMessage::Error(error) = ServerMessage::parse(text).unwrap() else {
            panic!("expected error");
        };
        assert_eq!(error.known(), Some(KnownServerError::ChatResumeFailed));
        assert_eq!(
            error.display_message(),
            "Could not resume previous chat. Please start a new chat"
        );

        let plain = WebSocketError {
            code: "I0100".to_string(),
            slug: "inactivity_timeout".to_string(),
            message: "idle".to_string(),
            custom_session_id: None,
            request_id: None,
        };
        assert_eq!(plain.known(), None);
        assert_eq!(plain.display_message(), "idle");
    }

    #[test]
    fn test_parse_transcripts_and_tools() {
        let user = ServerMessage::parse(
            r#"{"type":"user_message","message":{"role":"user","content":"hey"},"interim":true,"models":{}}"#,
        )
        .unwrap();
        assert!(matches!(user, ServerMessage::UserMessage(ref m) if m.interim));

        let call = ServerMessage::parse(
            r#"{"type":"tool_call","tool_call_id":"t1","name":"weather","parameters":"{}","response_required":true}"#,
        )
        .unwrap();
        assert_eq!(call.kind(), "tool_call");

        let end = ServerMessage::parse(r#"{"type":"assistant_end"}"#).unwrap();
        assert_eq!(end, ServerMessage::AssistantEnd(AssistantEnd { custom_session_id: None }));
    }

    #[test]
    fn test_audio_settings_matches_format() {
        let settings = AudioSettings::linear16(48000, 1);
        assert!(settings.matches(&AudioFormat::pcm_i16(48000, 1)));
        assert!(!settings.matches(&AudioFormat::pcm_i16(24000, 1)));
        assert!(!settings.matches(&AudioFormat::float32(48000, 1)));
    }
}
