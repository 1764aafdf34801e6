//! Connection controller
//!
//! ```text
//! disconnected ─connect─▶ connecting ─metadata + hub running─▶ connected
//!      ▲                      │                                   │
//!      └──── disconnecting ◀──┴──────────── disconnect ───────────┘
//! ```
//!
//! Three tasks run per connection: inbound message handling, microphone
//! forwarding and (once per controller) the hub event relay. Tasks hold weak
//! references, so dropping the last controller handle ends them.

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::capture::MicrophoneChunk;
use crate::audio::hub::{AudioHub, AudioHubState, HubEvent};
use crate::audio::route::AudioProfile;
use crate::constants::INACTIVITY_TIMEOUT_SLUG;
use crate::error::{AudioError, SessionError};
use crate::network::channel::{inbound, ChannelConnector, MessageChannel, SessionParams};
use crate::network::messages::{
    AudioSettings, ChatMetadata, ClientMessage, ServerMessage, SessionSettings, ToolError, ToolResponse,
};
use crate::session::events::{SessionEvent, SessionInfo, SessionState};
use crate::state::StateCell;

type MetadataSender = oneshot::Sender<Result<ChatMetadata, SessionError>>;

struct ActiveSession {
    channel: Arc<dyn MessageChannel>,
    inbound: JoinHandle<()>,
    outbound: Option<JoinHandle<()>>,
    info: Option<SessionInfo>,
}

impl ActiveSession {
    fn abort_tasks(&self) {
        self.inbound.abort();
        if let Some(outbound) = &self.outbound {
            outbound.abort();
        }
    }
}

struct ControllerInner {
    hub: AudioHub,
    connector: Arc<dyn ChannelConnector>,
    state: StateCell<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    session: Mutex<Option<ActiveSession>>,
    hub_relay: Mutex<Option<JoinHandle<()>>>,
    /// Held for a whole connect attempt, cleanup included
    connect_lock: tokio::sync::Mutex<()>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(relay) = self.hub_relay.lock().take() {
            relay.abort();
        }
        if let Some(session) = self.session.lock().take() {
            session.abort_tasks();
        }
    }
}

/// Drives one conversation at a time over a [`ChannelConnector`]. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<ControllerInner>,
}

impl ConnectionController {
    pub fn new(hub: AudioHub, connector: Arc<dyn ChannelConnector>) -> Self {
        let (events, _) = broadcast::channel(512);
        Self {
            inner: Arc::new(ControllerInner {
                hub,
                connector,
                state: StateCell::new("session", SessionState::Disconnected),
                events,
                session: Mutex::new(None),
                hub_relay: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        self.inner.state.wait_for(|s| *s == target).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn hub(&self) -> &AudioHub {
        &self.inner.hub
    }

    /// Ids of the live conversation
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.inner.session.lock().as_ref().and_then(|s| s.info.clone())
    }

    pub fn chat_id(&self) -> Option<String> {
        self.session_info().map(|info| info.chat_id)
    }

    pub fn chat_group_id(&self) -> Option<String> {
        self.session_info().map(|info| info.chat_group_id)
    }

    pub fn mute_mic(&self, mute: bool) {
        self.inner.hub.mute_mic(mute);
    }

    pub fn is_mic_muted(&self) -> bool {
        self.inner.hub.is_mic_muted()
    }

    /// Open a conversation. Resolves once the server acknowledged the session
    /// and audio is running; on failure everything is torn down again. A
    /// [`disconnect`](Self::disconnect) issued meanwhile makes it resolve with
    /// [`SessionError::Cancelled`].
    pub async fn connect(
        &self,
        params: SessionParams,
        settings: SessionSettings,
    ) -> Result<SessionInfo, SessionError> {
        let _attempt = self.inner.connect_lock.lock().await;
        if self.state() == SessionState::Disconnecting {
            tracing::info!("Waiting for previous session to finish disconnecting");
            self.inner
                .state
                .wait_for(|s| *s == SessionState::Disconnected)
                .await;
        }

        let (previous, moved) = self
            .inner
            .state
            .transition(|s| s == SessionState::Disconnected, SessionState::Connecting);
        if !moved {
            return Err(SessionError::Unknown(format!("cannot connect while {:?}", previous)));
        }
        tracing::info!("Connecting");
        self.ensure_hub_relay();

        match self.establish(params, settings).await {
            Ok(info) => Ok(info),
            Err(e) => {
                match e {
                    SessionError::Cancelled => tracing::info!("Connect cancelled"),
                    _ => tracing::error!("Connect failed: {}", e),
                }
                self.abort_connect().await;
                Err(e)
            }
        }
    }

    /// End the conversation. Only acts from connecting or connected.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (previous, moved) = self.inner.state.transition(
            |s| matches!(s, SessionState::Connected | SessionState::Connecting),
            SessionState::Disconnecting,
        );
        if !moved {
            tracing::debug!("Ignoring disconnect while {:?}", previous);
            return Ok(());
        }

        tracing::info!("Disconnecting");
        self.publish(SessionEvent::WillDisconnect);

        // nothing may call back into a half torn down session
        self.inner.hub.set_microphone_handler(None);
        let session = self.inner.session.lock().take();
        if let Some(session) = &session {
            session.abort_tasks();
        }

        let stopped = self
            .inner
            .hub
            .stop()
            .await
            .map_err(SessionError::AudioHubStopFailure);

        if let Some(session) = session {
            session.channel.close().await;
        }

        self.inner.state.set(SessionState::Disconnected);
        self.publish(SessionEvent::Disconnected);
        tracing::info!("Disconnected");
        stopped
    }

    /// Send any client message on the live connection
    pub async fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        if self.state() != SessionState::Connected {
            return Err(SessionError::SocketDisconnected);
        }
        if let ClientMessage::SessionSettings(settings) = &message {
            if let Some(audio) = &settings.audio {
                self.validate_audio(audio)?;
            }
        }

        let channel = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or(SessionError::SocketDisconnected)?;

        channel.send(&message).await.map_err(|e| {
            tracing::error!("Failed to send {}: {}", message.kind(), e);
            if e.is_closure() {
                self.disconnect_in_background();
            }
            SessionError::SocketSend(e)
        })
    }

    /// Have the assistant speak `text`
    pub async fn send_assistant_input(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(ClientMessage::assistant_input(text)).await
    }

    /// Send `text` as if the user said it
    pub async fn send_user_input(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(ClientMessage::user_input(text)).await
    }

    pub async fn pause_assistant(&self) -> Result<(), SessionError> {
        self.send(ClientMessage::PauseAssistantMessage).await
    }

    pub async fn resume_assistant(&self) -> Result<(), SessionError> {
        self.send(ClientMessage::ResumeAssistantMessage).await
    }

    pub async fn send_tool_response(&self, response: ToolResponse) -> Result<(), SessionError> {
        self.send(ClientMessage::ToolResponse(response)).await
    }

    pub async fn send_tool_error(&self, error: ToolError) -> Result<(), SessionError> {
        self.send(ClientMessage::ToolError(error)).await
    }

    /// Change prompt, tools or variables mid-session
    pub async fn update_session_settings(&self, settings: SessionSettings) -> Result<(), SessionError> {
        self.send(ClientMessage::SessionSettings(settings)).await
    }

    async fn establish(
        &self,
        params: SessionParams,
        mut settings: SessionSettings,
    ) -> Result<SessionInfo, SessionError> {
        let hub = &self.inner.hub;
        if hub.profile() != Some(AudioProfile::VoiceChat) {
            let configured = hub.configure(AudioProfile::VoiceChat).await;
            self.check_connecting()?;
            configured.map_err(|e| match e {
                AudioError::Microphone(_) => SessionError::MicrophoneInitialization(e),
                other => SessionError::AudioHubConfigurationFailure(other),
            })?;
        }

        match &settings.audio {
            Some(audio) => self.validate_audio(audio)?,
            None => {
                let audio = AudioSettings::from(hub.settings().wire_format());
                tracing::debug!("Declaring microphone format {:?}", audio);
                settings.audio = Some(audio);
            }
        }

        let (mic_tx, mic_rx) = mpsc::unbounded_channel::<MicrophoneChunk>();
        let events = self.inner.events.clone();
        hub.set_microphone_handler(Some(Arc::new(move |chunk: MicrophoneChunk| {
            let _ = events.send(SessionEvent::InputMeter(chunk.average_power));
            let _ = mic_tx.send(chunk);
        })));

        let opened = self.inner.connector.connect(&params).await;
        if let Err(cancelled) = self.check_connecting() {
            if let Ok(channel) = opened {
                channel.close().await;
            }
            return Err(cancelled);
        }
        let channel = opened.map_err(SessionError::SocketConnectionFailure)?;

        // disconnect takes the session under the same lock after leaving
        // connecting, so exactly one side sees the channel
        let (metadata_tx, metadata_rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.inner);
        let stored = {
            let mut session = self.inner.session.lock();
            if self.state() == SessionState::Connecting {
                *session = Some(ActiveSession {
                    channel: channel.clone(),
                    inbound: tokio::spawn(run_inbound(weak.clone(), channel.clone(), metadata_tx)),
                    outbound: None,
                    info: None,
                });
                true
            } else {
                false
            }
        };
        if !stored {
            channel.close().await;
            return Err(SessionError::Cancelled);
        }

        // microphone forwarding only begins once the format is declared
        let custom_session_id = settings.custom_session_id.clone();
        let sent = channel.send(&ClientMessage::SessionSettings(settings)).await;
        self.check_connecting()?;
        sent.map_err(SessionError::SocketSend)?;

        let outbound_task = tokio::spawn(forward_microphone(weak, channel, mic_rx, custom_session_id));
        match self.inner.session.lock().as_mut() {
            Some(session) => session.outbound = Some(outbound_task),
            None => {
                outbound_task.abort();
                return Err(SessionError::Cancelled);
            }
        }

        let metadata = tokio::select! {
            biased;
            _ = self.inner.state.wait_for(|s| *s != SessionState::Connecting) => {
                return Err(SessionError::Cancelled);
            }
            metadata = metadata_rx => metadata.map_err(|_| SessionError::SocketDisconnected)??,
        };
        let info = SessionInfo {
            chat_id: metadata.chat_id,
            chat_group_id: metadata.chat_group_id,
            connected_at: Utc::now(),
        };
        tracing::info!("Chat {} started in group {}", info.chat_id, info.chat_group_id);

        let started = hub.start().await;
        self.check_connecting()?;
        started.map_err(SessionError::AudioHubStartFailure)?;
        if hub.state() != AudioHubState::Running {
            return Err(SessionError::AudioHubStartFailure(AudioError::NotRunning));
        }

        if let Some(session) = self.inner.session.lock().as_mut() {
            session.info = Some(info.clone());
        }
        let (_, moved) = self
            .inner
            .state
            .transition(|s| s == SessionState::Connecting, SessionState::Connected);
        if !moved {
            return Err(SessionError::Cancelled);
        }

        self.publish(SessionEvent::Connected(info.clone()));
        Ok(info)
    }

    /// A disconnect issued mid-connect wins over whatever the pending step returned
    fn check_connecting(&self) -> Result<(), SessionError> {
        if self.state() == SessionState::Connecting {
            Ok(())
        } else {
            Err(SessionError::Cancelled)
        }
    }

    /// Undo a partial connect, including anything a concurrent disconnect
    /// ran too early to see.
    async fn abort_connect(&self) {
        if let Err(e) = self.disconnect().await {
            tracing::warn!("Cleanup after failed connect: {}", e);
        }
        self.inner
            .state
            .wait_for(|s| *s == SessionState::Disconnected)
            .await;

        let leftover = self.inner.session.lock().take();
        if let Some(session) = leftover {
            session.abort_tasks();
            session.channel.close().await;
        }
        let hub = &self.inner.hub;
        hub.set_microphone_handler(None);
        if matches!(hub.state(), AudioHubState::Starting | AudioHubState::Running) {
            if let Err(e) = hub.stop().await {
                tracing::warn!("Failed to stop audio hub after failed connect: {}", e);
            }
        }
    }

    fn validate_audio(&self, audio: &AudioSettings) -> Result<(), SessionError> {
        let wire = self.inner.hub.settings().wire_format();
        if audio.matches(&wire) {
            Ok(())
        } else {
            Err(SessionError::InvalidSessionSettings(format!(
                "declared audio {} {}ch {}Hz does not match microphone format {}",
                audio.encoding, audio.channels, audio.sample_rate, wire
            )))
        }
    }

    async fn handle_message(&self, message: ServerMessage) {
        match &message {
            ServerMessage::AudioOutput(output) => {
                let result = match output.to_clip() {
                    Ok(clip) => self.inner.hub.enqueue(clip).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::warn!("Failed to play audio {}: {}", output.id, e);
                    self.publish(SessionEvent::Error(SessionError::AudioHub(e)));
                }
            }
            ServerMessage::UserInterruption(_) => {
                tracing::debug!("User interruption, clearing playback");
                self.inner.hub.handle_interruption();
            }
            ServerMessage::Error(error) => {
                if error.slug == INACTIVITY_TIMEOUT_SLUG {
                    tracing::warn!("Session ended for inactivity: {}", error.message);
                } else {
                    tracing::error!("Server error {} ({}): {}", error.code, error.slug, error.message);
                    self.publish(SessionEvent::Error(SessionError::WebSocket(error.clone())));
                }
                self.disconnect_in_background();
            }
            other => tracing::trace!("Received {}", other.kind()),
        }
        self.publish(SessionEvent::Message(message));
    }

    /// Tasks owned by the session must not await their own teardown
    fn disconnect_in_background(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.disconnect().await {
                tracing::error!("Disconnect failed: {}", e);
                controller.publish(SessionEvent::Error(e));
            }
        });
    }

    fn ensure_hub_relay(&self) {
        let mut relay = self.inner.hub_relay.lock();
        if relay.is_some() {
            return;
        }
        let mut hub_events = self.inner.hub.subscribe();
        let weak = Arc::downgrade(&self.inner);
        *relay = Some(tokio::spawn(async move {
            loop {
                let event = match hub_events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Hub relay skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let controller = ConnectionController { inner };
                match event {
                    HubEvent::OutputMeter(level) => controller.publish(SessionEvent::OutputMeter(level)),
                    HubEvent::ClipEnqueued { id, index } => {
                        controller.publish(SessionEvent::ClipEnqueued { id, index })
                    }
                    HubEvent::Route(route) => controller.publish(SessionEvent::Route(route)),
                    HubEvent::Warning(e) => controller.publish(SessionEvent::Error(SessionError::AudioHub(e))),
                    HubEvent::Reconfigured => tracing::debug!("Audio graph rebuilt"),
                }
            }
        }));
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }
}

async fn run_inbound(
    weak: Weak<ControllerInner>,
    channel: Arc<dyn MessageChannel>,
    metadata_tx: MetadataSender,
) {
    let mut metadata_tx = Some(metadata_tx);
    let mut messages = Box::pin(inbound(channel));

    while let Some(item) = messages.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let controller = ConnectionController { inner };

        match item {
            Ok(ServerMessage::ChatMetadata(metadata)) => {
                if let Some(tx) = metadata_tx.take() {
                    let _ = tx.send(Ok(metadata.clone()));
                }
                controller.publish(SessionEvent::Message(ServerMessage::ChatMetadata(metadata)));
            }
            Ok(ServerMessage::Error(error)) if metadata_tx.is_some() => {
                tracing::error!("Server rejected session: {} {}", error.code, error.display_message());
                if let Some(tx) = metadata_tx.take() {
                    let _ = tx.send(Err(SessionError::WebSocket(error)));
                }
            }
            Ok(message) => controller.handle_message(message).await,
            Err(e) if e.is_frame_error() => tracing::warn!("Skipping inbound frame: {}", e),
            Err(e) => {
                tracing::error!("Chat socket failed: {}", e);
                match metadata_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(SessionError::SocketConnectionFailure(e)));
                    }
                    None => {
                        controller.publish(SessionEvent::Error(SessionError::SocketConnectionFailure(e)));
                        controller.disconnect_in_background();
                    }
                }
                return;
            }
        }
    }

    tracing::info!("Chat socket closed by server");
    if let Some(tx) = metadata_tx.take() {
        // connect is still waiting and tears the session down itself
        let _ = tx.send(Err(SessionError::SocketDisconnected));
        return;
    }
    if let Some(inner) = weak.upgrade() {
        ConnectionController { inner }.disconnect_in_background();
    }
}

async fn forward_microphone(
    weak: Weak<ControllerInner>,
    channel: Arc<dyn MessageChannel>,
    mut chunks: mpsc::UnboundedReceiver<MicrophoneChunk>,
    custom_session_id: Option<String>,
) {
    while let Some(chunk) = chunks.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let controller = ConnectionController { inner };
        if controller.state() != SessionState::Connected {
            tracing::trace!("Not connected, dropping microphone chunk {}", chunk.sequence);
            continue;
        }

        match channel
            .send(&ClientMessage::audio(&chunk.data, custom_session_id.as_deref()))
            .await {
            Ok(()) => {}
            Err(e) if e.is_closure() => {
                // the server ended the session
                tracing::info!("Chat socket closed while sending microphone data: {}", e);
                if let Err(e) = controller.inner.hub.stop().await {
                    tracing::warn!("Failed to stop audio hub: {}", e);
                }
                controller.disconnect_in_background();
                return;
            }
            Err(e) => {
                tracing::error!("Failed to send microphone data: {}", e);
                controller.publish(SessionEvent::Error(SessionError::SocketSend(e)));
                controller.disconnect_in_background();
                return;
            }
        }
    }
}
