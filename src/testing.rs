//! In-memory stand-ins for the hardware and the socket, used by unit tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::engine::{AudioEngine, InputSink, RenderSource};
use crate::audio::format::{AudioFormat, SoundClip};
use crate::audio::route::{
    AudioPlatform, AudioPort, CategoryOptions, MicrophoneMode, NotificationHandler, OutputOverride,
    PlatformNotification, PortType, SessionCategory, SessionMode,
};
use crate::error::{AudioError, ChannelError, RouteError};
use crate::network::channel::{ChannelConnector, MessageChannel, SessionParams};
use crate::network::messages::{ChatMetadata, ClientMessage, ServerMessage};

/// 16-bit mono WAV clip built with hound
pub(crate) fn wav_clip(id: &str, sample_rate: u32, samples: &[i16]) -> SoundClip {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    SoundClip::new(id, None, Bytes::from(cursor.into_inner()))
}

// Engine

struct EngineState {
    input_format: AudioFormat,
    fail_input_format: bool,
    fail_voice_processing: bool,
    fail_start: bool,
    start_delay: Duration,
    stream_errors: Vec<AudioError>,
    input: Option<InputSink>,
    output: Option<(AudioFormat, RenderSource)>,
    input_connections: usize,
    output_connections: usize,
    start_calls: usize,
    stop_calls: usize,
}

/// Signal graph that records connections and lets tests drive the callbacks
pub(crate) struct FakeEngine {
    state: Mutex<EngineState>,
    running: AtomicBool,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(EngineState {
                input_format: AudioFormat::float32(48000, 1),
                fail_input_format: false,
                fail_voice_processing: false,
                fail_start: false,
                start_delay: Duration::ZERO,
                stream_errors: Vec::new(),
                input: None,
                output: None,
                input_connections: 0,
                output_connections: 0,
                start_calls: 0,
                stop_calls: 0,
            }),
            running: AtomicBool::new(false),
        }
    }
}

impl FakeEngine {
    pub fn fail_input_format(&self, fail: bool) {
        self.state.lock().fail_input_format = fail;
    }

    pub fn fail_voice_processing(&self, fail: bool) {
        self.state.lock().fail_voice_processing = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.state.lock().start_delay = delay;
    }

    /// Report a failure the way a dying hardware stream would
    pub fn inject_stream_error(&self, error: AudioError) {
        self.state.lock().stream_errors.push(error);
    }

    pub fn set_input_format(&self, format: AudioFormat) {
        self.state.lock().input_format = format;
    }

    pub fn input_connections(&self) -> usize {
        self.state.lock().input_connections
    }

    pub fn output_connections(&self) -> usize {
        self.state.lock().output_connections
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }

    pub fn connected_output(&self) -> Option<AudioFormat> {
        self.state.lock().output.as_ref().map(|(format, _)| *format)
    }

    pub fn has_output(&self) -> bool {
        self.state.lock().output.is_some()
    }

    /// Run the render callback once, as the hardware would
    pub fn render(&self, out: &mut [i16]) {
        let source = self.state.lock().output.as_ref().map(|(_, source)| source.clone());
        match source {
            Some(source) => source(out),
            None => out.fill(0),
        }
    }

    /// Deliver a hardware input buffer
    pub fn push_input(&self, samples: &[f32]) {
        let sink = self.state.lock().input.clone();
        if let Some(sink) = sink {
            sink(samples);
        }
    }
}

impl AudioEngine for FakeEngine {
    fn input_format(&self) -> Result<AudioFormat, AudioError> {
        let state = self.state.lock();
        if state.fail_input_format {
            return Err(AudioError::Engine("no input device".to_string()));
        }
        Ok(state.input_format)
    }

    fn output_format(&self) -> Result<AudioFormat, AudioError> {
        Ok(AudioFormat::float32(48000, 2))
    }

    fn enable_voice_processing(&self) -> Result<(), AudioError> {
        if self.state.lock().fail_voice_processing {
            return Err(AudioError::Engine("voice processing unavailable".to_string()));
        }
        Ok(())
    }

    fn connect_input(&self, sink: InputSink) {
        let mut state = self.state.lock();
        state.input = Some(sink);
        state.input_connections += 1;
    }

    fn disconnect_input(&self) {
        self.state.lock().input = None;
    }

    fn connect_output(&self, format: AudioFormat, source: RenderSource) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        state.output = Some((format, source));
        state.output_connections += 1;
        Ok(())
    }

    fn disconnect_output(&self) {
        self.state.lock().output = None;
    }

    fn start(&self) -> Result<(), AudioError> {
        let (delay, fail) = {
            let mut state = self.state.lock();
            state.start_calls += 1;
            (state.start_delay, state.fail_start)
        };
        std::thread::sleep(delay);
        if fail {
            return Err(AudioError::Engine("device busy".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().stop_calls += 1;
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn take_error(&self) -> Option<AudioError> {
        let mut state = self.state.lock();
        if state.stream_errors.is_empty() {
            None
        } else {
            Some(state.stream_errors.remove(0))
        }
    }
}

// Platform

struct PlatformState {
    categories: Vec<SessionCategory>,
    inputs: Vec<AudioPort>,
    outputs: Vec<AudioPort>,
    active: bool,
    overrides: Vec<OutputOverride>,
    preferred_input: Option<String>,
    category_calls: usize,
    handler: Option<NotificationHandler>,
    observer_count: usize,
}

/// Audio session with one built-in mic and the built-in speaker
pub(crate) struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            state: Mutex::new(PlatformState {
                categories: vec![SessionCategory::PlayAndRecord, SessionCategory::Playback],
                inputs: vec![AudioPort::new("Built-in Mic", PortType::BuiltInMic)],
                outputs: vec![AudioPort::new("Speaker", PortType::BuiltInSpeaker)],
                active: false,
                overrides: Vec::new(),
                preferred_input: None,
                category_calls: 0,
                handler: None,
                observer_count: 0,
            }),
        }
    }
}

impl FakePlatform {
    pub fn set_categories(&self, categories: Vec<SessionCategory>) {
        self.state.lock().categories = categories;
    }

    pub fn set_inputs(&self, inputs: Vec<AudioPort>) {
        self.state.lock().inputs = inputs;
    }

    pub fn set_outputs(&self, outputs: Vec<AudioPort>) {
        self.state.lock().outputs = outputs;
    }

    pub fn category_calls(&self) -> usize {
        self.state.lock().category_calls
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observer_count
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn last_override(&self) -> Option<OutputOverride> {
        self.state.lock().overrides.last().copied()
    }

    pub fn override_calls(&self) -> usize {
        self.state.lock().overrides.len()
    }

    pub fn preferred_input(&self) -> Option<String> {
        self.state.lock().preferred_input.clone()
    }

    /// Deliver a notification synchronously on the calling thread
    pub fn notify(&self, notification: PlatformNotification) {
        let handler = self.state.lock().handler.clone();
        if let Some(handler) = handler {
            handler(notification);
        }
    }
}

impl AudioPlatform for FakePlatform {
    fn available_categories(&self) -> Vec<SessionCategory> {
        self.state.lock().categories.clone()
    }

    fn set_category(
        &self,
        _category: SessionCategory,
        _mode: SessionMode,
        _options: CategoryOptions,
    ) -> Result<(), RouteError> {
        self.state.lock().category_calls += 1;
        Ok(())
    }

    fn set_preferred_sample_rate(&self, _sample_rate: u32) -> Result<(), RouteError> {
        Ok(())
    }

    fn set_preferred_io_buffer_duration(&self, _duration: Duration) -> Result<(), RouteError> {
        Ok(())
    }

    fn set_active(&self, active: bool) -> Result<(), RouteError> {
        self.state.lock().active = active;
        Ok(())
    }

    fn available_inputs(&self) -> Vec<AudioPort> {
        self.state.lock().inputs.clone()
    }

    fn current_outputs(&self) -> Vec<AudioPort> {
        self.state.lock().outputs.clone()
    }

    fn set_preferred_input(&self, port: &AudioPort) -> Result<(), RouteError> {
        self.state.lock().preferred_input = Some(port.name.clone());
        Ok(())
    }

    fn override_output(&self, port: OutputOverride) -> Result<(), RouteError> {
        self.state.lock().overrides.push(port);
        Ok(())
    }

    fn microphone_mode(&self) -> MicrophoneMode {
        MicrophoneMode::default()
    }

    fn observe(&self, handler: NotificationHandler) {
        let mut state = self.state.lock();
        state.handler = Some(handler);
        state.observer_count += 1;
    }
}

// Channel

type Inbound = Result<ServerMessage, ChannelError>;

struct ChannelState {
    sent: Mutex<Vec<ClientMessage>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    /// Fail sends of this message kind with this error
    send_failure: Mutex<Option<(&'static str, ChannelError)>>,
    metadata: Option<ChatMetadata>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

/// Scripted server side of a [`FakeChannel`]
#[derive(Clone)]
pub(crate) struct FakeServer {
    state: Arc<ChannelState>,
}

impl FakeServer {
    pub fn push(&self, message: ServerMessage) {
        self.push_result(Ok(message));
    }

    pub fn push_result(&self, item: Inbound) {
        if let Some(tx) = self.state.inbound_tx.lock().as_ref() {
            let _ = tx.send(item);
        }
    }

    /// Server-initiated close: pending messages drain, then `Closed`
    pub fn hang_up(&self) {
        self.state.inbound_tx.lock().take();
    }

    pub fn fail_sends(&self, kind: &'static str, error: ChannelError) {
        *self.state.send_failure.lock() = Some((kind, error));
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.state.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.state.sent.lock().iter().map(|m| m.kind()).collect()
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeChannel {
    state: Arc<ChannelState>,
}

impl FakeChannel {
    fn new(metadata: Option<ChatMetadata>) -> (Self, FakeServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ChannelState {
            sent: Mutex::new(Vec::new()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            send_failure: Mutex::new(None),
            metadata,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        });
        (Self { state: state.clone() }, FakeServer { state })
    }
}

#[async_trait]
impl MessageChannel for FakeChannel {
    async fn send(&self, message: &ClientMessage) -> Result<(), ChannelError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if let Some((kind, error)) = self.state.send_failure.lock().clone() {
            if kind == message.kind() {
                return Err(error);
            }
        }
        self.state.sent.lock().push(message.clone());

        // answer the first session settings the way the server does
        if let ClientMessage::SessionSettings(_) = message {
            let first = self
                .state
                .sent
                .lock()
                .iter()
                .filter(|m| matches!(m, ClientMessage::SessionSettings(_)))
                .count()
                == 1;
            if let (true, Some(meta)) = (first, self.state.metadata.clone()) {
                FakeServer {
                    state: self.state.clone(),
                }
                .push(ServerMessage::ChatMetadata(meta));
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<ServerMessage, ChannelError> {
        let mut rx = self.state.inbound_rx.lock().await;
        rx.recv().await.unwrap_or(Err(ChannelError::Closed))
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.inbound_tx.lock().take();
    }
}

/// Hands out [`FakeChannel`]s and keeps their server handles
pub(crate) struct FakeConnector {
    metadata: Option<ChatMetadata>,
    connect_error: Mutex<Option<ChannelError>>,
    connect_delay: Mutex<Duration>,
    servers: Mutex<Vec<FakeServer>>,
    params: Mutex<Vec<SessionParams>>,
}

impl FakeConnector {
    /// Server that acknowledges session settings with this metadata
    pub fn new(chat_id: &str, chat_group_id: &str) -> Self {
        Self::with_metadata(Some(ChatMetadata {
            chat_id: chat_id.to_string(),
            chat_group_id: chat_group_id.to_string(),
            request_id: None,
            custom_session_id: None,
        }))
    }

    /// Server that never acknowledges unless the test pushes metadata itself
    pub fn silent() -> Self {
        Self::with_metadata(None)
    }

    fn with_metadata(metadata: Option<ChatMetadata>) -> Self {
        Self {
            metadata,
            connect_error: Mutex::new(None),
            connect_delay: Mutex::new(Duration::ZERO),
            servers: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_connect(&self, error: ChannelError) {
        *self.connect_error.lock() = Some(error);
    }

    /// Hold every connect for `delay` before the socket opens
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Server side of the most recent connection
    pub fn server(&self) -> Option<FakeServer> {
        self.servers.lock().last().cloned()
    }

    pub fn connections(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn last_params(&self) -> Option<SessionParams> {
        self.params.lock().last().cloned()
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self, params: &SessionParams) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        self.params.lock().push(params.clone());
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.connect_error.lock().clone() {
            return Err(error);
        }
        let (channel, server) = FakeChannel::new(self.metadata.clone());
        self.servers.lock().push(server);
        Ok(Arc::new(channel))
    }
}
