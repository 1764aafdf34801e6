//! Audio device enumeration and the desktop platform session
//!
//! Desktop hosts have no audio session object, so [`CpalPlatform`] models one
//! on top of cpal: it lists ports, remembers the preferred input, and runs a
//! [`DeviceWatcher`] that polls the device list to synthesize route-change and
//! configuration-change notifications.

use cpal::traits::{DeviceTrait, HostTrait};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::route::{
    AudioPlatform, AudioPort, CategoryOptions, MicrophoneMode, NotificationHandler, OutputOverride,
    PlatformNotification, PortType, RouteChangeReason, SessionCategory, SessionMode,
};
use crate::error::RouteError;

/// Name of the preferred input device, shared between platform and engine
pub type DeviceSelection = Arc<RwLock<Option<String>>>;

/// Device description for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);

                // Duplex devices are listed once
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }

                let (sample_rates, channels) = get_device_capabilities(&device, false);
                devices.push(AudioDeviceInfo {
                    id: format!("output:{}", name),
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

fn get_device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    };

    let mut sample_rates = BTreeSet::new();
    let mut channels = BTreeSet::new();
    for config in &configs {
        for rate_val in [16000u32, 24000, 44100, 48000, 96000] {
            let rate = cpal::SampleRate(rate_val);
            if rate >= config.min_sample_rate() && rate <= config.max_sample_rate() {
                sample_rates.insert(rate_val);
            }
        }
        channels.insert(config.channels());
    }

    (sample_rates.into_iter().collect(), channels.into_iter().collect())
}

/// Find an input device by name, falling back to the host default
pub fn find_input_device(name: Option<&str>) -> Option<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        if let Ok(mut devices) = host.input_devices() {
            if let Some(device) = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false)) {
                return Some(device);
            }
        }
        tracing::warn!("Preferred input '{}' not found, using default", name);
    }
    host.default_input_device()
}

/// Guess a port type from a device name
pub fn classify_port(name: &str, is_input: bool) -> PortType {
    let lower = name.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["bluetooth", "airpods", "bt-", "a2dp", "hands-free", "handsfree"]) {
        PortType::Bluetooth
    } else if has(&["usb"]) {
        PortType::Usb
    } else if has(&["hdmi", "displayport"]) {
        PortType::Hdmi
    } else if has(&["headphone", "headset", "earphone"]) {
        PortType::Headphones
    } else if has(&["line in", "line-in"]) {
        PortType::LineIn
    } else if has(&["line out", "line-out"]) {
        PortType::LineOut
    } else if is_input {
        PortType::BuiltInMic
    } else {
        PortType::BuiltInSpeaker
    }
}

/// What the watcher compares between polls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
}

impl DeviceSnapshot {
    pub fn capture() -> Self {
        let host = cpal::default_host();
        let inputs = host
            .input_devices()
            .map(|d| d.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default();
        let outputs = host
            .output_devices()
            .map(|d| d.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default();
        Self {
            inputs,
            outputs,
            default_input: host.default_input_device().and_then(|d| d.name().ok()),
            default_output: host.default_output_device().and_then(|d| d.name().ok()),
        }
    }

    /// Notifications implied by moving from `self` to `next`
    pub fn diff(&self, next: &DeviceSnapshot) -> Vec<PlatformNotification> {
        let mut notifications = Vec::new();

        let added = next.inputs.difference(&self.inputs).next().is_some()
            || next.outputs.difference(&self.outputs).next().is_some();
        let removed = self.inputs.difference(&next.inputs).next().is_some()
            || self.outputs.difference(&next.outputs).next().is_some();

        if removed {
            notifications.push(PlatformNotification::RouteChange(RouteChangeReason::OldDeviceUnavailable));
        } else if added {
            notifications.push(PlatformNotification::RouteChange(RouteChangeReason::NewDeviceAvailable));
        }

        if self.default_output != next.default_output || self.default_input != next.default_input {
            if !added && !removed {
                notifications.push(PlatformNotification::RouteChange(
                    RouteChangeReason::RouteConfigurationChange,
                ));
            }
            notifications.push(PlatformNotification::ConfigurationChange);
        }

        notifications
    }
}

/// Background thread polling the device list
pub struct DeviceWatcher {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    /// Poll with `probe` every `interval` and hand differences to `handler`
    pub fn spawn<P>(interval: Duration, probe: P, handler: NotificationHandler) -> std::io::Result<Self>
    where
        P: Fn() -> DeviceSnapshot + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("device-watcher".to_string())
            .spawn(move || {
                let mut previous = probe();
                let mut last_poll = Instant::now();
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                    if last_poll.elapsed() < interval {
                        continue;
                    }
                    last_poll = Instant::now();

                    let next = probe();
                    for notification in previous.diff(&next) {
                        tracing::debug!("Device change: {:?}", notification);
                        handler(notification);
                    }
                    previous = next;
                }
            })?;

        Ok(Self {
            running,
            thread_handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Desktop audio session backed by cpal
pub struct CpalPlatform {
    selection: DeviceSelection,
    poll_interval: Duration,
    active: AtomicBool,
    output_override: Mutex<OutputOverride>,
    watcher: Mutex<Option<DeviceWatcher>>,
}

impl CpalPlatform {
    pub fn new(selection: DeviceSelection, poll_interval: Duration) -> Self {
        Self {
            selection,
            poll_interval,
            active: AtomicBool::new(false),
            output_override: Mutex::new(OutputOverride::None),
            watcher: Mutex::new(None),
        }
    }

    pub fn selection(&self) -> DeviceSelection {
        self.selection.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl AudioPlatform for CpalPlatform {
    fn available_categories(&self) -> Vec<SessionCategory> {
        let has_input = cpal::default_host().default_input_device().is_some();
        if has_input {
            vec![SessionCategory::PlayAndRecord, SessionCategory::Playback]
        } else {
            vec![SessionCategory::Playback]
        }
    }

    fn set_category(
        &self,
        category: SessionCategory,
        mode: SessionMode,
        options: CategoryOptions,
    ) -> Result<(), RouteError> {
        tracing::debug!("Session category {:?} / {:?} ({:?})", category, mode, options);
        Ok(())
    }

    fn set_preferred_sample_rate(&self, sample_rate: u32) -> Result<(), RouteError> {
        // cpal streams run at the device default; the resamplers absorb the difference
        tracing::debug!("Preferred sample rate {} Hz", sample_rate);
        Ok(())
    }

    fn set_preferred_io_buffer_duration(&self, duration: Duration) -> Result<(), RouteError> {
        tracing::debug!("Preferred IO buffer {:?}", duration);
        Ok(())
    }

    fn set_active(&self, active: bool) -> Result<(), RouteError> {
        self.active.store(active, Ordering::SeqCst);
        Ok(())
    }

    fn available_inputs(&self) -> Vec<AudioPort> {
        let snapshot = DeviceSnapshot::capture();
        let mut ports: Vec<AudioPort> = snapshot
            .inputs
            .iter()
            .map(|name| AudioPort::new(name.clone(), classify_port(name, true)))
            .collect();
        // keep the host default first so it wins ties
        if let Some(default) = snapshot.default_input {
            if let Some(pos) = ports.iter().position(|p| p.name == default) {
                let port = ports.remove(pos);
                ports.insert(0, port);
            }
        }
        ports
    }

    fn current_outputs(&self) -> Vec<AudioPort> {
        cpal::default_host()
            .default_output_device()
            .and_then(|d| d.name().ok())
            .map(|name| {
                let port_type = classify_port(&name, false);
                vec![AudioPort::new(name, port_type)]
            })
            .unwrap_or_default()
    }

    fn set_preferred_input(&self, port: &AudioPort) -> Result<(), RouteError> {
        tracing::info!("Preferred input set to '{}'", port.name);
        *self.selection.write() = Some(port.name.clone());
        Ok(())
    }

    fn override_output(&self, port: OutputOverride) -> Result<(), RouteError> {
        *self.output_override.lock() = port;
        Ok(())
    }

    fn microphone_mode(&self) -> MicrophoneMode {
        MicrophoneMode::default()
    }

    fn observe(&self, handler: NotificationHandler) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }
        match DeviceWatcher::spawn(self.poll_interval, DeviceSnapshot::capture, handler) {
            Ok(w) => *watcher = Some(w),
            Err(e) => tracing::error!("Failed to start device watcher: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(inputs: &[&str], default_output: &str) -> DeviceSnapshot {
        DeviceSnapshot {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: [default_output.to_string()].into_iter().collect(),
            default_input: inputs.first().map(|s| s.to_string()),
            default_output: Some(default_output.to_string()),
        }
    }

    #[test]
    fn test_classify_port() {
        assert_eq!(classify_port("AirPods Pro", false), PortType::Bluetooth);
        assert_eq!(classify_port("USB Audio CODEC", true), PortType::Usb);
        assert_eq!(classify_port("Headset Microphone", true), PortType::Headphones);
        assert_eq!(classify_port("MacBook Pro Microphone", true), PortType::BuiltInMic);
        assert_eq!(classify_port("MacBook Pro Speakers", false), PortType::BuiltInSpeaker);
        assert_eq!(classify_port("HDMI Output", false), PortType::Hdmi);
    }

    #[test]
    fn test_diff_unchanged() {
        let a = snapshot(&["Mic"], "Speakers");
        assert!(a.diff(&a.clone()).is_empty());
    }

    #[test]
    fn test_diff_device_added() {
        let before = snapshot(&["Mic"], "Speakers");
        let mut after = before.clone();
        after.inputs.insert("USB Mic".to_string());
        assert_eq!(
            before.diff(&after),
            vec![PlatformNotification::RouteChange(RouteChangeReason::NewDeviceAvailable)]
        );
    }

    #[test]
    fn test_diff_default_output_removed() {
        let before = DeviceSnapshot {
            outputs: ["Speakers", "Headphones"].iter().map(|s| s.to_string()).collect(),
            default_output: Some("Headphones".to_string()),
            ..snapshot(&["Mic"], "Speakers")
        };
        let after = snapshot(&["Mic"], "Speakers");
        assert_eq!(
            before.diff(&after),
            vec![
                PlatformNotification::RouteChange(RouteChangeReason::OldDeviceUnavailable),
                PlatformNotification::ConfigurationChange,
            ]
        );
    }

    #[test]
    fn test_diff_default_switch_only() {
        let before = snapshot(&["Mic", "Other"], "Speakers");
        let mut after = before.clone();
        after.default_input = Some("Other".to_string());
        assert_eq!(
            before.diff(&after),
            vec![
                PlatformNotification::RouteChange(RouteChangeReason::RouteConfigurationChange),
                PlatformNotification::ConfigurationChange,
            ]
        );
    }

    #[test]
    fn test_watcher_reports_changes() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let polls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = polls.clone();

        let probe = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                snapshot(&["Mic"], "Speakers")
            } else {
                snapshot(&["Mic", "USB Mic"], "Speakers")
            }
        };
        let mut watcher = DeviceWatcher::spawn(
            Duration::from_millis(20),
            probe,
            Arc::new(move |n| {
                let _ = tx.send(n);
            }),
        )
        .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            first,
            PlatformNotification::RouteChange(RouteChangeReason::NewDeviceAvailable)
        );
        watcher.stop();
    }
}
