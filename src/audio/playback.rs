//! Gapless playback queue
//!
//! Holds headerless 16-bit PCM buffers in arrival order and feeds the output
//! render callback. Enqueue and render share one mutex; the critical section is
//! bookkeeping on `Bytes` handles plus a copy into the caller's block.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::f32::consts::PI;

use crate::audio::format::{bytes_to_i16, AudioFormat};
use crate::constants::{CROSSFADE_SAMPLES, FADE_IN_SAMPLES};

/// Tunables for fades
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSettings {
    /// Raised-cosine ramp length when resuming from silence (0 disables)
    pub fade_in_samples: usize,
    pub crossfade_enabled: bool,
    /// Overlap window for adjacent clips, in samples
    pub crossfade_samples: usize,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            fade_in_samples: FADE_IN_SAMPLES,
            crossfade_enabled: false,
            crossfade_samples: CROSSFADE_SAMPLES,
        }
    }
}

/// What a render call produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Nothing queued; output is all zeros
    Silence,
    /// Queue drained mid-block; the tail is zeros
    Partial { samples: usize },
    Full,
}

struct QueueState {
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    /// Next sample index inside the fade window, `None` when not fading
    fade_pos: Option<usize>,
    was_silent: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            pending_bytes: 0,
            fade_pos: None,
            was_silent: true,
        }
    }
}

/// Ordered PCM queue consumed by the render callback
pub struct PlaybackQueue {
    format: AudioFormat,
    settings: PlaybackSettings,
    inner: Mutex<QueueState>,
}

impl PlaybackQueue {
    pub fn new(format: AudioFormat, settings: PlaybackSettings) -> Self {
        tracing::info!("Playback queue initialized: {}", format);
        Self {
            format,
            settings,
            inner: Mutex::new(QueueState::new()),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn settings(&self) -> PlaybackSettings {
        self.settings
    }

    /// Append headerless PCM. With crossfade enabled the new buffer is blended
    /// into the tail of the last pending buffer.
    pub fn enqueue(&self, data: Bytes) {
        // a partial trailing frame would desynchronize every later sample
        let frame = self.format.bytes_per_frame().max(1);
        let data = match data.len() % frame {
            0 => data,
            partial => data.slice(..data.len() - partial),
        };
        if data.is_empty() {
            return;
        }

        let mut state = self.inner.lock();
        if self.settings.crossfade_enabled {
            if let Some(last) = state.pending.back() {
                if let Some(merged) = crossfade(last, &data, self.settings.crossfade_samples) {
                    let old_len = last.len();
                    state.pending_bytes = state.pending_bytes - old_len + merged.len();
                    if let Some(slot) = state.pending.back_mut() {
                        *slot = merged;
                    }
                    return;
                }
            }
        }
        state.pending_bytes += data.len();
        state.pending.push_back(data);
    }

    /// Fill `out` with queued samples, zero-padding whatever the queue can't cover
    pub fn render(&self, out: &mut [i16]) -> RenderOutcome {
        out.fill(0);
        if out.is_empty() {
            return RenderOutcome::Silence;
        }

        let mut state = self.inner.lock();
        if state.pending.is_empty() {
            if !state.was_silent {
                tracing::debug!("Playback queue drained, rendering silence");
            }
            state.was_silent = true;
            return RenderOutcome::Silence;
        }

        if state.was_silent && self.settings.fade_in_samples > 0 {
            state.fade_pos = Some(0);
        }

        let mut filled = 0;
        while filled < out.len() {
            let Some(chunk) = state.pending.pop_front() else {
                break;
            };
            let wanted = (out.len() - filled) * 2;
            let take = wanted.min(chunk.len());

            filled += bytes_to_i16(&chunk[..take], &mut out[filled..]);
            state.pending_bytes -= take;

            if take < chunk.len() {
                state.pending.push_front(chunk.slice(take..));
            }
        }

        if let Some(pos) = state.fade_pos {
            state.fade_pos = apply_fade_in(&mut out[..filled], pos, self.settings.fade_in_samples);
        }

        if filled < out.len() {
            tracing::debug!(
                "Playback queue starved: {} of {} samples filled",
                filled,
                out.len()
            );
            state.was_silent = true;
            RenderOutcome::Partial { samples: filled }
        } else {
            state.was_silent = false;
            RenderOutcome::Full
        }
    }

    /// Drop everything pending and reset fade tracking
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        let dropped = state.pending_bytes;
        *state = QueueState::new();
        tracing::debug!("Playback queue cleared ({} bytes dropped)", dropped);
    }

    pub fn pending_bytes(&self) -> usize {
        self.inner.lock().pending_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }
}

/// Ramp `samples` up along a raised-cosine curve starting at `pos` within a
/// `len`-sample window. Returns the next position, or `None` once complete.
fn apply_fade_in(samples: &mut [i16], pos: usize, len: usize) -> Option<usize> {
    let mut pos = pos;
    for sample in samples.iter_mut() {
        if pos >= len {
            return None;
        }
        let gain = 0.5 * (1.0 - (PI * pos as f32 / len as f32).cos());
        *sample = (*sample as f32 * gain) as i16;
        pos += 1;
    }
    if pos >= len {
        None
    } else {
        Some(pos)
    }
}

/// Overlap-add the last `window` samples of `old` with the first `window`
/// samples of `new` using linear curves. `None` when either side is shorter
/// than the window.
fn crossfade(old: &Bytes, new: &Bytes, window: usize) -> Option<Bytes> {
    let window_bytes = window * 2;
    if window == 0 || old.len() < window_bytes || new.len() < window_bytes {
        return None;
    }

    let tail_start = old.len() - window_bytes;
    let mut merged = Vec::with_capacity(old.len() + new.len() - window_bytes);
    merged.extend_from_slice(&old[..tail_start]);

    let old_tail = old[tail_start..].chunks_exact(2);
    let new_head = new[..window_bytes].chunks_exact(2);
    for (i, (a, b)) in old_tail.zip(new_head).enumerate() {
        let fade_out = (window - i) as f32 / window as f32;
        let fade_in = i as f32 / window as f32;
        let a = i16::from_le_bytes([a[0], a[1]]) as f32;
        let b = i16::from_le_bytes([b[0], b[1]]) as f32;
        let mixed = (a * fade_out + b * fade_in) as i16;
        merged.extend_from_slice(&mixed.to_le_bytes());
    }

    merged.extend_from_slice(&new[window_bytes..]);
    Some(Bytes::from(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pcm(samples: &[i16]) -> Bytes {
        Bytes::from(samples.iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<u8>>())
    }

    fn no_fades() -> PlaybackSettings {
        PlaybackSettings {
            fade_in_samples: 0,
            crossfade_enabled: false,
            crossfade_samples: CROSSFADE_SAMPLES,
        }
    }

    fn queue(settings: PlaybackSettings) -> PlaybackQueue {
        PlaybackQueue::new(AudioFormat::pcm_i16(48000, 1), settings)
    }

    #[test]
    fn test_empty_queue_renders_silence() {
        let q = queue(PlaybackSettings::default());
        let mut out = [5i16; 16];
        assert_eq!(q.render(&mut out), RenderOutcome::Silence);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_split_across_renders() {
        let q = queue(no_fades());
        q.enqueue(pcm(&[1, 2, 3, 4, 5]));
        q.enqueue(pcm(&[6, 7]));

        let mut out = [0i16; 3];
        assert_eq!(q.render(&mut out), RenderOutcome::Full);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(q.render(&mut out), RenderOutcome::Full);
        assert_eq!(out, [4, 5, 6]);
        assert_eq!(q.render(&mut out), RenderOutcome::Partial { samples: 1 });
        assert_eq!(out, [7, 0, 0]);
        assert_eq!(q.render(&mut out), RenderOutcome::Silence);
        assert_eq!(q.pending_bytes(), 0);
    }

    #[test]
    fn test_fade_in_after_silence() {
        let q = queue(PlaybackSettings {
            fade_in_samples: 8,
            ..no_fades()
        });
        q.enqueue(pcm(&[10000; 12]));

        let mut out = [0i16; 4];
        q.render(&mut out);
        assert_eq!(out[0], 0);
        assert!(out[1] < out[2] && out[2] < out[3]);

        // the ramp continues into the next block then reaches full scale
        q.render(&mut out);
        assert!(out[0] > 4000 && out[3] < 10000);
        q.render(&mut out);
        assert_eq!(out, [10000; 4]);
    }

    #[test]
    fn test_fade_restarts_after_clear() {
        let q = queue(PlaybackSettings {
            fade_in_samples: 4,
            ..no_fades()
        });
        q.enqueue(pcm(&[8000; 8]));
        let mut out = [0i16; 8];
        q.render(&mut out);
        assert_eq!(out[4..], [8000; 4]);

        q.clear();
        q.enqueue(pcm(&[8000; 8]));
        q.render(&mut out);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_clear_drops_pending() {
        let q = queue(no_fades());
        q.enqueue(pcm(&[1; 100]));
        q.clear();
        assert!(q.is_empty());

        let mut out = [0i16; 10];
        assert_eq!(q.render(&mut out), RenderOutcome::Silence);
    }

    #[test]
    fn test_crossfade_length_and_curve() {
        let q = queue(PlaybackSettings {
            fade_in_samples: 0,
            crossfade_enabled: true,
            crossfade_samples: 4,
        });
        q.enqueue(pcm(&[1000; 6]));
        q.enqueue(pcm(&[-1000; 5]));

        // 6 + 5 - 4 samples, the overlap is consumed once
        assert_eq!(q.pending_bytes(), 7 * 2);

        let mut out = [0i16; 7];
        assert_eq!(q.render(&mut out), RenderOutcome::Full);
        assert_eq!(out, [1000, 1000, 1000, 500, 0, -500, -1000]);
    }

    #[test]
    fn test_crossfade_skipped_for_short_clips() {
        let q = queue(PlaybackSettings {
            fade_in_samples: 0,
            crossfade_enabled: true,
            crossfade_samples: 8,
        });
        q.enqueue(pcm(&[1; 4]));
        q.enqueue(pcm(&[2; 20]));
        assert_eq!(q.pending_bytes(), 24 * 2);
    }

    #[test]
    fn test_odd_byte_trimmed() {
        let q = queue(no_fades());
        q.enqueue(Bytes::from_static(&[1, 0, 2]));
        assert_eq!(q.pending_bytes(), 2);
    }

    #[test]
    fn test_partial_stereo_frame_trimmed() {
        let q = PlaybackQueue::new(AudioFormat::pcm_i16(48000, 2), no_fades());
        q.enqueue(Bytes::from_static(&[1, 0, 2, 0, 3, 0]));
        assert_eq!(q.pending_bytes(), 4);

        let mut out = [9i16; 4];
        assert_eq!(q.render(&mut out), RenderOutcome::Partial { samples: 2 });
        assert_eq!(out, [1, 2, 0, 0]);
    }

    proptest! {
        #[test]
        fn prop_render_preserves_bytes_and_order(
            clips in prop::collection::vec(prop::collection::vec(any::<i16>(), 1..64), 0..12),
            block in 1usize..50,
        ) {
            let q = queue(no_fades());
            let expected: Vec<i16> = clips.iter().flatten().copied().collect();
            for clip in &clips {
                q.enqueue(pcm(clip));
            }

            let mut rendered = Vec::new();
            let mut out = vec![0i16; block];
            loop {
                match q.render(&mut out) {
                    RenderOutcome::Full => rendered.extend_from_slice(&out),
                    RenderOutcome::Partial { samples } => {
                        rendered.extend_from_slice(&out[..samples]);
                        break;
                    }
                    RenderOutcome::Silence => break,
                }
            }
            prop_assert_eq!(rendered, expected);
        }

        #[test]
        fn prop_clear_drops_only_pending(
            before in prop::collection::vec(any::<i16>(), 1..200),
            after in prop::collection::vec(any::<i16>(), 1..200),
            consumed in 0usize..200,
        ) {
            let q = queue(no_fades());
            q.enqueue(pcm(&before));
            let consumed = consumed.min(before.len());
            if consumed > 0 {
                let mut out = vec![0i16; consumed];
                q.render(&mut out);
            }
            q.clear();
            q.enqueue(pcm(&after));

            let mut out = vec![0i16; after.len()];
            prop_assert_eq!(q.render(&mut out), RenderOutcome::Full);
            prop_assert_eq!(out, after);
            prop_assert_eq!(q.pending_bytes(), 0);
        }
    }
}
