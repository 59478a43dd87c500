//! Seams between the player core and the platform audio stack.
//!
//! Decoding and device output are provided by collaborators; the core only
//! sees decoded [`SampleSource`]s and an [`AudioOutput`] that can schedule one
//! segment at a time and report how far its transport clock has rendered.

use std::{f32::consts::PI, fmt, sync::Arc, time::Duration};

use crate::{PlayerError, Result};

mod software;

#[cfg(test)]
pub(crate) mod scripted;

pub use software::SoftwareOutput;

/// Opaque identifier of one scheduled segment. A completion is honoured only
/// while its token is still the engine's active token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulingToken(u64);

impl SchedulingToken {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SchedulingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Invoked once when a scheduled segment has been rendered to its end.
pub type CompletionHandler = Box<dyn FnOnce(SchedulingToken) + Send>;

/// Decoded, random-access audio.
pub trait SampleSource: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn frame_count(&self) -> u64;

    /// Copies interleaved frames starting at `start_frame` into `out` and
    /// returns how many whole frames were written.
    fn read_frames(&self, start_frame: u64, out: &mut [f32]) -> usize;

    fn duration_secs(&self) -> f64 {
        if self.sample_rate() == 0 {
            0.0
        } else {
            self.frame_count() as f64 / f64::from(self.sample_rate())
        }
    }
}

/// Receiver of the live output signal. Implementations are called from the
/// render context and must not block or allocate.
pub trait SignalTap: Send + Sync {
    fn push(&self, interleaved: &[f32], channels: u16, sample_rate: u32);
}

/// Something a [`SignalTap`] can be attached to.
pub trait TapSource: Send + Sync {
    fn attach_tap(&self, tap: Arc<dyn SignalTap>);
    fn detach_tap(&self);
}

/// A segment handed to the output.
pub struct ScheduledSegment {
    pub source: Arc<dyn SampleSource>,
    pub start_frame: u64,
    pub token: SchedulingToken,
    pub on_complete: CompletionHandler,
}

impl fmt::Debug for ScheduledSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledSegment")
            .field("start_frame", &self.start_frame)
            .field("token", &self.token)
            .finish()
    }
}

/// Output path: player node, lookahead delay stage and mixer.
pub trait AudioOutput: Send + Sync {
    /// Starts the graph if it is not running yet.
    fn start(&self) -> Result<()>;

    /// Replaces whatever was scheduled before and starts rendering
    /// `segment` immediately. A previously scheduled segment may still
    /// report completion afterwards; the engine filters those by token.
    fn schedule(&self, segment: ScheduledSegment) -> Result<()>;

    /// Freezes the transport clock. The engine never resumes a paused
    /// segment; it schedules a fresh one from the held position instead.
    fn pause(&self);

    /// Drops the scheduled segment.
    fn stop(&self);

    /// Frames of the current segment rendered on the transport clock, or
    /// `None` when nothing is scheduled.
    fn rendered_frames(&self) -> Option<u64>;

    fn set_volume(&self, volume: f32);

    /// Length of the delay stage between the tap and the audible output.
    fn set_lookahead(&self, lookahead: Duration);

    fn attach_tap(&self, tap: Arc<dyn SignalTap>);
    fn detach_tap(&self);
}

/// Exposes an output's signal tap to analysis consumers without handing out
/// the rest of the output.
#[derive(Clone)]
pub struct TapPoint {
    output: Arc<dyn AudioOutput>,
}

impl TapPoint {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self { output }
    }
}

impl TapSource for TapPoint {
    fn attach_tap(&self, tap: Arc<dyn SignalTap>) {
        self.output.attach_tap(tap);
    }

    fn detach_tap(&self) {
        self.output.detach_tap();
    }
}

impl fmt::Debug for TapPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapPoint").finish()
    }
}

/// Fully decoded audio held in memory.
#[derive(Clone)]
pub struct BufferSource {
    samples: Arc<[f32]>,
    channels: u16,
    sample_rate: u32,
}

impl BufferSource {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(PlayerError::InvalidInput("a source needs at least one channel"));
        }
        if sample_rate == 0 {
            return Err(PlayerError::InvalidInput("sample rate must be positive"));
        }
        if samples.len() % usize::from(channels) != 0 {
            return Err(PlayerError::InvalidInput(
                "interleaved sample count must be a multiple of the channel count",
            ));
        }

        Ok(Self {
            samples: samples.into(),
            channels,
            sample_rate,
        })
    }

    /// Mono sine tone.
    pub fn sine(frequency_hz: f32, seconds: f32, sample_rate: u32, amplitude: f32) -> Result<Self> {
        let frames = (seconds.max(0.0) * sample_rate as f32) as usize;
        let step = 2.0 * PI * frequency_hz / sample_rate.max(1) as f32;
        let samples = (0..frames)
            .map(|index| (index as f32 * step).sin() * amplitude)
            .collect();
        Self::new(samples, 1, sample_rate)
    }

    pub fn silence(seconds: f32, sample_rate: u32) -> Result<Self> {
        let frames = (seconds.max(0.0) * sample_rate as f32) as usize;
        Self::new(vec![0.0; frames], 1, sample_rate)
    }
}

impl SampleSource for BufferSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn frame_count(&self) -> u64 {
        (self.samples.len() / usize::from(self.channels)) as u64
    }

    fn read_frames(&self, start_frame: u64, out: &mut [f32]) -> usize {
        let channels = usize::from(self.channels);
        let Ok(start) = usize::try_from(start_frame) else {
            return 0;
        };
        let offset = start.saturating_mul(channels);
        if offset >= self.samples.len() {
            return 0;
        }

        let available = self.samples.len() - offset;
        let wanted = (out.len() / channels) * channels;
        let copied = wanted.min(available);
        out[..copied].copy_from_slice(&self.samples[offset..offset + copied]);
        copied / channels
    }
}

impl fmt::Debug for BufferSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSource")
            .field("frames", &self.frame_count())
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}
