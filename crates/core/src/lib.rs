//! Core library for the Cadence music player.
//!
//! The crate owns the real-time side of the player: the transport and queue
//! ([`playback`]), the anti-repetition shuffle order ([`shuffle`]), the shared
//! FFT producer that taps the live output ([`analysis`]) and the processors
//! that turn its frames into band and LED levels ([`spectrum`]). Decoding,
//! device output and the library are collaborators reached through the
//! traits in [`audio`] and [`library`].

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod library;
pub mod playback;
pub mod shuffle;
pub mod spectrum;
pub mod timeline;

pub use analysis::{AnalysisFrame, AnalysisHub, ConsumerToken, SampleRing};
pub use audio::{
    AudioOutput, BufferSource, SampleSource, SchedulingToken, SignalTap, SoftwareOutput,
    TapPoint, TapSource,
};
pub use config::{
    AnalysisConfig, LedConfig, PlaybackConfig, PlayerConfig, RepeatMode, SettingsStore,
    SpectrumConfig, TransientConfig,
};
pub use error::{PlayerError, Result};
pub use events::{Observers, SubscriptionToken};
pub use library::{Track, TrackId, TrackResolver, TrackStore};
pub use playback::{PlaybackEngine, PlaybackEvent, PlaybackSnapshot, TransportState};
pub use shuffle::ShuffleQueueManager;
pub use spectrum::{
    BandMetrics, FrameProcessor, LedMetrics, LedProcessor, MetricsFeed, SpectrumProcessor,
};
pub use timeline::{Clock, ManualClock, PeriodicTask, SystemClock};
