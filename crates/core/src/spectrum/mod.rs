//! Turns shared analysis frames into UI-ready band levels.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{AnalysisFrame, AnalysisHub, ConsumerToken},
    config::{SettingsStore, SpectrumConfig},
    events::{Observers, SubscriptionToken},
    Result,
};

pub mod dynamics;
mod led;

pub use led::{center_out_order, LedMetrics, LedProcessor};

use dynamics::{
    expand, normalize_power, smooth_toward, soft_knee, sub_bass_power, BandLayout,
    TransientDetector,
};

/// Smoothed output of [`SpectrumProcessor`]. Every value is within 0..1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandMetrics {
    /// Sequence number of the frame these values were computed from.
    pub sequence: u64,
    pub bands: Vec<f32>,
    pub level: f32,
    pub transient: f32,
}

/// Anything that folds analysis frames into an output value.
pub trait FrameProcessor: Send + 'static {
    type Output: Clone + Send + Sync + 'static;

    /// Processes one frame. On unusable input the previous output is
    /// returned unchanged.
    fn process(&mut self, frame: &AnalysisFrame) -> Self::Output;
}

/// Where a processor reads its tuning from.
enum ConfigSource<T> {
    Fixed(T),
    Shared(Arc<SettingsStore>),
}

impl<T> fmt::Debug for ConfigSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(_) => f.write_str("Fixed"),
            Self::Shared(_) => f.write_str("Shared"),
        }
    }
}

/// Banded energy, transient detection and envelope smoothing.
#[derive(Debug)]
pub struct SpectrumProcessor {
    config: ConfigSource<SpectrumConfig>,
    layout: Option<BandLayout>,
    detector: TransientDetector,
    bands: Vec<f32>,
    level: f32,
    transient: f32,
    last: BandMetrics,
}

impl SpectrumProcessor {
    pub fn new(config: SpectrumConfig) -> Self {
        Self::with_source(ConfigSource::Fixed(config.sanitized()))
    }

    /// Reads a fresh settings snapshot on every frame.
    pub fn with_settings(settings: Arc<SettingsStore>) -> Self {
        Self::with_source(ConfigSource::Shared(settings))
    }

    fn with_source(config: ConfigSource<SpectrumConfig>) -> Self {
        Self {
            config,
            layout: None,
            detector: TransientDetector::default(),
            bands: Vec::new(),
            level: 0.0,
            transient: 0.0,
            last: BandMetrics::default(),
        }
    }

    pub fn last(&self) -> &BandMetrics {
        &self.last
    }

    pub fn reset(&mut self) {
        self.layout = None;
        self.detector.reset();
        self.bands.clear();
        self.level = 0.0;
        self.transient = 0.0;
        self.last = BandMetrics::default();
    }

    fn config(&self) -> SpectrumConfig {
        match &self.config {
            ConfigSource::Fixed(config) => config.clone(),
            ConfigSource::Shared(settings) => settings.snapshot().spectrum,
        }
    }

    pub fn process(&mut self, frame: &AnalysisFrame) -> BandMetrics {
        if !frame.is_usable() {
            tracing::trace!(sequence = frame.sequence, "unusable frame, keeping last metrics");
            return self.last.clone();
        }

        let config = self.config();
        let metrics = self.compute(frame, &config);
        self.last = metrics.clone();
        metrics
    }

    fn compute(&mut self, frame: &AnalysisFrame, config: &SpectrumConfig) -> BandMetrics {
        let layout_stale = self
            .layout
            .as_ref()
            .map(|layout| !layout.matches(&config.band_edges_hz, frame.sample_rate, frame.fft_size))
            .unwrap_or(true);
        if layout_stale {
            let layout = BandLayout::new(&config.band_edges_hz, frame.sample_rate, frame.fft_size);
            tracing::debug!(
                bands = layout.band_count(),
                sample_rate = frame.sample_rate,
                fft_size = frame.fft_size,
                "band layout rebuilt"
            );
            if layout.band_count() != self.bands.len() {
                self.bands = vec![0.0; layout.band_count()];
            }
            self.layout = Some(layout);
        }
        let Some(layout) = self.layout.as_ref() else {
            return self.last.clone();
        };

        let shape = |value: f32| {
            let scaled = (value * config.sensitivity).clamp(0.0, 1.0);
            let curved = soft_knee(scaled, config.knee, config.boost_exponent, config.compression);
            let shaped = expand(curved, config.expansion);
            if shaped < config.band_gate {
                0.0
            } else {
                shaped
            }
        };

        let mut targets: Vec<f32> = layout
            .band_power(&frame.magnitudes)
            .into_iter()
            .map(|power| shape(normalize_power(power, config.floor_db, config.ceiling_db)))
            .collect();

        let level_target = shape(normalize_power(
            frame.rms * frame.rms,
            config.floor_db,
            config.ceiling_db,
        ));

        let sub_bass = normalize_power(
            sub_bass_power(frame, config.transient.cutoff_hz),
            config.floor_db,
            config.ceiling_db,
        );
        let transient_target = self
            .detector
            .update(sub_bass, level_target, &config.transient);
        self.transient = smooth_toward(
            self.transient,
            transient_target,
            config.transient.attack,
            config.transient.release,
        );

        let emphasis = transient_target * config.transient.kick_emphasis;
        if emphasis > 0.0 {
            for (band, target) in targets.iter_mut().enumerate() {
                let below_cutoff = layout
                    .lower_edge(band)
                    .map(|edge| edge < config.transient.cutoff_hz)
                    .unwrap_or(false);
                if below_cutoff {
                    *target = (*target + emphasis).min(1.0);
                }
            }
        }

        for (current, target) in self.bands.iter_mut().zip(&targets) {
            *current = smooth_toward(*current, *target, config.attack, config.release);
        }
        self.level = smooth_toward(self.level, level_target, config.attack, config.release);

        BandMetrics {
            sequence: frame.sequence,
            bands: self.bands.clone(),
            level: self.level,
            transient: self.transient,
        }
    }
}

impl FrameProcessor for SpectrumProcessor {
    type Output = BandMetrics;

    fn process(&mut self, frame: &AnalysisFrame) -> BandMetrics {
        SpectrumProcessor::process(self, frame)
    }
}

/// Consumer-facing feed that runs one processor on every hub tick and
/// republishes its output.
///
/// Any number of feeds can share one hub; the transform still runs once per
/// tick.
pub struct MetricsFeed<P: FrameProcessor> {
    hub: Arc<AnalysisHub>,
    shared: Arc<FeedShared<P>>,
    activation: Mutex<FeedActivation>,
}

struct FeedShared<P: FrameProcessor> {
    processor: Mutex<P>,
    consumers: Observers<P::Output>,
    latest: Mutex<Option<P::Output>>,
}

#[derive(Default)]
struct FeedActivation {
    starts: usize,
    hub_token: Option<ConsumerToken>,
}

impl<P: FrameProcessor> FeedShared<P> {
    fn handle(&self, frame: &AnalysisFrame) -> P::Output {
        let output = self
            .processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process(frame);
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(output.clone());
        self.consumers.notify(&output);
        output
    }
}

impl<P: FrameProcessor> MetricsFeed<P> {
    pub fn new(hub: Arc<AnalysisHub>, processor: P) -> Self {
        Self {
            hub,
            shared: Arc::new(FeedShared {
                processor: Mutex::new(processor),
                consumers: Observers::new(),
                latest: Mutex::new(None),
            }),
            activation: Mutex::new(FeedActivation::default()),
        }
    }

    /// Activates the hub and begins processing its frames.
    pub fn start(&self) -> Result<()> {
        let mut activation = self.activation.lock().unwrap_or_else(PoisonError::into_inner);
        self.hub.start()?;
        activation.starts += 1;
        if activation.hub_token.is_none() {
            let shared = Arc::clone(&self.shared);
            activation.hub_token = Some(self.hub.add_consumer(move |frame| {
                shared.handle(frame);
            }));
        }
        Ok(())
    }

    /// Undoes one [`MetricsFeed::start`]. Extra calls are ignored.
    pub fn stop(&self) -> Result<()> {
        let mut activation = self.activation.lock().unwrap_or_else(PoisonError::into_inner);
        if activation.starts == 0 {
            return Ok(());
        }
        activation.starts -= 1;
        if activation.starts == 0 {
            if let Some(token) = activation.hub_token.take() {
                self.hub.remove_consumer(token);
            }
        }
        self.hub.stop()
    }

    pub fn add_consumer<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&P::Output) + Send + Sync + 'static,
    {
        self.shared.consumers.subscribe(callback)
    }

    pub fn remove_consumer(&self, token: SubscriptionToken) -> bool {
        self.shared.consumers.unsubscribe(token)
    }

    pub fn latest(&self) -> Option<P::Output> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Processes `frame` as if it had arrived from the hub.
    pub fn process_frame(&self, frame: &AnalysisFrame) -> P::Output {
        self.shared.handle(frame)
    }
}

impl<P: FrameProcessor> Drop for MetricsFeed<P> {
    fn drop(&mut self) {
        let activation = std::mem::take(
            &mut *self.activation.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if let Some(token) = activation.hub_token {
            self.hub.remove_consumer(token);
        }
        for _ in 0..activation.starts {
            if let Err(err) = self.hub.stop() {
                tracing::warn!(%err, "failed to release analysis hub");
            }
        }
    }
}

impl<P: FrameProcessor> fmt::Debug for MetricsFeed<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsFeed")
            .field("consumers", &self.shared.consumers.len())
            .finish()
    }
}
