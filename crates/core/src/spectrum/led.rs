use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{dynamics::smooth_toward, ConfigSource, FrameProcessor, SpectrumProcessor};
use crate::{
    analysis::AnalysisFrame,
    config::{LedConfig, SettingsStore, SpectrumConfig},
};

/// Output of [`LedProcessor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedMetrics {
    pub sequence: u64,
    pub bands: Vec<f32>,
    pub level: f32,
    pub transient: f32,
    /// Brightness per physical segment, quantized to the configured steps.
    pub segments: Vec<f32>,
    pub lit_segments: usize,
}

/// Order in which segments light up: the centre first, then outwards,
/// alternating left and right.
pub fn center_out_order(segments: usize) -> Vec<usize> {
    let mut order = Vec::with_capacity(segments);
    if segments == 0 {
        return order;
    }

    let middle = segments / 2;
    let (mut left, mut right) = if segments % 2 == 1 {
        order.push(middle);
        (middle.checked_sub(1), middle + 1)
    } else {
        (Some(middle - 1), middle)
    };

    while order.len() < segments {
        if let Some(index) = left {
            order.push(index);
            left = index.checked_sub(1);
        }
        if right < segments && order.len() < segments {
            order.push(right);
            right += 1;
        }
    }
    order
}

/// Maps `level` onto per-segment brightness.
///
/// Segment `rank` (in lighting order) covers the level range between
/// `(rank / n)^curve` and `((rank + 1) / n)^curve`; its fill within that range
/// is floored to `levels` brightness steps.
fn quantize(level: f32, order: &[usize], levels: u32, curve: f32) -> Vec<f32> {
    let count = order.len();
    let mut segments = vec![0.0; count];
    if count == 0 {
        return segments;
    }

    let steps = levels.max(1) as f32;
    for (rank, &position) in order.iter().enumerate() {
        let low = (rank as f32 / count as f32).powf(curve);
        let high = ((rank + 1) as f32 / count as f32).powf(curve);
        let fill = if high > low {
            ((level - low) / (high - low)).clamp(0.0, 1.0)
        } else if level >= high {
            1.0
        } else {
            0.0
        };
        segments[position] = (fill * steps).floor() / steps;
    }
    segments
}

/// [`SpectrumProcessor`] variant that drives a strip of discrete segments.
#[derive(Debug)]
pub struct LedProcessor {
    spectrum: SpectrumProcessor,
    config: ConfigSource<LedConfig>,
    order: Vec<usize>,
    level: f32,
    last: LedMetrics,
}

impl LedProcessor {
    pub fn new(spectrum: SpectrumConfig, led: LedConfig) -> Self {
        Self::build(
            SpectrumProcessor::new(spectrum),
            ConfigSource::Fixed(led.sanitized()),
        )
    }

    pub fn with_settings(settings: Arc<SettingsStore>) -> Self {
        Self::build(
            SpectrumProcessor::with_settings(Arc::clone(&settings)),
            ConfigSource::Shared(settings),
        )
    }

    fn build(spectrum: SpectrumProcessor, config: ConfigSource<LedConfig>) -> Self {
        Self {
            spectrum,
            config,
            order: Vec::new(),
            level: 0.0,
            last: LedMetrics::default(),
        }
    }

    pub fn last(&self) -> &LedMetrics {
        &self.last
    }

    pub fn reset(&mut self) {
        self.spectrum.reset();
        self.level = 0.0;
        self.last = LedMetrics::default();
    }

    fn config(&self) -> LedConfig {
        match &self.config {
            ConfigSource::Fixed(config) => config.clone(),
            ConfigSource::Shared(settings) => settings.snapshot().led,
        }
    }

    pub fn process(&mut self, frame: &AnalysisFrame) -> LedMetrics {
        if !frame.is_usable() {
            return self.last.clone();
        }

        let config = self.config();
        let bands = self.spectrum.process(frame);

        let target = (bands.level + bands.transient * config.transient_boost).clamp(0.0, 1.0);
        self.level = smooth_toward(self.level, target, config.attack, config.release);

        if self.order.len() != config.segments {
            self.order = center_out_order(config.segments);
        }
        let segments = quantize(
            self.level,
            &self.order,
            config.brightness_levels,
            config.activation_curve,
        );
        let lit_segments = segments.iter().filter(|brightness| **brightness > 0.0).count();

        self.last = LedMetrics {
            sequence: bands.sequence,
            bands: bands.bands,
            level: self.level,
            transient: bands.transient,
            segments,
            lit_segments,
        };
        self.last.clone()
    }
}

impl FrameProcessor for LedProcessor {
    type Output = LedMetrics;

    fn process(&mut self, frame: &AnalysisFrame) -> LedMetrics {
        LedProcessor::process(self, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::tests::{frame_from, silence_frame, tone};

    #[test]
    fn center_lights_first_and_spreads_symmetrically() {
        assert_eq!(center_out_order(5), vec![2, 1, 3, 0, 4]);
        assert_eq!(center_out_order(4), vec![1, 2, 0, 3]);
        assert_eq!(center_out_order(1), vec![0]);
        assert!(center_out_order(0).is_empty());
    }

    #[test]
    fn quantization_respects_levels_and_extremes() {
        let order = center_out_order(5);
        assert!(quantize(0.0, &order, 4, 1.6).iter().all(|b| *b == 0.0));
        assert!(quantize(1.0, &order, 4, 1.6).iter().all(|b| *b == 1.0));

        let partial = quantize(0.3, &order, 4, 1.6);
        assert!(partial[2] > 0.0);
        assert!(partial[0] == 0.0 && partial[4] == 0.0);
        for brightness in &partial {
            let steps = brightness * 4.0;
            assert!((steps - steps.round()).abs() < 1e-6);
        }
    }

    #[test]
    fn curve_above_one_lights_centre_segments_earlier() {
        let order = center_out_order(9);
        let linear = quantize(0.15, &order, 8, 1.0);
        let curved = quantize(0.15, &order, 8, 2.0);
        let lit = |segments: &[f32]| segments.iter().filter(|b| **b > 0.0).count();
        assert!(lit(&curved) > lit(&linear));
    }

    #[test]
    fn led_output_stays_bounded_and_decays_on_silence() {
        let mut processor = LedProcessor::new(SpectrumConfig::default(), LedConfig::default());
        for i in 0..20 {
            let metrics = processor.process(&frame_from(&tone(100.0, 0.9), 48_000, i));
            assert!(metrics.segments.iter().all(|b| (0.0..=1.0).contains(b)));
            assert_eq!(metrics.segments.len(), 11);
        }
        assert!(processor.last().lit_segments > 0);

        let mut previous = processor.last().level;
        for tick in 0..120 {
            let metrics = processor.process(&silence_frame(100 + tick));
            assert!(metrics.level <= previous && metrics.level >= 0.0);
            previous = metrics.level;
        }
        assert_eq!(previous, 0.0);
        assert_eq!(processor.last().lit_segments, 0);
    }

    #[test]
    fn unusable_frames_keep_the_last_strip() {
        let mut processor = LedProcessor::new(SpectrumConfig::default(), LedConfig::default());
        let good = processor.process(&frame_from(&tone(440.0, 0.5), 48_000, 1));
        let mut broken = frame_from(&tone(440.0, 0.5), 48_000, 2);
        broken.sample_rate = 0;
        assert_eq!(processor.process(&broken), good);
    }
}
