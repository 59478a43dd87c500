//! Level mapping, dynamics curves and envelope helpers shared by the
//! spectrum processors.

use crate::{analysis::AnalysisFrame, config::TransientConfig};

/// Smoothed values closer than this to their target snap onto it.
pub const SNAP_EPSILON: f32 = 1e-3;
const ENERGY_FLOOR: f32 = 1e-12;

/// Maps a power value onto 0..1 between `floor_db` and `ceiling_db`.
pub fn normalize_power(power: f32, floor_db: f32, ceiling_db: f32) -> f32 {
    if !power.is_finite() || ceiling_db <= floor_db {
        return 0.0;
    }
    let db = 10.0 * power.max(ENERGY_FLOOR).log10();
    ((db - floor_db) / (ceiling_db - floor_db)).clamp(0.0, 1.0)
}

/// Power-curve boost below `knee`, exponential compression above it. Both
/// halves meet at the knee and the curve maps 1.0 onto 1.0.
pub fn soft_knee(value: f32, knee: f32, boost_exponent: f32, compression: f32) -> f32 {
    let x = value.clamp(0.0, 1.0);
    let knee = knee.clamp(f32::EPSILON, 1.0 - f32::EPSILON);
    if x <= knee {
        return knee * (x / knee).powf(boost_exponent);
    }

    let span = 1.0 - knee;
    let t = (x - knee) / span;
    let normalizer = 1.0 - (-compression).exp();
    if normalizer <= f32::EPSILON {
        return x;
    }
    (knee + span * (1.0 - (-compression * t).exp()) / normalizer).clamp(0.0, 1.0)
}

/// Blends towards a cubic curve to push quiet values further down.
pub fn expand(value: f32, amount: f32) -> f32 {
    let x = value.clamp(0.0, 1.0);
    (x + (x * x * x - x) * amount.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// Asymmetric one-pole smoothing. Rises with `attack`, falls with `release`
/// and never leaves 0..1.
pub fn smooth_toward(current: f32, target: f32, attack: f32, release: f32) -> f32 {
    let target = if target.is_finite() {
        target.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let coefficient = if target > current { attack } else { release };
    let next = current + (target - current) * coefficient.clamp(0.0, 1.0);
    if (next - target).abs() < SNAP_EPSILON {
        target
    } else {
        next.clamp(0.0, 1.0)
    }
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge1 <= edge0 {
        return if x >= edge0 { 1.0 } else { 0.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Bin ranges for a set of band edges at one sample rate and transform size.
#[derive(Debug, Clone, PartialEq)]
pub struct BandLayout {
    edges_hz: Vec<f32>,
    sample_rate: u32,
    fft_size: usize,
    ranges: Vec<(usize, usize)>,
}

impl BandLayout {
    pub fn new(edges_hz: &[f32], sample_rate: u32, fft_size: usize) -> Self {
        let bins = fft_size / 2 + 1;
        let bin_hz = if fft_size == 0 {
            0.0
        } else {
            sample_rate as f32 / fft_size as f32
        };

        let ranges = edges_hz
            .windows(2)
            .map(|edge| {
                if bin_hz <= 0.0 {
                    return (0, 0);
                }
                let low = ((edge[0] / bin_hz).floor() as usize).max(1).min(bins);
                let mut high = ((edge[1] / bin_hz).ceil() as usize).min(bins);
                if high <= low && low < bins {
                    high = low + 1;
                }
                (low, high.max(low))
            })
            .collect();

        Self {
            edges_hz: edges_hz.to_vec(),
            sample_rate,
            fft_size,
            ranges,
        }
    }

    pub fn matches(&self, edges_hz: &[f32], sample_rate: u32, fft_size: usize) -> bool {
        self.sample_rate == sample_rate && self.fft_size == fft_size && self.edges_hz == edges_hz
    }

    pub fn band_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    pub fn lower_edge(&self, band: usize) -> Option<f32> {
        self.edges_hz.get(band).copied()
    }

    /// Mean power per band; empty ranges report zero.
    pub fn band_power(&self, magnitudes: &[f32]) -> Vec<f32> {
        self.ranges
            .iter()
            .map(|&(low, high)| mean_power(magnitudes, low, high))
            .collect()
    }
}

/// Mean squared magnitude over `low..high`.
pub fn mean_power(magnitudes: &[f32], low: usize, high: usize) -> f32 {
    let high = high.min(magnitudes.len());
    if high <= low {
        return 0.0;
    }
    magnitudes[low..high].iter().map(|m| m * m).sum::<f32>() / (high - low) as f32
}

/// Mean power of the bins at or below `cutoff_hz`, skipping DC.
pub fn sub_bass_power(frame: &AnalysisFrame, cutoff_hz: f32) -> f32 {
    let bin_hz = frame.bin_hz();
    if bin_hz <= 0.0 {
        return 0.0;
    }
    let high = ((cutoff_hz / bin_hz).ceil() as usize + 1).max(2);
    mean_power(&frame.magnitudes, 1, high)
}

/// Fast/slow moving-average kick detector.
#[derive(Debug, Clone, Default)]
pub struct TransientDetector {
    fast: f32,
    slow: f32,
    primed: bool,
}

impl TransientDetector {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feeds one normalized sub-bass reading and the current overall level;
    /// returns the transient strength in 0..1.
    pub fn update(&mut self, sub_bass: f32, level: f32, config: &TransientConfig) -> f32 {
        let sub_bass = sub_bass.clamp(0.0, 1.0);
        if !self.primed {
            self.fast = sub_bass;
            self.slow = sub_bass;
            self.primed = true;
            return 0.0;
        }

        self.fast += (sub_bass - self.fast) * config.fast_rate;
        self.slow += (sub_bass - self.slow) * config.slow_rate;

        let deviation = (self.fast - self.slow).max(0.0);
        let gated = if config.noise_gate > 0.0 {
            deviation * smoothstep(config.noise_gate, config.noise_gate * 2.0, deviation)
        } else {
            deviation
        };
        let context =
            config.quiet_gain + (config.loud_gain - config.quiet_gain) * level.clamp(0.0, 1.0);

        (gated * context * config.gain).clamp(0.0, 1.0)
    }
}
