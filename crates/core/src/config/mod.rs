use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::{
    events::{Observers, SubscriptionToken},
    Result,
};

/// Upper bound for the output lookahead delay.
pub const MAX_LOOKAHEAD_MS: u32 = 200;

/// Top-level configuration structure for the player core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub playback: PlaybackConfig,
    pub analysis: AnalysisConfig,
    pub spectrum: SpectrumConfig,
    pub led: LedConfig,
}

impl PlayerConfig {
    pub fn from_json_str(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input)?;
        Ok(config.sanitized())
    }

    pub fn to_json_string_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Returns a copy with every value clamped into its supported range.
    pub fn sanitized(&self) -> Self {
        Self {
            playback: self.playback.sanitized(),
            analysis: self.analysis.sanitized(),
            spectrum: self.spectrum.sanitized(),
            led: self.led.sanitized(),
        }
    }
}

/// How the queue behaves when it runs out of tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub volume: f32,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    /// Extra output delay, reported position is compensated for it.
    pub lookahead_ms: u32,
    pub position_interval_ms: u64,
    /// `previous()` restarts the current track once it has played this long.
    pub previous_restart_threshold_secs: f64,
    pub shuffle_history_limit: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            shuffle: false,
            repeat: RepeatMode::Off,
            lookahead_ms: 120,
            position_interval_ms: 50,
            previous_restart_threshold_secs: 3.0,
            shuffle_history_limit: 12,
        }
    }
}

impl PlaybackConfig {
    pub fn sanitized(&self) -> Self {
        Self {
            volume: finite_or(self.volume, 1.0).clamp(0.0, 1.0),
            shuffle: self.shuffle,
            repeat: self.repeat,
            lookahead_ms: self.lookahead_ms.min(MAX_LOOKAHEAD_MS),
            position_interval_ms: self.position_interval_ms.clamp(5, 1_000),
            previous_restart_threshold_secs: finite_or(self.previous_restart_threshold_secs, 3.0)
                .max(0.0),
            shuffle_history_limit: self.shuffle_history_limit.max(1),
        }
    }

    pub fn lookahead_secs(&self) -> f64 {
        f64::from(self.lookahead_ms.min(MAX_LOOKAHEAD_MS)) / 1_000.0
    }
}

/// Settings for the shared FFT producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub fft_size: usize,
    pub buffer_capacity: usize,
    pub tick_hz: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            buffer_capacity: 8192,
            tick_hz: 60.0,
        }
    }
}

impl AnalysisConfig {
    pub fn sanitized(&self) -> Self {
        let fft_size = self.fft_size.clamp(64, 16_384).next_power_of_two();
        Self {
            fft_size,
            buffer_capacity: self.buffer_capacity.max(fft_size),
            tick_hz: finite_or(self.tick_hz, 60.0).clamp(1.0, 240.0),
        }
    }
}

/// Tuning for the banded spectrum processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    /// Ascending band boundaries in Hz; `n + 1` edges describe `n` bands.
    pub band_edges_hz: Vec<f32>,
    pub floor_db: f32,
    pub ceiling_db: f32,
    pub sensitivity: f32,
    /// Normalized level where the boost curve hands over to compression.
    pub knee: f32,
    pub boost_exponent: f32,
    pub compression: f32,
    /// Blend towards a cubic curve, 0 disables.
    pub expansion: f32,
    pub attack: f32,
    pub release: f32,
    pub band_gate: f32,
    pub transient: TransientConfig,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            band_edges_hz: vec![20.0, 60.0, 150.0, 400.0, 1_000.0, 2_400.0, 6_000.0, 16_000.0],
            floor_db: -70.0,
            ceiling_db: -6.0,
            sensitivity: 1.0,
            knee: 0.6,
            boost_exponent: 0.7,
            compression: 3.0,
            expansion: 0.0,
            attack: 0.6,
            release: 0.15,
            band_gate: 0.04,
            transient: TransientConfig::default(),
        }
    }
}

impl SpectrumConfig {
    pub fn sanitized(&self) -> Self {
        let mut edges: Vec<f32> = self
            .band_edges_hz
            .iter()
            .copied()
            .filter(|edge| edge.is_finite() && *edge >= 0.0)
            .collect();
        edges.sort_by(f32::total_cmp);
        edges.dedup();
        if edges.len() < 2 {
            edges = Self::default().band_edges_hz;
        }

        let floor_db = finite_or(self.floor_db, -70.0);
        let mut ceiling_db = finite_or(self.ceiling_db, -6.0);
        if ceiling_db <= floor_db + 1.0 {
            ceiling_db = floor_db + 1.0;
        }

        let attack = finite_or(self.attack, 0.6).clamp(0.01, 1.0);
        let release = finite_or(self.release, 0.15).clamp(0.01, 1.0).min(attack);

        Self {
            band_edges_hz: edges,
            floor_db,
            ceiling_db,
            sensitivity: finite_or(self.sensitivity, 1.0).clamp(0.0, 8.0),
            knee: finite_or(self.knee, 0.6).clamp(0.05, 0.95),
            boost_exponent: finite_or(self.boost_exponent, 0.7).clamp(0.1, 1.0),
            compression: finite_or(self.compression, 3.0).clamp(0.1, 20.0),
            expansion: finite_or(self.expansion, 0.0).clamp(0.0, 1.0),
            attack,
            release,
            band_gate: finite_or(self.band_gate, 0.04).clamp(0.0, 0.5),
            transient: self.transient.sanitized(),
        }
    }
}

/// Kick/transient detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransientConfig {
    /// Energy below this frequency feeds the detector.
    pub cutoff_hz: f32,
    pub fast_rate: f32,
    pub slow_rate: f32,
    pub noise_gate: f32,
    pub gain: f32,
    /// Context multiplier applied when the overall level is near silence.
    pub quiet_gain: f32,
    /// Context multiplier applied when the overall level is near full scale.
    pub loud_gain: f32,
    /// How much of the transient is added back onto the lowest bands.
    pub kick_emphasis: f32,
    pub attack: f32,
    pub release: f32,
}

impl Default for TransientConfig {
    fn default() -> Self {
        Self {
            cutoff_hz: 120.0,
            fast_rate: 0.55,
            slow_rate: 0.06,
            noise_gate: 0.03,
            gain: 4.0,
            quiet_gain: 0.35,
            loud_gain: 1.5,
            kick_emphasis: 0.35,
            attack: 0.9,
            release: 0.25,
        }
    }
}

impl TransientConfig {
    pub fn sanitized(&self) -> Self {
        let fast_rate = finite_or(self.fast_rate, 0.55).clamp(0.01, 1.0);
        let attack = finite_or(self.attack, 0.9).clamp(0.01, 1.0);
        Self {
            cutoff_hz: finite_or(self.cutoff_hz, 120.0).clamp(20.0, 1_000.0),
            fast_rate,
            slow_rate: finite_or(self.slow_rate, 0.06).clamp(0.001, fast_rate),
            noise_gate: finite_or(self.noise_gate, 0.03).clamp(0.0, 0.5),
            gain: finite_or(self.gain, 4.0).clamp(0.0, 32.0),
            quiet_gain: finite_or(self.quiet_gain, 0.35).clamp(0.0, 4.0),
            loud_gain: finite_or(self.loud_gain, 1.5).clamp(0.0, 4.0),
            kick_emphasis: finite_or(self.kick_emphasis, 0.35).clamp(0.0, 1.0),
            attack,
            release: finite_or(self.release, 0.25).clamp(0.01, 1.0).min(attack),
        }
    }
}

/// Quantization settings for the LED strip variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    pub segments: usize,
    pub brightness_levels: u32,
    /// Exponent applied to per-segment activation thresholds; values above 1
    /// let the centre segments light up earlier.
    pub activation_curve: f32,
    pub attack: f32,
    pub release: f32,
    pub transient_boost: f32,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            segments: 11,
            brightness_levels: 4,
            activation_curve: 1.6,
            attack: 0.8,
            release: 0.2,
            transient_boost: 0.3,
        }
    }
}

impl LedConfig {
    pub fn sanitized(&self) -> Self {
        let attack = finite_or(self.attack, 0.8).clamp(0.01, 1.0);
        Self {
            segments: self.segments.clamp(1, 256),
            brightness_levels: self.brightness_levels.clamp(1, 255),
            activation_curve: finite_or(self.activation_curve, 1.6).clamp(0.25, 4.0),
            attack,
            release: finite_or(self.release, 0.2).clamp(0.01, 1.0).min(attack),
            transient_boost: finite_or(self.transient_boost, 0.3).clamp(0.0, 1.0),
        }
    }
}

fn finite_or<T: Into<f64> + Copy>(value: T, fallback: T) -> T {
    if value.into().is_finite() {
        value
    } else {
        fallback
    }
}

/// Lock-protected settings shared with the rest of the application.
///
/// Readers always receive a sanitized snapshot copy, so a tick that reads the
/// configuration once observes a consistent set of values.
#[derive(Debug, Default)]
pub struct SettingsStore {
    current: Mutex<PlayerConfig>,
    observers: Observers<PlayerConfig>,
}

impl SettingsStore {
    pub fn new(config: PlayerConfig) -> Self {
        Self {
            current: Mutex::new(config.sanitized()),
            observers: Observers::new(),
        }
    }

    pub fn snapshot(&self) -> PlayerConfig {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn playback(&self) -> PlaybackConfig {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .playback
            .clone()
    }

    /// Applies `change` and notifies subscribers with the new snapshot.
    pub fn update<F>(&self, change: F) -> PlayerConfig
    where
        F: FnOnce(&mut PlayerConfig),
    {
        let updated = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            change(&mut current);
            *current = current.sanitized();
            current.clone()
        };
        self.observers.notify(&updated);
        updated
    }

    pub fn replace(&self, config: PlayerConfig) -> PlayerConfig {
        self.update(move |current| *current = config)
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&PlayerConfig) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.observers.unsubscribe(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[test]
    fn lookahead_is_clamped() {
        let config = PlaybackConfig {
            lookahead_ms: 900,
            ..Default::default()
        };
        assert_eq!(config.sanitized().lookahead_ms, MAX_LOOKAHEAD_MS);
        assert!((config.lookahead_secs() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn release_never_exceeds_attack() {
        let config = SpectrumConfig {
            attack: 0.2,
            release: 0.7,
            ..Default::default()
        }
        .sanitized();
        assert!(config.attack >= config.release);
    }

    #[test]
    fn degenerate_band_edges_fall_back_to_defaults() {
        let config = SpectrumConfig {
            band_edges_hz: vec![f32::NAN, 100.0],
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.band_edges_hz, SpectrumConfig::default().band_edges_hz);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config =
            PlayerConfig::from_json_str(r#"{"playback":{"repeat":"all","lookahead_ms":50}}"#)
                .unwrap();
        assert_eq!(config.playback.repeat, RepeatMode::All);
        assert_eq!(config.playback.lookahead_ms, 50);
        assert_eq!(config.analysis, AnalysisConfig::default());

        let encoded = config.to_json_string_pretty().unwrap();
        assert!(encoded.contains("\"all\""));
    }

    #[test]
    fn fft_size_is_rounded_to_power_of_two() {
        let config = AnalysisConfig {
            fft_size: 1000,
            buffer_capacity: 10,
            tick_hz: 60.0,
        }
        .sanitized();
        assert_eq!(config.fft_size, 1024);
        assert_eq!(config.buffer_capacity, 1024);
    }

    #[test]
    fn updates_notify_subscribers_with_sanitized_snapshot() {
        let store = SettingsStore::new(PlayerConfig::default());
        let seen = Arc::new(AtomicU32::new(0));
        let sink = Arc::clone(&seen);
        store.subscribe(move |config| {
            sink.store(config.playback.lookahead_ms, Ordering::SeqCst);
        });

        store.update(|config| config.playback.lookahead_ms = 5_000);
        assert_eq!(seen.load(Ordering::SeqCst), MAX_LOOKAHEAD_MS);
        assert_eq!(store.playback().lookahead_ms, MAX_LOOKAHEAD_MS);
    }
}
