//! Shared live-signal analysis.
//!
//! The playback output feeds a fixed-capacity [`SampleRing`] from its render
//! context. A periodic tick copies the most recent window out of the ring,
//! computes one magnitude spectrum and hands the same [`AnalysisFrame`] to
//! every registered consumer.

use std::{
    f32::consts::PI,
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{
    audio::{SignalTap, TapSource},
    config::AnalysisConfig,
    events::{Observers, SubscriptionToken},
    timeline::PeriodicTask,
    PlayerError, Result,
};

/// Handle returned by [`AnalysisHub::add_consumer`].
pub type ConsumerToken = SubscriptionToken;

/// One analysed window of the live output. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisFrame {
    pub sequence: u64,
    pub sample_rate: u32,
    pub fft_size: usize,
    /// `fft_size / 2 + 1` bins, scaled so a full-scale sine peaks near 1.0.
    pub magnitudes: Vec<f32>,
    pub rms: f32,
    pub peak: f32,
}

impl AnalysisFrame {
    /// Width of one bin in Hz.
    pub fn bin_hz(&self) -> f32 {
        if self.fft_size == 0 {
            0.0
        } else {
            self.sample_rate as f32 / self.fft_size as f32
        }
    }

    pub fn nyquist_hz(&self) -> f32 {
        self.sample_rate as f32 * 0.5
    }

    /// `true` when the frame can be fed to band processing.
    pub fn is_usable(&self) -> bool {
        self.sample_rate > 0
            && self.fft_size >= 2
            && self.magnitudes.len() == self.fft_size / 2 + 1
            && self.rms.is_finite()
            && self.peak.is_finite()
            && self.magnitudes.iter().all(|m| m.is_finite())
    }
}

/// Fixed-capacity circular buffer of mono samples.
///
/// Writes come from the render context and use `try_lock`: when the analysis
/// tick happens to hold the lock the block is dropped and counted instead of
/// waiting. The critical section is index arithmetic over a preallocated
/// slice.
pub struct SampleRing {
    state: Mutex<RingState>,
    sample_rate: AtomicU32,
    dropped: AtomicU64,
}

struct RingState {
    data: Box<[f32]>,
    write: usize,
    filled: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                data: vec![0.0; capacity.max(1)].into_boxed_slice(),
                write: 0,
                filled: 0,
            }),
            sample_rate: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().data.len()
    }

    pub fn len(&self) -> usize {
        self.lock().filled
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample rate of the most recent write, 0 before the first one.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Blocks dropped because the lock was busy.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Downmixes interleaved frames to mono and appends them.
    pub fn write_interleaved(&self, interleaved: &[f32], channels: u16, sample_rate: u32) {
        let width = usize::from(channels.max(1));
        let Ok(mut state) = self.state.try_lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        let scale = 1.0 / width as f32;
        let capacity = state.data.len();
        for frame in interleaved.chunks_exact(width) {
            let mono = frame.iter().sum::<f32>() * scale;
            let index = state.write;
            state.data[index] = mono;
            state.write = (index + 1) % capacity;
        }
        let frames = interleaved.len() / width;
        state.filled = (state.filled + frames).min(capacity);
    }

    /// Copies the newest `out.len()` samples, oldest first. Returns `false`
    /// without touching `out` when not enough samples have arrived yet.
    pub fn copy_latest(&self, out: &mut [f32]) -> bool {
        let state = self.lock();
        let wanted = out.len();
        let capacity = state.data.len();
        if wanted == 0 || wanted > state.filled || wanted > capacity {
            return false;
        }

        let start = (state.write + capacity - wanted) % capacity;
        let first = (capacity - start).min(wanted);
        out[..first].copy_from_slice(&state.data[start..start + first]);
        out[first..].copy_from_slice(&state.data[..wanted - first]);
        true
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.write = 0;
        state.filled = 0;
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SignalTap for SampleRing {
    fn push(&self, interleaved: &[f32], channels: u16, sample_rate: u32) {
        self.write_interleaved(interleaved, channels, sample_rate);
    }
}

impl fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.capacity())
            .field("filled", &self.len())
            .field("dropped", &self.dropped_writes())
            .finish()
    }
}

/// Reference-counted, shared FFT producer.
pub struct AnalysisHub {
    shared: Arc<HubShared>,
    source: Arc<dyn TapSource>,
    activation: Mutex<Activation>,
}

#[derive(Default)]
struct Activation {
    clients: usize,
    task: Option<PeriodicTask>,
}

struct HubShared {
    config: AnalysisConfig,
    ring: Arc<SampleRing>,
    consumers: Observers<Arc<AnalysisFrame>>,
    transform: Mutex<TransformState>,
    latest: Mutex<Option<Arc<AnalysisFrame>>>,
    transforms: AtomicU64,
    sequence: AtomicU64,
}

struct TransformState {
    window: Vec<f32>,
    samples: Vec<f32>,
    fft: Option<FftResources>,
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn plan(size: usize) -> Option<Self> {
        if size < 2 {
            return None;
        }

        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);
        let scratch = plan.make_scratch_vec();
        let spectrum = plan.make_output_vec();
        let input = plan.make_input_vec();
        Some(Self {
            size,
            plan,
            scratch,
            spectrum,
            input,
        })
    }
}

impl AnalysisHub {
    pub fn new(config: AnalysisConfig, source: Arc<dyn TapSource>) -> Self {
        let config = config.sanitized();
        let fft_size = config.fft_size;
        let window: Vec<f32> = (0..fft_size).map(|i| hann_value(i, fft_size)).collect();

        let shared = HubShared {
            ring: Arc::new(SampleRing::new(config.buffer_capacity)),
            consumers: Observers::new(),
            transform: Mutex::new(TransformState {
                window,
                samples: vec![0.0; fft_size],
                fft: FftResources::plan(fft_size),
            }),
            latest: Mutex::new(None),
            transforms: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            config,
        };

        Self {
            shared: Arc::new(shared),
            source,
            activation: Mutex::new(Activation::default()),
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.shared.config
    }

    /// The ring the tap writes into.
    pub fn tap(&self) -> Arc<SampleRing> {
        Arc::clone(&self.shared.ring)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.shared.config.tick_hz)
    }

    /// Registers one more client. The first client attaches the tap and
    /// starts the periodic tick.
    pub fn start(&self) -> Result<()> {
        let mut activation = self.lock_activation()?;
        activation.clients += 1;
        if activation.clients > 1 {
            return Ok(());
        }

        self.shared.ring.clear();
        self.source.attach_tap(self.tap());

        let shared = Arc::clone(&self.shared);
        match PeriodicTask::spawn("cadence-analysis", self.tick_interval(), move || {
            shared.tick();
        }) {
            Ok(task) => {
                activation.task = Some(task);
                tracing::debug!(
                    fft_size = self.shared.config.fft_size,
                    "analysis hub started"
                );
                Ok(())
            }
            Err(err) => {
                activation.clients = 0;
                self.source.detach_tap();
                Err(err)
            }
        }
    }

    /// Releases one client. The last client detaches the tap and halts the
    /// tick. Extra calls are ignored.
    pub fn stop(&self) -> Result<()> {
        let task = {
            let mut activation = self.lock_activation()?;
            match activation.clients {
                0 => return Ok(()),
                1 => {
                    activation.clients = 0;
                    self.source.detach_tap();
                    activation.task.take()
                }
                _ => {
                    activation.clients -= 1;
                    None
                }
            }
        };

        if let Some(mut task) = task {
            task.cancel();
            tracing::debug!("analysis hub stopped");
        }
        Ok(())
    }

    pub fn active_clients(&self) -> usize {
        self.activation
            .lock()
            .map(|activation| activation.clients)
            .unwrap_or(0)
    }

    pub fn is_active(&self) -> bool {
        self.active_clients() > 0
    }

    pub fn add_consumer<F>(&self, callback: F) -> ConsumerToken
    where
        F: Fn(&Arc<AnalysisFrame>) + Send + Sync + 'static,
    {
        self.shared.consumers.subscribe(callback)
    }

    pub fn remove_consumer(&self, token: ConsumerToken) -> bool {
        self.shared.consumers.unsubscribe(token)
    }

    pub fn consumer_count(&self) -> usize {
        self.shared.consumers.len()
    }

    /// Runs one analysis cycle. Returns `None` when the cycle was skipped.
    pub fn tick(&self) -> Option<Arc<AnalysisFrame>> {
        self.shared.tick()
    }

    pub fn latest_frame(&self) -> Option<Arc<AnalysisFrame>> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of spectra computed so far.
    pub fn transforms_computed(&self) -> u64 {
        self.shared.transforms.load(Ordering::Relaxed)
    }

    pub fn dropped_writes(&self) -> u64 {
        self.shared.ring.dropped_writes()
    }

    fn lock_activation(&self) -> Result<MutexGuard<'_, Activation>> {
        self.activation
            .lock()
            .map_err(|_| PlayerError::Poisoned("analysis activation"))
    }
}

impl HubShared {
    fn tick(&self) -> Option<Arc<AnalysisFrame>> {
        let frame = match self.compute_frame() {
            Ok(Some(frame)) => Arc::new(frame),
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(%err, "analysis tick skipped");
                return None;
            }
        };

        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&frame));
        let delivered = self.consumers.notify(&frame);
        tracing::trace!(sequence = frame.sequence, delivered, "analysis frame published");
        Some(frame)
    }

    fn compute_frame(&self) -> Result<Option<AnalysisFrame>> {
        let mut guard = self
            .transform
            .lock()
            .map_err(|_| PlayerError::Poisoned("analysis transform"))?;
        let state = &mut *guard;

        let Some(fft) = state.fft.as_mut() else {
            tracing::trace!("no transform available, skipping tick");
            return Ok(None);
        };
        if !self.ring.copy_latest(&mut state.samples) {
            tracing::trace!(filled = self.ring.len(), "not enough samples, skipping tick");
            return Ok(None);
        }

        let sample_rate = self.ring.sample_rate();
        if sample_rate == 0 {
            return Ok(None);
        }

        let rms = compute_rms(&state.samples);
        let peak = state
            .samples
            .iter()
            .fold(0.0_f32, |peak, sample| peak.max(sample.abs()));

        for ((input, sample), weight) in fft
            .input
            .iter_mut()
            .zip(&state.samples)
            .zip(&state.window)
        {
            *input = sample * weight;
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let window_sum: f32 = state.window.iter().sum();
        let scale = if window_sum > f32::EPSILON {
            2.0 / window_sum
        } else {
            0.0
        };
        let magnitudes = fft.spectrum.iter().map(|bin| bin.norm() * scale).collect();

        self.transforms.fetch_add(1, Ordering::Relaxed);
        Ok(Some(AnalysisFrame {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            sample_rate,
            fft_size: fft.size,
            magnitudes,
            rms,
            peak,
        }))
    }
}

impl Drop for AnalysisHub {
    fn drop(&mut self) {
        if let Ok(mut activation) = self.activation.lock() {
            if activation.clients > 0 {
                activation.clients = 0;
                self.source.detach_tap();
            }
            if let Some(mut task) = activation.task.take() {
                task.cancel();
            }
        }
    }
}

impl fmt::Debug for AnalysisHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisHub")
            .field("config", &self.shared.config)
            .field("clients", &self.active_clients())
            .field("consumers", &self.consumer_count())
            .field("transforms", &self.transforms_computed())
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
