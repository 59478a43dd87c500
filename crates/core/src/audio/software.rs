use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::{
    AudioOutput, CompletionHandler, SampleSource, ScheduledSegment, SchedulingToken, SignalTap,
};
use crate::{timeline::Clock, timeline::PeriodicTask, Result};

/// Frames copied to the tap per chunk.
const TAP_CHUNK_FRAMES: usize = 512;
/// Upper bound of frames handed to the tap per render pass; older backlog is
/// skipped.
const MAX_TAP_BACKLOG_FRAMES: u64 = 16_384;
/// Format of the silence rendered before the first segment is scheduled.
const IDLE_FORMAT: Format = Format {
    sample_rate: 48_000,
    channels: 1,
};

/// Clock-driven software transport.
///
/// Rendering progress is derived from an injected [`Clock`], which makes the
/// output deterministic under a manual clock. [`SoftwareOutput::render`]
/// pushes newly rendered samples to the attached tap, runs them through the
/// lookahead delay stage into the monitor and fires the completion handler
/// once the segment has played out. While nothing is playing the output
/// renders silence, so downstream analysis sees the signal go quiet.
pub struct SoftwareOutput {
    clock: Arc<dyn Clock>,
    state: Mutex<OutputState>,
    tap: Mutex<Option<Arc<dyn SignalTap>>>,
    monitor: Mutex<Option<Arc<dyn SignalTap>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Format {
    sample_rate: u32,
    channels: u16,
}

impl Format {
    fn of(source: &dyn SampleSource) -> Self {
        Self {
            sample_rate: source.sample_rate().max(1),
            channels: source.channels().max(1),
        }
    }

    fn width(self) -> usize {
        usize::from(self.channels)
    }

    fn frames_in(self, elapsed: Duration) -> u64 {
        (elapsed.as_secs_f64() * f64::from(self.sample_rate)) as u64
    }
}

struct OutputState {
    running: bool,
    volume: f32,
    lookahead: Duration,
    format: Format,
    delay: DelayLine,
    segment: Option<ActiveSegment>,
    idle: Option<IdleSpan>,
    scratch: Vec<f32>,
}

impl OutputState {
    fn go_idle(&mut self, now: Duration) {
        if self.idle.is_none() {
            self.idle = Some(IdleSpan {
                since: now,
                delivered: 0,
            });
        }
    }

    fn reformat(&mut self, format: Format) {
        if self.format != format || self.scratch.is_empty() {
            self.format = format;
            self.scratch = vec![0.0; TAP_CHUNK_FRAMES * format.width()];
            self.delay = DelayLine::new(self.lookahead, format);
        }
    }
}

/// Silence rendered since the transport went quiet.
struct IdleSpan {
    since: Duration,
    delivered: u64,
}

struct ActiveSegment {
    source: Arc<dyn SampleSource>,
    start_frame: u64,
    token: SchedulingToken,
    on_complete: Option<CompletionHandler>,
    rendered_base: u64,
    resumed_at: Option<Duration>,
    delivered: u64,
}

impl ActiveSegment {
    fn remaining(&self) -> u64 {
        self.source.frame_count().saturating_sub(self.start_frame)
    }

    fn rendered(&self, now: Duration) -> u64 {
        let running = self
            .resumed_at
            .map(|at| {
                let elapsed = now.saturating_sub(at).as_secs_f64();
                (elapsed * f64::from(self.source.sample_rate())) as u64
            })
            .unwrap_or(0);
        (self.rendered_base + running).min(self.remaining())
    }

    /// `true` while the player node still has frames to render.
    fn is_live(&self) -> bool {
        self.resumed_at.is_some() && self.on_complete.is_some()
    }
}

/// Fixed delay between the tap and the audible output.
struct DelayLine {
    buffer: Vec<f32>,
    cursor: usize,
}

impl DelayLine {
    fn new(lookahead: Duration, format: Format) -> Self {
        let frames = usize::try_from(format.frames_in(lookahead)).unwrap_or(0);
        Self {
            buffer: vec![0.0; frames * format.width()],
            cursor: 0,
        }
    }

    fn frames(&self, format: Format) -> usize {
        self.buffer.len() / format.width()
    }

    /// Replaces every sample with the one written `len` samples earlier.
    fn process(&mut self, samples: &mut [f32]) {
        if self.buffer.is_empty() {
            return;
        }
        for sample in samples {
            std::mem::swap(sample, &mut self.buffer[self.cursor]);
            self.cursor = (self.cursor + 1) % self.buffer.len();
        }
    }
}

/// Where one render pass sends its samples.
struct Sinks {
    tap: Option<Arc<dyn SignalTap>>,
    monitor: Option<Arc<dyn SignalTap>>,
}

impl Sinks {
    fn is_empty(&self) -> bool {
        self.tap.is_none() && self.monitor.is_none()
    }

    fn emit(&self, samples: &mut [f32], format: Format, delay: &mut DelayLine) {
        if let Some(tap) = self.tap.as_deref() {
            tap.push(samples, format.channels, format.sample_rate);
        }
        delay.process(samples);
        if let Some(monitor) = self.monitor.as_deref() {
            monitor.push(samples, format.channels, format.sample_rate);
        }
    }
}

impl SoftwareOutput {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(OutputState {
                running: false,
                volume: 1.0,
                lookahead: Duration::ZERO,
                format: IDLE_FORMAT,
                delay: DelayLine::new(Duration::ZERO, IDLE_FORMAT),
                segment: None,
                idle: None,
                scratch: vec![0.0; TAP_CHUNK_FRAMES * IDLE_FORMAT.width()],
            }),
            tap: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    pub fn volume(&self) -> f32 {
        self.lock_state().volume
    }

    pub fn lookahead(&self) -> Duration {
        self.lock_state().lookahead
    }

    /// Frames the delay stage currently holds back.
    pub fn delay_frames(&self) -> usize {
        let state = self.lock_state();
        state.delay.frames(state.format)
    }

    /// Receives the delayed, audible signal.
    pub fn attach_monitor(&self, monitor: Arc<dyn SignalTap>) {
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);
    }

    pub fn detach_monitor(&self) {
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Advances the render cursor to the clock's current time. Returns the
    /// token of a segment that completed during this pass.
    pub fn render(&self) -> Option<SchedulingToken> {
        let sinks = Sinks {
            tap: self
                .tap
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            monitor: self
                .monitor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        let now = self.clock.now();

        let completion = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if !state.running {
                return None;
            }

            match state.segment.as_mut().filter(|segment| segment.is_live()) {
                Some(segment) => {
                    let rendered = segment.rendered(now);
                    render_segment(
                        segment,
                        rendered,
                        state.volume,
                        state.format,
                        &mut state.scratch,
                        &mut state.delay,
                        &sinks,
                    );

                    if rendered >= segment.remaining() {
                        let completed = segment
                            .on_complete
                            .take()
                            .map(|handler| (segment.token, handler));
                        state.go_idle(now);
                        completed
                    } else {
                        None
                    }
                }
                None => {
                    state.go_idle(now);
                    render_silence(state, now, &sinks);
                    None
                }
            }
        };

        completion.map(|(token, handler)| {
            tracing::trace!(%token, "software output segment completed");
            handler(token);
            token
        })
    }

    /// Runs [`SoftwareOutput::render`] on a background task.
    pub fn spawn_render_loop(self: &Arc<Self>, interval: Duration) -> Result<PeriodicTask> {
        let output = Arc::clone(self);
        PeriodicTask::spawn("cadence-render", interval, move || {
            output.render();
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn render_segment(
    segment: &mut ActiveSegment,
    rendered: u64,
    volume: f32,
    format: Format,
    scratch: &mut [f32],
    delay: &mut DelayLine,
    sinks: &Sinks,
) {
    if sinks.is_empty() {
        segment.delivered = rendered;
        return;
    }
    if rendered.saturating_sub(segment.delivered) > MAX_TAP_BACKLOG_FRAMES {
        segment.delivered = rendered - MAX_TAP_BACKLOG_FRAMES;
    }

    let width = format.width();
    let chunk_frames = scratch.len() / width;
    if chunk_frames == 0 {
        segment.delivered = rendered;
        return;
    }

    while segment.delivered < rendered {
        let wanted = usize::try_from(rendered - segment.delivered)
            .unwrap_or(usize::MAX)
            .min(chunk_frames);
        let buffer = &mut scratch[..wanted * width];
        let read = segment
            .source
            .read_frames(segment.start_frame + segment.delivered, buffer);
        if read == 0 {
            segment.delivered = rendered;
            break;
        }

        let samples = &mut buffer[..read * width];
        if volume < 1.0 {
            samples.iter_mut().for_each(|sample| *sample *= volume);
        }
        sinks.emit(samples, format, delay);
        segment.delivered += read as u64;
    }
}

fn render_silence(state: &mut OutputState, now: Duration, sinks: &Sinks) {
    let OutputState {
        format,
        delay,
        idle,
        scratch,
        ..
    } = state;
    let Some(idle) = idle.as_mut() else {
        return;
    };

    let due = format.frames_in(now.saturating_sub(idle.since));
    if sinks.is_empty() {
        idle.delivered = due;
        return;
    }
    if due.saturating_sub(idle.delivered) > MAX_TAP_BACKLOG_FRAMES {
        idle.delivered = due - MAX_TAP_BACKLOG_FRAMES;
    }

    let width = format.width();
    let chunk_frames = scratch.len() / width;
    while idle.delivered < due && chunk_frames > 0 {
        let frames = usize::try_from(due - idle.delivered)
            .unwrap_or(usize::MAX)
            .min(chunk_frames);
        let samples = &mut scratch[..frames * width];
        samples.fill(0.0);
        sinks.emit(samples, *format, delay);
        idle.delivered += frames as u64;
    }
}

impl AudioOutput for SoftwareOutput {
    fn start(&self) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock_state();
        if !state.running {
            state.running = true;
            if state.segment.is_none() {
                state.go_idle(now);
            }
            tracing::debug!("software output started");
        }
        Ok(())
    }

    fn schedule(&self, segment: ScheduledSegment) -> Result<()> {
        let ScheduledSegment {
            source,
            start_frame,
            token,
            on_complete,
        } = segment;

        let now = self.clock.now();
        let mut state = self.lock_state();
        state.reformat(Format::of(source.as_ref()));
        state.idle = None;
        state.segment = Some(ActiveSegment {
            source,
            start_frame,
            token,
            on_complete: Some(on_complete),
            rendered_base: 0,
            resumed_at: Some(now),
            delivered: 0,
        });
        Ok(())
    }

    fn pause(&self) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        if let Some(segment) = state.segment.as_mut() {
            if segment.resumed_at.is_some() {
                segment.rendered_base = segment.rendered(now);
                segment.resumed_at = None;
            }
        }
        state.go_idle(now);
    }

    fn stop(&self) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.segment = None;
        state.go_idle(now);
    }

    fn rendered_frames(&self) -> Option<u64> {
        let now = self.clock.now();
        self.lock_state()
            .segment
            .as_ref()
            .map(|segment| segment.rendered(now))
    }

    fn set_volume(&self, volume: f32) {
        self.lock_state().volume = volume.clamp(0.0, 1.0);
    }

    fn set_lookahead(&self, lookahead: Duration) {
        let mut state = self.lock_state();
        if state.lookahead != lookahead {
            state.lookahead = lookahead;
            state.delay = DelayLine::new(lookahead, state.format);
        }
    }

    fn attach_tap(&self, tap: Arc<dyn SignalTap>) {
        *self.tap.lock().unwrap_or_else(PoisonError::into_inner) = Some(tap);
    }

    fn detach_tap(&self) {
        *self.tap.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Debug for SoftwareOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("SoftwareOutput")
            .field("running", &state.running)
            .field("volume", &state.volume)
            .field("lookahead", &state.lookahead)
            .field("delay_frames", &state.delay.frames(state.format))
            .field("scheduled", &state.segment.is_some())
            .finish()
    }
}
