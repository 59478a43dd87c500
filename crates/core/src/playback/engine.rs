use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use super::{
    queue::{Queue, Reanchor},
    state::{PlaybackEvent, PlaybackSnapshot, TransportState},
};
use crate::{
    audio::{
        AudioOutput, CompletionHandler, SampleSource, ScheduledSegment, SchedulingToken, TapPoint,
    },
    config::{PlaybackConfig, RepeatMode, SettingsStore},
    events::{Observers, SubscriptionToken},
    library::{Track, TrackId, TrackResolver},
    shuffle::ShuffleQueueManager,
    timeline::{Clock, PeriodicTask},
    PlayerError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    Next,
    Previous,
    Completed,
}

/// The track currently owned by the transport.
struct Session {
    track_id: TrackId,
    source: Arc<dyn SampleSource>,
    duration: f64,
    /// Source frame the active segment was scheduled from.
    start_frame: u64,
    /// Position reported while the transport clock is not running.
    held_position: f64,
}

impl Session {
    fn sample_rate(&self) -> f64 {
        f64::from(self.source.sample_rate().max(1))
    }

    /// Frame for `seconds`, bounded to `[0, frame_count)`.
    fn frame_at(&self, seconds: f64) -> u64 {
        let seconds = if seconds.is_finite() {
            seconds.clamp(0.0, self.duration)
        } else {
            0.0
        };
        let last = self.source.frame_count().saturating_sub(1);
        ((seconds * self.sample_rate()) as u64).min(last)
    }

    fn seconds_at(&self, frame: u64) -> f64 {
        frame as f64 / self.sample_rate()
    }
}

struct EngineState {
    transport: TransportState,
    queue: Queue,
    shuffle: ShuffleQueueManager,
    session: Option<Session>,
    issued_tokens: u64,
    active_token: Option<SchedulingToken>,
    drain_started: Option<Duration>,
    settings: PlaybackConfig,
}

struct Shared {
    state: Mutex<EngineState>,
    output: Arc<dyn AudioOutput>,
    resolver: Arc<dyn TrackResolver>,
    settings: Arc<SettingsStore>,
    clock: Arc<dyn Clock>,
    observers: Observers<PlaybackEvent>,
    settings_token: SubscriptionToken,
}

/// Owns the transport and the queue.
///
/// Cheap to clone; clones drive the same engine. Automatic advance after a
/// segment's lookahead drain happens on [`PlaybackEngine::tick`], which
/// [`PlaybackEngine::start_position_updates`] runs periodically.
#[derive(Clone)]
pub struct PlaybackEngine {
    shared: Arc<Shared>,
}

impl PlaybackEngine {
    pub fn new(
        output: Arc<dyn AudioOutput>,
        resolver: Arc<dyn TrackResolver>,
        settings: Arc<SettingsStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let playback = settings.playback();
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let listener = weak.clone();
            let settings_token = settings.subscribe(move |_| {
                if let Some(shared) = listener.upgrade() {
                    if let Err(err) = shared.apply_settings() {
                        tracing::warn!(error = %err, "failed to apply playback settings");
                    }
                }
            });

            Shared {
                state: Mutex::new(EngineState {
                    transport: TransportState::Idle,
                    queue: Queue::default(),
                    shuffle: ShuffleQueueManager::new(playback.shuffle_history_limit),
                    session: None,
                    issued_tokens: 0,
                    active_token: None,
                    drain_started: None,
                    settings: PlaybackConfig {
                        shuffle: false,
                        ..playback.clone()
                    },
                }),
                output,
                resolver,
                settings: Arc::clone(&settings),
                clock,
                observers: Observers::new(),
                settings_token,
            }
        });

        if let Err(err) = shared.apply_settings() {
            tracing::warn!(error = %err, "failed to apply initial playback settings");
        }
        Self { shared }
    }

    /// Replaces the queue with `track` and starts it.
    pub fn play(&self, track: Track) -> Result<()> {
        self.shared.run(|t| t.play(track))
    }

    /// Replaces the queue and starts at `start_index`; out of range is a
    /// no-op.
    pub fn play_queue(&self, tracks: Vec<Track>, start_index: usize) -> Result<()> {
        self.shared.run(|t| t.play_queue(tracks, start_index))
    }

    /// Swaps the queue contents while keeping the current track playing.
    pub fn update_queue_tracks(&self, tracks: Vec<Track>) -> Result<()> {
        self.shared.run(|t| {
            t.update_queue_tracks(tracks);
            Ok(())
        })
    }

    pub fn pause(&self) -> Result<()> {
        self.shared.run(|t| {
            t.pause();
            Ok(())
        })
    }

    pub fn resume(&self) -> Result<()> {
        self.shared.run(|t| t.resume())
    }

    pub fn toggle_play_pause(&self) -> Result<()> {
        self.shared.run(|t| match t.state.transport {
            TransportState::Playing => {
                t.pause();
                Ok(())
            }
            TransportState::Paused => t.resume(),
            _ => Ok(()),
        })
    }

    /// Tears down the active segment and resets position and duration.
    pub fn stop(&self, clear_queue: bool) -> Result<()> {
        self.shared.run(|t| {
            t.stop(clear_queue);
            Ok(())
        })
    }

    pub fn seek(&self, seconds: f64) -> Result<()> {
        self.shared.run(|t| t.seek(seconds))
    }

    pub fn next(&self) -> Result<()> {
        self.shared.run(|t| t.advance(Advance::Next))
    }

    /// Restarts the current track once it has played past the configured
    /// threshold, otherwise steps back.
    pub fn previous(&self) -> Result<()> {
        self.shared.run(|t| t.previous())
    }

    /// Plays queue entry `index`; out of range is a no-op.
    pub fn jump_to(&self, index: usize) -> Result<()> {
        self.shared.run(|t| t.jump_to(index))
    }

    /// Stores the volume in the settings, which re-applies it to the output.
    pub fn set_volume(&self, volume: f32) {
        self.shared
            .settings
            .update(|config| config.playback.volume = volume);
    }

    /// Re-reads the playback settings. Runs automatically on every settings
    /// update.
    pub fn apply_settings(&self) -> Result<()> {
        self.shared.apply_settings()
    }

    pub fn snapshot(&self) -> Result<PlaybackSnapshot> {
        self.shared.run(|t| Ok(t.snapshot()))
    }

    pub fn queue_tracks(&self) -> Result<Vec<Track>> {
        self.shared.run(|t| Ok(t.state.queue.tracks().to_vec()))
    }

    /// Finishes an elapsed lookahead drain, then samples the audible
    /// position and publishes it while audio is audible.
    pub fn tick(&self) -> Result<PlaybackSnapshot> {
        self.shared.tick()
    }

    /// Runs [`PlaybackEngine::tick`] every `position_interval_ms`. The task
    /// only holds a weak reference to the engine.
    pub fn start_position_updates(&self) -> Result<PeriodicTask> {
        let interval = Duration::from_millis(self.shared.settings.playback().position_interval_ms);
        let weak = Arc::downgrade(&self.shared);
        PeriodicTask::spawn("cadence-position", interval, move || {
            if let Some(shared) = weak.upgrade() {
                if let Err(err) = shared.tick() {
                    tracing::debug!(error = %err, "position tick failed");
                }
            }
        })
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&PlaybackEvent) + Send + Sync + 'static,
    {
        self.shared.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.shared.observers.unsubscribe(token)
    }

    /// Where the analysis hub attaches to the live output signal.
    pub fn tap_point(&self) -> TapPoint {
        TapPoint::new(Arc::clone(&self.shared.output))
    }
}

impl fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("subscribers", &self.shared.observers.len())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| PlayerError::Poisoned("playback state"))
    }

    /// Runs `op` under the engine lock and publishes the events it produced
    /// once the lock is released.
    fn run<R>(self: &Arc<Self>, op: impl FnOnce(&mut Transition<'_>) -> Result<R>) -> Result<R> {
        let mut transition = Transition {
            shared: self,
            state: self.lock()?,
            events: Vec::new(),
        };
        let result = op(&mut transition);

        let Transition { state, events, .. } = transition;
        drop(state);
        for event in &events {
            self.observers.notify(event);
        }
        result
    }

    fn apply_settings(self: &Arc<Self>) -> Result<()> {
        let playback = self.settings.playback();
        self.run(|t| {
            t.apply(playback);
            Ok(())
        })
    }

    fn tick(self: &Arc<Self>) -> Result<PlaybackSnapshot> {
        self.run(|t| {
            t.finish_elapsed_drain()?;
            let snapshot = t.snapshot();
            if snapshot.is_playing {
                t.emit(PlaybackEvent::PositionChanged {
                    current_time: snapshot.current_time,
                    duration: snapshot.duration,
                });
            }
            Ok(snapshot)
        })
    }

    fn completion_handler(self: &Arc<Self>) -> CompletionHandler {
        let weak = Arc::downgrade(self);
        Box::new(move |token| {
            if let Some(shared) = weak.upgrade() {
                shared.segment_completed(token);
            }
        })
    }

    fn segment_completed(self: &Arc<Self>, token: SchedulingToken) {
        if let Err(err) = self.run(|t| t.complete(token)) {
            tracing::warn!(%token, error = %err, "automatic advance failed");
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.settings.unsubscribe(self.settings_token);
        self.output.stop();
    }
}

/// One serialized mutation of the engine state.
struct Transition<'a> {
    shared: &'a Arc<Shared>,
    state: MutexGuard<'a, EngineState>,
    events: Vec<PlaybackEvent>,
}

impl Transition<'_> {
    fn emit(&mut self, event: PlaybackEvent) {
        self.events.push(event);
    }

    fn set_transport(&mut self, next: TransportState) {
        let previous = self.state.transport;
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "transport state changed");
            self.state.transport = next;
            self.emit(PlaybackEvent::StateChanged {
                state: next,
                is_playing: next.is_audible(),
            });
        }
    }

    fn queue_changed(&mut self) {
        let event = PlaybackEvent::QueueChanged {
            len: self.state.queue.len(),
            index: self.state.queue.index(),
        };
        self.emit(event);
    }

    fn lookahead(&self) -> Duration {
        Duration::from_millis(u64::from(self.state.settings.lookahead_ms))
    }

    /// Forgets the active token and any pending drain, so completions of
    /// everything scheduled so far are ignored.
    fn invalidate(&mut self) {
        if let Some(token) = self.state.active_token.take() {
            tracing::trace!(%token, "scheduling token invalidated");
        }
        self.state.drain_started = None;
    }

    fn issue_token(&mut self) -> SchedulingToken {
        self.state.issued_tokens += 1;
        SchedulingToken::from_raw(self.state.issued_tokens)
    }

    fn position(&self) -> f64 {
        let Some(session) = self.state.session.as_ref() else {
            return 0.0;
        };
        let lookahead = self.lookahead().as_secs_f64();

        let position = match self.state.transport {
            TransportState::Playing => {
                let rendered = self.shared.output.rendered_frames().unwrap_or(0);
                session.seconds_at(session.start_frame + rendered) - lookahead
            }
            TransportState::Draining => {
                let elapsed = self
                    .state
                    .drain_started
                    .map(|started| self.shared.clock.now().saturating_sub(started).as_secs_f64())
                    .unwrap_or(lookahead);
                session.duration - lookahead + elapsed
            }
            _ => session.held_position,
        };
        position.clamp(0.0, session.duration.max(0.0))
    }

    fn snapshot(&self) -> PlaybackSnapshot {
        let session = self.state.session.as_ref();
        PlaybackSnapshot {
            state: self.state.transport,
            is_playing: self.state.transport.is_audible(),
            current_time: self.position(),
            duration: session.map_or(0.0, |session| session.duration),
            current_track_id: session.map(|session| session.track_id.clone()),
            queue_index: self.state.queue.index(),
            queue_len: self.state.queue.len(),
        }
    }

    fn apply(&mut self, playback: PlaybackConfig) {
        self.shared.output.set_volume(playback.volume);
        self.shared
            .output
            .set_lookahead(Duration::from_millis(u64::from(playback.lookahead_ms)));
        self.state
            .shuffle
            .set_history_limit(playback.shuffle_history_limit);

        let shuffle_enabled = playback.shuffle && !self.state.settings.shuffle;
        self.state.settings = playback;
        if shuffle_enabled {
            let ids = self.state.queue.ids();
            let current = self.state.queue.current().map(|track| track.id.clone());
            self.state.shuffle.rebuild(&ids, current.as_ref(), false);
        }
    }

    /// Reuses the session's source when `track` is already loaded.
    fn source_for(&self, track: &Track) -> Result<Arc<dyn SampleSource>> {
        if let Some(session) = self
            .state
            .session
            .as_ref()
            .filter(|session| session.track_id == track.id)
        {
            return Ok(Arc::clone(&session.source));
        }
        self.shared.resolver.resolve(track)
    }

    fn unavailable(&mut self, track: &TrackId, err: &PlayerError) {
        tracing::warn!(%track, error = %err, "track source unavailable");
        self.emit(PlaybackEvent::TrackUnavailable {
            track: track.clone(),
        });
    }

    fn play(&mut self, track: Track) -> Result<()> {
        let source = match self.source_for(&track) {
            Ok(source) => source,
            Err(err) => {
                self.unavailable(&track.id, &err);
                return Ok(());
            }
        };

        self.state
            .shuffle
            .rebuild(std::slice::from_ref(&track.id), Some(&track.id), true);
        self.state.queue = Queue::single(track.clone());
        self.queue_changed();
        self.start(&track, source, 0)
    }

    fn play_queue(&mut self, tracks: Vec<Track>, start_index: usize) -> Result<()> {
        let Some(queue) = Queue::new(tracks, start_index) else {
            tracing::debug!(start_index, "queue start index out of range");
            return Ok(());
        };
        let Some(track) = queue.current().cloned() else {
            return Ok(());
        };

        let source = match self.source_for(&track) {
            Ok(source) => source,
            Err(err) => {
                self.unavailable(&track.id, &err);
                return Ok(());
            }
        };

        self.state
            .shuffle
            .rebuild(&queue.ids(), Some(&track.id), true);
        self.state.queue = queue;
        self.queue_changed();
        self.start(&track, source, 0)
    }

    fn update_queue_tracks(&mut self, tracks: Vec<Track>) {
        if tracks.is_empty() {
            self.stop(true);
            return;
        }

        let current = self.heard_track();
        let outcome = self.state.queue.replace_tracks(tracks, current.as_ref());
        let ids = self.state.queue.ids();
        match outcome {
            Reanchor::Kept(_) => self.state.shuffle.rebuild(&ids, current.as_ref(), false),
            Reanchor::Clamped(_) | Reanchor::Emptied => {
                let anchor = self.state.queue.current().map(|track| track.id.clone());
                self.state.shuffle.rebuild(&ids, anchor.as_ref(), true);
            }
        }
        tracing::debug!(?outcome, len = ids.len(), "queue contents replaced");
        self.queue_changed();
    }

    /// Schedules `source` from `start_frame` as the new session.
    fn start(
        &mut self,
        track: &Track,
        source: Arc<dyn SampleSource>,
        start_frame: u64,
    ) -> Result<()> {
        self.invalidate();
        self.shared.output.stop();

        let track_changed = self
            .state
            .session
            .as_ref()
            .map_or(true, |session| session.track_id != track.id);
        let duration = match source.duration_secs() {
            measured if measured > 0.0 => measured,
            _ => track.duration_secs.max(0.0),
        };

        let mut session = Session {
            track_id: track.id.clone(),
            source: Arc::clone(&source),
            duration,
            start_frame,
            held_position: 0.0,
        };
        session.held_position = session.seconds_at(start_frame).min(duration);
        self.state.session = Some(session);
        self.set_transport(TransportState::Loading);

        if let Err(err) = self.schedule(source, start_frame) {
            return self.abort(err);
        }

        if track_changed {
            self.emit(PlaybackEvent::TrackChanged {
                track: Some(track.id.clone()),
                duration,
            });
        }
        tracing::debug!(track = %track.id, start_frame, duration, "playback started");
        self.set_transport(TransportState::Playing);
        Ok(())
    }

    fn schedule(&mut self, source: Arc<dyn SampleSource>, start_frame: u64) -> Result<()> {
        self.shared.output.start()?;

        let token = self.issue_token();
        self.state.active_token = Some(token);
        let scheduled = self.shared.output.schedule(ScheduledSegment {
            source,
            start_frame,
            token,
            on_complete: self.shared.completion_handler(),
        });
        if scheduled.is_err() {
            self.state.active_token = None;
        }
        scheduled?;

        tracing::trace!(%token, start_frame, "segment scheduled");
        Ok(())
    }

    /// Releases the session after the audio graph refused to start.
    fn abort(&mut self, err: PlayerError) -> Result<()> {
        tracing::warn!(error = %err, "audio graph failed to start");
        self.invalidate();
        self.shared.output.stop();
        let had_session = self.state.session.take().is_some();
        self.set_transport(TransportState::Idle);
        if had_session {
            self.emit(PlaybackEvent::TrackChanged {
                track: None,
                duration: 0.0,
            });
        }
        Err(err)
    }

    fn pause(&mut self) {
        if self.state.transport != TransportState::Playing {
            return;
        }

        let position = self.position();
        self.invalidate();
        self.shared.output.pause();
        let duration = match self.state.session.as_mut() {
            Some(session) => {
                session.held_position = position;
                session.duration
            }
            None => 0.0,
        };
        self.set_transport(TransportState::Paused);
        self.emit(PlaybackEvent::PositionChanged {
            current_time: position,
            duration,
        });
    }

    fn resume(&mut self) -> Result<()> {
        if self.state.transport != TransportState::Paused {
            return Ok(());
        }
        let Some(session) = self.state.session.as_mut() else {
            return Ok(());
        };

        let frame = session.frame_at(session.held_position);
        session.start_frame = frame;
        let source = Arc::clone(&session.source);

        if let Err(err) = self.schedule(source, frame) {
            return self.abort(err);
        }
        self.set_transport(TransportState::Playing);
        Ok(())
    }

    fn stop(&mut self, clear_queue: bool) {
        self.invalidate();
        self.shared.output.stop();

        let had_session = self.state.session.take().is_some();
        self.set_transport(TransportState::Stopped);
        if had_session {
            self.emit(PlaybackEvent::TrackChanged {
                track: None,
                duration: 0.0,
            });
            self.emit(PlaybackEvent::PositionChanged {
                current_time: 0.0,
                duration: 0.0,
            });
        }

        if clear_queue && !self.state.queue.is_empty() {
            self.state.queue.clear();
            self.state.shuffle.rebuild(&[], None, true);
            self.queue_changed();
        }
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        let transport = self.state.transport;
        let Some(session) = self.state.session.as_mut() else {
            return Ok(());
        };
        let frame = session.frame_at(seconds);
        let target = session.seconds_at(frame);
        let duration = session.duration;

        match transport {
            TransportState::Playing | TransportState::Draining => {
                session.start_frame = frame;
                let source = Arc::clone(&session.source);
                self.invalidate();
                if let Err(err) = self.schedule(source, frame) {
                    return self.abort(err);
                }
                self.set_transport(TransportState::Playing);
            }
            TransportState::Paused => {
                session.start_frame = frame;
                session.held_position = target;
                self.invalidate();
            }
            _ => return Ok(()),
        }

        tracing::debug!(target, frame, "seek");
        let current_time = self.position();
        self.emit(PlaybackEvent::PositionChanged {
            current_time,
            duration,
        });
        Ok(())
    }

    fn previous(&mut self) -> Result<()> {
        if self.state.queue.is_empty() {
            return Ok(());
        }

        let threshold = self.state.settings.previous_restart_threshold_secs;
        let active = matches!(
            self.state.transport,
            TransportState::Playing | TransportState::Paused | TransportState::Draining
        );
        if active && self.position() > threshold {
            if let Some(session) = self.state.session.as_ref() {
                let track = Track::new(session.track_id.clone(), session.duration);
                let source = Arc::clone(&session.source);
                tracing::debug!(track = %track.id, "restarting current track");
                return self.start(&track, source, 0);
            }
        }

        self.advance(Advance::Previous)
    }

    fn jump_to(&mut self, index: usize) -> Result<()> {
        let Some(track) = self.state.queue.get(index).cloned() else {
            return Ok(());
        };

        let source = match self.source_for(&track) {
            Ok(source) => source,
            Err(err) => {
                self.unavailable(&track.id, &err);
                return Ok(());
            }
        };

        let departed = self.heard_track();
        self.state.shuffle.record_jump(departed.as_ref(), &track.id);
        self.state.queue.set_index(index);
        self.queue_changed();
        self.start(&track, source, 0)
    }

    /// The track the listener is hearing. After a queue edit removed it, the
    /// queue's current entry is only a placeholder that was never played.
    fn heard_track(&self) -> Option<TrackId> {
        self.state
            .session
            .as_ref()
            .map(|session| session.track_id.clone())
            .or_else(|| self.state.queue.current().map(|track| track.id.clone()))
    }

    /// Index the advance policy selects, or `None` when a linear queue runs
    /// out of tracks.
    fn target(&mut self, advance: Advance) -> Option<usize> {
        let index = self.state.queue.index()?;
        let repeat = self.state.settings.repeat;

        if advance == Advance::Completed && repeat == RepeatMode::One {
            return Some(index);
        }

        if self.state.settings.shuffle {
            let picked = match advance {
                Advance::Previous => self.state.shuffle.previous_id(),
                Advance::Next | Advance::Completed => {
                    let current = self.heard_track()?;
                    self.state.shuffle.next_id(&current)
                }
            };
            let target = picked
                .and_then(|id| self.state.queue.position_of(&id))
                .unwrap_or(index);

            // A one-track shuffle has nowhere to go once it finishes.
            if advance == Advance::Completed && target == index && repeat == RepeatMode::Off {
                return None;
            }
            return Some(target);
        }

        let wrap = repeat == RepeatMode::All;
        match advance {
            Advance::Previous => self.state.queue.preceding(wrap),
            Advance::Next | Advance::Completed => self.state.queue.following(wrap),
        }
    }

    fn advance(&mut self, advance: Advance) -> Result<()> {
        if self.state.queue.is_empty() {
            return Ok(());
        }

        let saved_shuffle = self.state.shuffle.clone();
        let Some(index) = self.target(advance) else {
            self.end_of_queue();
            return Ok(());
        };
        let Some(track) = self.state.queue.get(index).cloned() else {
            return Ok(());
        };

        let source = match self.source_for(&track) {
            Ok(source) => source,
            Err(err) => {
                self.unavailable(&track.id, &err);
                if advance == Advance::Completed {
                    self.end_of_queue();
                } else {
                    self.state.shuffle = saved_shuffle;
                }
                return Ok(());
            }
        };

        if self.state.queue.index() != Some(index) {
            self.state.queue.set_index(index);
            self.queue_changed();
        }
        tracing::debug!(?advance, index, track = %track.id, "advancing");
        self.start(&track, source, 0)
    }

    /// Stops at the end of the finished track, position pinned to its
    /// duration.
    fn end_of_queue(&mut self) {
        self.invalidate();
        self.shared.output.stop();

        let duration = match self.state.session.as_mut() {
            Some(session) => {
                session.held_position = session.duration;
                session.duration
            }
            None => 0.0,
        };
        tracing::debug!("end of queue");
        self.set_transport(TransportState::Idle);
        self.emit(PlaybackEvent::PositionChanged {
            current_time: duration,
            duration,
        });
    }

    fn complete(&mut self, token: SchedulingToken) -> Result<()> {
        if self.state.active_token != Some(token)
            || self.state.transport != TransportState::Playing
        {
            tracing::trace!(%token, "stale completion ignored");
            return Ok(());
        }

        self.state.active_token = None;
        if self.lookahead().is_zero() {
            return self.advance(Advance::Completed);
        }

        self.state.drain_started = Some(self.shared.clock.now());
        self.set_transport(TransportState::Draining);
        Ok(())
    }

    fn finish_elapsed_drain(&mut self) -> Result<()> {
        let Some(started) = self.state.drain_started else {
            return Ok(());
        };
        if self.shared.clock.now().saturating_sub(started) < self.lookahead() {
            return Ok(());
        }

        self.state.drain_started = None;
        tracing::trace!("lookahead drain finished");
        self.advance(Advance::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{AnalysisFrame, AnalysisHub, SampleRing},
        audio::{scripted::ScriptedOutput, AudioOutput, BufferSource, SoftwareOutput, TapSource},
        config::{AnalysisConfig, LedConfig, PlayerConfig, SpectrumConfig},
        library::TrackStore,
        spectrum::LedProcessor,
        timeline::ManualClock,
    };
    use approx::assert_abs_diff_eq;

    struct Rig {
        engine: PlaybackEngine,
        output: Arc<ScriptedOutput>,
        store: Arc<TrackStore>,
        settings: Arc<SettingsStore>,
        clock: ManualClock,
        tracks: Vec<Track>,
        events: Arc<Mutex<Vec<PlaybackEvent>>>,
    }

    impl Rig {
        fn new(playback: PlaybackConfig, names: &[&str]) -> Self {
            let output = ScriptedOutput::new();
            let store = Arc::new(TrackStore::new());
            let tracks = names
                .iter()
                .map(|name| {
                    let source = BufferSource::silence(10.0, 1_000).unwrap();
                    store.insert(*name, Arc::new(source))
                })
                .collect();
            let settings = Arc::new(SettingsStore::new(PlayerConfig {
                playback,
                ..Default::default()
            }));
            let clock = ManualClock::new();
            let engine = PlaybackEngine::new(
                output.clone(),
                store.clone(),
                Arc::clone(&settings),
                Arc::new(clock.clone()),
            );

            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

            Self {
                engine,
                output,
                store,
                settings,
                clock,
                tracks,
                events,
            }
        }

        fn snapshot(&self) -> PlaybackSnapshot {
            self.engine.snapshot().unwrap()
        }

        fn current(&self) -> Option<String> {
            self.snapshot()
                .current_track_id
                .map(|id| id.as_str().to_owned())
        }

        fn last_start_frame(&self) -> u64 {
            self.output.schedules().last().unwrap().1
        }

        /// Plays the scheduled segment to its end and lets the drain elapse.
        fn finish_track(&self) {
            assert!(self.output.complete_latest());
            let lookahead = self.settings.playback().lookahead_ms;
            self.clock.advance(Duration::from_millis(u64::from(lookahead)));
            self.engine.tick().unwrap();
        }
    }

    fn rig(names: &[&str]) -> Rig {
        Rig::new(PlaybackConfig::default(), names)
    }

    #[test]
    fn repeat_one_replays_the_same_track() {
        let rig = Rig::new(
            PlaybackConfig {
                repeat: RepeatMode::One,
                ..Default::default()
            },
            &["a", "b", "c"],
        );
        rig.engine.play_queue(rig.tracks.clone(), 1).unwrap();

        for _ in 0..5 {
            rig.finish_track();
            assert_eq!(rig.current().as_deref(), Some("b"));
            assert_eq!(rig.snapshot().state, TransportState::Playing);
        }
        assert_eq!(rig.output.schedules().len(), 6);
    }

    #[test]
    fn linear_queue_stops_pinned_at_duration() {
        let rig = rig(&["a", "b", "c"]);
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        rig.engine.next().unwrap();
        rig.engine.next().unwrap();
        assert_eq!(rig.current().as_deref(), Some("c"));

        rig.finish_track();
        let snapshot = rig.snapshot();
        assert_eq!(snapshot.state, TransportState::Idle);
        assert!(!snapshot.is_playing);
        assert_eq!(snapshot.current_time, snapshot.duration);
        assert_eq!(snapshot.duration, 10.0);
        assert_eq!(snapshot.current_track_id, Some(TrackId::from("c")));
    }

    #[test]
    fn next_past_the_end_behaves_like_completion() {
        let rig = rig(&["a", "b"]);
        rig.engine.play_queue(rig.tracks.clone(), 1).unwrap();
        rig.engine.next().unwrap();

        let snapshot = rig.snapshot();
        assert_eq!(snapshot.state, TransportState::Idle);
        assert_eq!(snapshot.current_time, 10.0);
        assert_eq!(snapshot.queue_index, Some(1));
    }

    #[test]
    fn repeat_all_wraps_forward_and_backward() {
        let rig = Rig::new(
            PlaybackConfig {
                repeat: RepeatMode::All,
                ..Default::default()
            },
            &["a", "b"],
        );
        rig.engine.play_queue(rig.tracks.clone(), 1).unwrap();
        rig.finish_track();
        assert_eq!(rig.current().as_deref(), Some("a"));

        rig.engine.previous().unwrap();
        assert_eq!(rig.current().as_deref(), Some("b"));
    }

    #[test]
    fn previous_clamps_to_the_first_track() {
        let rig = rig(&["a", "b"]);
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        rig.engine.previous().unwrap();
        assert_eq!(rig.current().as_deref(), Some("a"));
        assert_eq!(rig.snapshot().state, TransportState::Playing);
    }

    #[test]
    fn audible_position_subtracts_the_lookahead() {
        let rig = rig(&["a"]);
        rig.engine.play(rig.tracks[0].clone()).unwrap();

        for rendered in (0..=10_000).step_by(250) {
            rig.output.set_rendered(rendered);
            let snapshot = rig.snapshot();
            let expected = (rendered as f64 / 1_000.0 - 0.12).clamp(0.0, 10.0);
            assert_abs_diff_eq!(snapshot.current_time, expected, epsilon = 1e-9);
            assert!(snapshot.current_time >= 0.0 && snapshot.current_time <= snapshot.duration);
        }
    }

    #[test]
    fn drain_advances_on_wall_clock_then_finalizes() {
        let rig = rig(&["a", "b"]);
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        rig.output.set_rendered(10_000);
        assert!(rig.output.complete_latest());

        let snapshot = rig.engine.tick().unwrap();
        assert_eq!(snapshot.state, TransportState::Draining);
        assert!(snapshot.is_playing);
        assert_abs_diff_eq!(snapshot.current_time, 9.88, epsilon = 1e-6);

        rig.clock.advance(Duration::from_millis(60));
        let snapshot = rig.engine.tick().unwrap();
        assert_eq!(snapshot.state, TransportState::Draining);
        assert_abs_diff_eq!(snapshot.current_time, 9.94, epsilon = 1e-6);

        rig.clock.advance(Duration::from_millis(59));
        assert_eq!(rig.engine.tick().unwrap().state, TransportState::Draining);

        rig.clock.advance(Duration::from_millis(1));
        let snapshot = rig.engine.tick().unwrap();
        assert_eq!(snapshot.state, TransportState::Playing);
        assert_eq!(snapshot.current_track_id, Some(TrackId::from("b")));
        assert_eq!(snapshot.current_time, 0.0);
    }

    #[test]
    fn zero_lookahead_advances_immediately() {
        let rig = Rig::new(
            PlaybackConfig {
                lookahead_ms: 0,
                ..Default::default()
            },
            &["a", "b"],
        );
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        assert!(rig.output.complete_latest());
        assert_eq!(rig.current().as_deref(), Some("b"));
        assert_eq!(rig.snapshot().state, TransportState::Playing);
    }

    #[test]
    fn seeking_during_drain_cancels_it() {
        let rig = rig(&["a", "b"]);
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        assert!(rig.output.complete_latest());
        rig.engine.seek(2.0).unwrap();
        assert_eq!(rig.snapshot().state, TransportState::Playing);

        rig.clock.advance(Duration::from_secs(1));
        rig.engine.tick().unwrap();
        assert_eq!(rig.current().as_deref(), Some("a"));
        assert_eq!(rig.last_start_frame(), 2_000);
    }

    #[test]
    fn stale_completions_change_nothing() {
        let rig = rig(&["a", "b"]);
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        let first = rig.output.last_token().unwrap();

        rig.engine.seek(4.0).unwrap();
        let before = rig.snapshot();
        assert!(rig.output.complete(first));
        assert_eq!(rig.snapshot(), before);
        assert_eq!(before.state, TransportState::Playing);

        rig.engine.stop(false).unwrap();
        assert_eq!(rig.output.complete_all(), 1);
        let snapshot = rig.snapshot();
        assert_eq!(snapshot.state, TransportState::Stopped);
        assert_eq!(snapshot.current_track_id, None);
    }

    #[test]
    fn shuffle_previous_restores_the_preceding_track() {
        let rig = Rig::new(
            PlaybackConfig {
                shuffle: true,
                ..Default::default()
            },
            &["a", "b", "c", "d", "e"],
        );
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();

        for _ in 0..20 {
            let before = rig.current();
            rig.engine.next().unwrap();
            let after = rig.current();
            assert_ne!(before, after);

            rig.engine.previous().unwrap();
            assert_eq!(rig.current(), before);
            rig.engine.next().unwrap();
        }
    }

    #[test]
    fn shuffle_auto_advance_never_repeats_back_to_back() {
        let rig = Rig::new(
            PlaybackConfig {
                shuffle: true,
                shuffle_history_limit: 2,
                ..Default::default()
            },
            &["a", "b", "c", "d", "e"],
        );
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();

        let mut played = vec![rig.current().unwrap()];
        for _ in 0..20 {
            rig.finish_track();
            played.push(rig.current().unwrap());
        }
        for pair in played.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn unresolvable_tracks_leave_state_untouched() {
        let rig = rig(&["a"]);
        rig.engine.play(rig.tracks[0].clone()).unwrap();
        rig.output.set_rendered(3_000);
        let before = rig.snapshot();
        let schedules = rig.output.schedules().len();

        rig.engine.play(Track::new("ghost", 3.0)).unwrap();
        rig.engine
            .play_queue(vec![Track::new("ghost", 3.0)], 0)
            .unwrap();

        assert_eq!(rig.snapshot(), before);
        assert_eq!(rig.output.schedules().len(), schedules);
        let events = rig.events.lock().unwrap();
        let unavailable = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    PlaybackEvent::TrackUnavailable { track } if track.as_str() == "ghost"
                )
            })
            .count();
        assert_eq!(unavailable, 2);
    }

    #[test]
    fn missing_source_on_auto_advance_ends_playback() {
        let rig = rig(&["a", "b"]);
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        assert!(rig.store.remove(&TrackId::from("b")));

        rig.finish_track();
        let snapshot = rig.snapshot();
        assert_eq!(snapshot.state, TransportState::Idle);
        assert_eq!(snapshot.current_track_id, Some(TrackId::from("a")));
        assert_eq!(snapshot.current_time, 10.0);
    }

    #[test]
    fn audio_graph_failure_is_surfaced_once() {
        let rig = rig(&["a"]);
        rig.output.fail_next_start();

        let err = rig.engine.play(rig.tracks[0].clone()).unwrap_err();
        assert!(matches!(err, PlayerError::AudioGraph(_)));
        let snapshot = rig.snapshot();
        assert_eq!(snapshot.state, TransportState::Idle);
        assert_eq!(snapshot.current_track_id, None);
        assert!(rig.output.schedules().is_empty());

        rig.engine.play(rig.tracks[0].clone()).unwrap();
        assert_eq!(rig.snapshot().state, TransportState::Playing);
    }

    #[test]
    fn pause_holds_position_and_resume_reschedules_from_it() {
        let rig = rig(&["a"]);
        rig.engine.play(rig.tracks[0].clone()).unwrap();
        let first = rig.output.last_token().unwrap();
        rig.output.set_rendered(2_120);

        rig.engine.pause().unwrap();
        let paused = rig.snapshot();
        assert_eq!(paused.state, TransportState::Paused);
        assert!(!paused.is_playing);
        assert_abs_diff_eq!(paused.current_time, 2.0, epsilon = 1e-9);
        assert!(rig.output.is_paused());

        assert!(rig.output.complete(first));
        assert_eq!(rig.snapshot(), paused);

        rig.engine.resume().unwrap();
        assert_eq!(rig.snapshot().state, TransportState::Playing);
        assert!(rig.last_start_frame().abs_diff(2_000) <= 1);
        assert_eq!(rig.output.schedules().len(), 2);
    }

    #[test]
    fn pause_and_resume_are_no_ops_in_the_wrong_state() {
        let rig = rig(&["a"]);
        rig.engine.resume().unwrap();
        rig.engine.pause().unwrap();
        assert_eq!(rig.snapshot().state, TransportState::Idle);

        rig.engine.play(rig.tracks[0].clone()).unwrap();
        rig.engine.resume().unwrap();
        assert_eq!(rig.output.schedules().len(), 1);

        assert!(rig.output.complete_latest());
        rig.engine.pause().unwrap();
        assert_eq!(rig.snapshot().state, TransportState::Draining);

        rig.engine.toggle_play_pause().unwrap();
        assert_eq!(rig.snapshot().state, TransportState::Draining);
    }

    #[test]
    fn toggle_switches_between_playing_and_paused() {
        let rig = rig(&["a"]);
        rig.engine.play(rig.tracks[0].clone()).unwrap();
        rig.engine.toggle_play_pause().unwrap();
        assert_eq!(rig.snapshot().state, TransportState::Paused);
        rig.engine.toggle_play_pause().unwrap();
        assert_eq!(rig.snapshot().state, TransportState::Playing);
    }

    #[test]
    fn seek_is_clamped_and_preserves_pause() {
        let rig = rig(&["a"]);
        rig.engine.seek(3.0).unwrap();
        assert!(rig.output.schedules().is_empty());

        rig.engine.play(rig.tracks[0].clone()).unwrap();
        rig.engine.seek(100.0).unwrap();
        assert_eq!(rig.last_start_frame(), 9_999);
        rig.engine.seek(-3.0).unwrap();
        assert_eq!(rig.last_start_frame(), 0);
        rig.engine.seek(f64::NAN).unwrap();
        assert_eq!(rig.last_start_frame(), 0);

        rig.engine.pause().unwrap();
        let schedules = rig.output.schedules().len();
        rig.engine.seek(4.0).unwrap();
        let snapshot = rig.snapshot();
        assert_eq!(snapshot.state, TransportState::Paused);
        assert_eq!(snapshot.current_time, 4.0);
        assert_eq!(rig.output.schedules().len(), schedules);

        rig.engine.resume().unwrap();
        assert_eq!(rig.last_start_frame(), 4_000);
    }

    #[test]
    fn previous_restarts_after_the_threshold() {
        let rig = rig(&["a", "b"]);
        rig.engine.play_queue(rig.tracks.clone(), 1).unwrap();
        rig.output.set_rendered(5_000);

        rig.engine.previous().unwrap();
        assert_eq!(rig.current().as_deref(), Some("b"));
        assert_eq!(rig.last_start_frame(), 0);
        assert_eq!(rig.output.schedules().len(), 2);

        rig.output.set_rendered(1_000);
        rig.engine.previous().unwrap();
        assert_eq!(rig.current().as_deref(), Some("a"));
    }

    #[test]
    fn jump_to_plays_the_requested_entry() {
        let rig = rig(&["a", "b", "c"]);
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        rig.engine.jump_to(2).unwrap();
        assert_eq!(rig.current().as_deref(), Some("c"));
        assert_eq!(rig.snapshot().queue_index, Some(2));

        rig.engine.jump_to(7).unwrap();
        assert_eq!(rig.current().as_deref(), Some("c"));
    }

    #[test]
    fn queue_updates_reanchor_the_current_track() {
        let rig = rig(&["a", "b", "c"]);
        rig.engine.play_queue(rig.tracks.clone(), 1).unwrap();

        let reordered = vec![
            Track::new("d", 10.0),
            rig.tracks[2].clone(),
            rig.tracks[1].clone(),
        ];
        rig.engine.update_queue_tracks(reordered).unwrap();
        let snapshot = rig.snapshot();
        assert_eq!(snapshot.queue_index, Some(2));
        assert_eq!(snapshot.queue_len, 3);

        let without_current = vec![rig.tracks[0].clone(), rig.tracks[2].clone()];
        rig.engine.update_queue_tracks(without_current).unwrap();
        let snapshot = rig.snapshot();
        assert_eq!(snapshot.queue_index, Some(1));
        assert_eq!(snapshot.state, TransportState::Playing);
        assert_eq!(snapshot.current_track_id, Some(TrackId::from("b")));

        rig.engine.update_queue_tracks(Vec::new()).unwrap();
        let snapshot = rig.snapshot();
        assert_eq!(snapshot.state, TransportState::Stopped);
        assert_eq!(snapshot.queue_len, 0);
        assert_eq!(snapshot.current_track_id, None);
    }

    #[test]
    fn stop_resets_position_and_optionally_the_queue() {
        let rig = rig(&["a", "b"]);
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        rig.output.set_rendered(3_000);

        rig.engine.stop(false).unwrap();
        let snapshot = rig.snapshot();
        assert_eq!(snapshot.current_time, 0.0);
        assert_eq!(snapshot.duration, 0.0);
        assert_eq!(snapshot.queue_len, 2);
        assert_eq!(rig.output.rendered_frames(), None);

        rig.engine.stop(true).unwrap();
        assert_eq!(rig.snapshot().queue_len, 0);
    }

    #[test]
    fn settings_changes_reach_the_output() {
        let rig = rig(&["a"]);
        assert_eq!(rig.output.lookahead(), Duration::from_millis(120));
        assert_eq!(rig.output.volume(), 1.0);

        rig.settings
            .update(|config| config.playback.lookahead_ms = 40);
        assert_eq!(rig.output.lookahead(), Duration::from_millis(40));

        rig.engine.set_volume(0.25);
        assert_eq!(rig.output.volume(), 0.25);
        assert_eq!(rig.settings.playback().volume, 0.25);
    }

    #[test]
    fn events_describe_a_track_start() {
        let rig = rig(&["a"]);
        rig.engine.play(rig.tracks[0].clone()).unwrap();

        let events = rig.events.lock().unwrap();
        assert!(events.iter().any(|event| matches!(
            event,
            PlaybackEvent::TrackChanged { track: Some(id), duration }
                if id.as_str() == "a" && *duration == 10.0
        )));
        assert!(events
            .iter()
            .any(|event| matches!(event, PlaybackEvent::QueueChanged { len: 1, index: Some(0) })));
        let last_state = events.iter().rev().find_map(|event| match event {
            PlaybackEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        });
        assert_eq!(last_state, Some(TransportState::Playing));
    }

    #[test]
    fn tap_point_attaches_to_the_output() {
        let rig = rig(&["a"]);
        let tap = rig.engine.tap_point();
        tap.attach_tap(Arc::new(SampleRing::new(64)));
        assert!(rig.output.has_tap());
        tap.detach_tap();
        assert!(!rig.output.has_tap());
    }

    #[test]
    fn shuffle_remembers_the_heard_track_after_it_leaves_the_queue() {
        let rig = Rig::new(
            PlaybackConfig {
                shuffle: true,
                ..Default::default()
            },
            &["a", "b", "c", "d", "e"],
        );
        rig.engine.play_queue(rig.tracks.clone(), 0).unwrap();
        rig.engine
            .update_queue_tracks(rig.tracks[1..].to_vec())
            .unwrap();
        assert_eq!(rig.current().as_deref(), Some("a"));
        assert_eq!(rig.snapshot().queue_index, Some(0));

        rig.engine.next().unwrap();
        let next = rig.current().unwrap();
        assert_ne!(next, "a");

        let state = rig.engine.shared.lock().unwrap();
        let history: Vec<&str> = state
            .shuffle
            .recent_history()
            .map(TrackId::as_str)
            .collect();
        assert_eq!(history, vec!["a"]);
    }

    struct Pipeline {
        clock: ManualClock,
        output: Arc<SoftwareOutput>,
        engine: PlaybackEngine,
        hub: AnalysisHub,
        leds: LedProcessor,
    }

    impl Pipeline {
        fn new(tones: &[(&str, f32)]) -> (Self, Vec<Track>) {
            let clock = ManualClock::new();
            let output = Arc::new(SoftwareOutput::new(Arc::new(clock.clone())));
            let store = Arc::new(TrackStore::new());
            let tracks = tones
                .iter()
                .map(|(name, frequency)| {
                    let source = BufferSource::sine(*frequency, 0.5, 48_000, 0.9).unwrap();
                    store.insert(*name, Arc::new(source))
                })
                .collect();
            let settings = Arc::new(SettingsStore::new(PlayerConfig::default()));
            let engine = PlaybackEngine::new(
                output.clone(),
                store,
                settings,
                Arc::new(clock.clone()),
            );

            let analysis = AnalysisConfig {
                fft_size: 1024,
                buffer_capacity: 4096,
                tick_hz: 60.0,
            };
            let hub = AnalysisHub::new(analysis, Arc::new(engine.tap_point()));
            engine.tap_point().attach_tap(hub.tap());

            let pipeline = Self {
                clock,
                output,
                engine,
                hub,
                leds: LedProcessor::new(SpectrumConfig::default(), LedConfig::default()),
            };
            (pipeline, tracks)
        }

        /// One 10ms step of render, position tick and analysis tick.
        fn step(&mut self) -> (PlaybackSnapshot, Option<Arc<AnalysisFrame>>) {
            self.clock.advance(Duration::from_millis(10));
            self.output.render();
            let snapshot = self.engine.tick().unwrap();
            let frame = self.hub.tick();
            if let Some(frame) = frame.as_deref() {
                self.leds.process(frame);
            }
            (snapshot, frame)
        }
    }

    #[test]
    fn software_output_drains_advances_and_goes_quiet() {
        let (mut pipeline, tracks) = Pipeline::new(&[("low", 100.0), ("high", 200.0)]);
        pipeline.engine.play_queue(tracks, 0).unwrap();

        let mut frame = None;
        for _ in 0..20 {
            frame = pipeline.step().1;
        }
        let playing = frame.expect("a full window has been rendered");
        assert!(playing.rms > 0.5);
        assert!(pipeline.leds.last().lit_segments > 0);

        let mut states = Vec::new();
        let mut advanced = false;
        for _ in 0..100 {
            let (snapshot, _) = pipeline.step();
            states.push(snapshot.state);
            if snapshot.current_track_id == Some(TrackId::from("high")) {
                assert_eq!(snapshot.state, TransportState::Playing);
                advanced = true;
                break;
            }
            assert_eq!(snapshot.current_track_id, Some(TrackId::from("low")));
        }
        assert!(advanced);
        let drained = states
            .iter()
            .filter(|state| **state == TransportState::Draining)
            .count();
        assert_eq!(drained, 12);

        pipeline.engine.stop(true).unwrap();
        let mut last = None;
        for _ in 0..150 {
            last = pipeline.step().1;
        }
        let quiet = last.expect("silence keeps producing frames");
        assert_eq!(quiet.rms, 0.0);
        assert_eq!(quiet.peak, 0.0);
        assert_eq!(pipeline.leds.last().level, 0.0);
        assert_eq!(pipeline.leds.last().lit_segments, 0);
        assert_eq!(pipeline.hub.dropped_writes(), 0);
    }
}
