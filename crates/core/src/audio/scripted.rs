//! Output double that keeps every completion handler so tests can deliver
//! completions (including stale ones) whenever they like.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::{AudioOutput, CompletionHandler, ScheduledSegment, SchedulingToken, SignalTap};
use crate::{PlayerError, Result};

#[derive(Default)]
pub(crate) struct ScriptedOutput {
    inner: Mutex<Scripted>,
}

#[derive(Default)]
struct Scripted {
    fail_start: bool,
    paused: bool,
    volume: f32,
    lookahead: Duration,
    rendered: Option<u64>,
    schedules: Vec<(SchedulingToken, u64)>,
    pending: Vec<(SchedulingToken, CompletionHandler)>,
    tap: Option<Arc<dyn SignalTap>>,
}

impl ScriptedOutput {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_next_start(&self) {
        self.lock().fail_start = true;
    }

    pub(crate) fn set_rendered(&self, frames: u64) {
        let mut inner = self.lock();
        if inner.rendered.is_some() {
            inner.rendered = Some(frames);
        }
    }

    pub(crate) fn schedules(&self) -> Vec<(SchedulingToken, u64)> {
        self.lock().schedules.clone()
    }

    pub(crate) fn last_token(&self) -> Option<SchedulingToken> {
        self.lock().schedules.last().map(|(token, _)| *token)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub(crate) fn volume(&self) -> f32 {
        self.lock().volume
    }

    pub(crate) fn lookahead(&self) -> Duration {
        self.lock().lookahead
    }

    pub(crate) fn has_tap(&self) -> bool {
        self.lock().tap.is_some()
    }

    /// Fires the handler registered for `token`, if it is still retained.
    pub(crate) fn complete(&self, token: SchedulingToken) -> bool {
        let handler = {
            let mut inner = self.lock();
            let position = inner.pending.iter().position(|(t, _)| *t == token);
            position.map(|index| inner.pending.remove(index).1)
        };
        match handler {
            Some(handler) => {
                handler(token);
                true
            }
            None => false,
        }
    }

    /// Fires the most recently scheduled segment's handler.
    pub(crate) fn complete_latest(&self) -> bool {
        match self.last_token() {
            Some(token) => self.complete(token),
            None => false,
        }
    }

    /// Fires every retained handler, oldest first.
    pub(crate) fn complete_all(&self) -> usize {
        let handlers: Vec<_> = self.lock().pending.drain(..).collect();
        let count = handlers.len();
        for (token, handler) in handlers {
            handler(token);
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, Scripted> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioOutput for ScriptedOutput {
    fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_start {
            inner.fail_start = false;
            return Err(PlayerError::AudioGraph("device unavailable".into()));
        }
        Ok(())
    }

    fn schedule(&self, segment: ScheduledSegment) -> Result<()> {
        let mut inner = self.lock();
        inner.schedules.push((segment.token, segment.start_frame));
        inner.pending.push((segment.token, segment.on_complete));
        inner.rendered = Some(0);
        inner.paused = false;
        Ok(())
    }

    fn pause(&self) {
        self.lock().paused = true;
    }

    fn stop(&self) {
        let mut inner = self.lock();
        inner.rendered = None;
        inner.paused = false;
    }

    fn rendered_frames(&self) -> Option<u64> {
        self.lock().rendered
    }

    fn set_volume(&self, volume: f32) {
        self.lock().volume = volume;
    }

    fn set_lookahead(&self, lookahead: Duration) {
        self.lock().lookahead = lookahead;
    }

    fn attach_tap(&self, tap: Arc<dyn SignalTap>) {
        self.lock().tap = Some(tap);
    }

    fn detach_tap(&self) {
        self.lock().tap = None;
    }
}
