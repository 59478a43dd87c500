//! Anti-repetition shuffle order.
//!
//! Candidates are served in rounds. Each round excludes the current track and
//! places tracks that are not in the recent history ahead of those that are,
//! so recently heard tracks only come back once the fresh pool is used up.

use std::collections::{HashSet, VecDeque};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::library::TrackId;

/// Default number of recently played tracks kept out of the next round.
pub const DEFAULT_HISTORY_LIMIT: usize = 12;
/// Bound on remembered backward navigation steps.
const MAX_PREVIOUS_DEPTH: usize = 1_024;

#[derive(Debug, Clone)]
pub struct ShuffleQueueManager {
    history_limit: usize,
    candidates: Vec<TrackId>,
    recent_history: VecDeque<TrackId>,
    previous_stack: Vec<TrackId>,
    pending_round: VecDeque<TrackId>,
    current: Option<TrackId>,
    rng: StdRng,
}

impl ShuffleQueueManager {
    pub fn new(history_limit: usize) -> Self {
        Self::with_rng(history_limit, StdRng::from_entropy())
    }

    /// Deterministic variant used for reproducible orders.
    pub fn seeded(history_limit: usize, seed: u64) -> Self {
        Self::with_rng(history_limit, StdRng::seed_from_u64(seed))
    }

    fn with_rng(history_limit: usize, rng: StdRng) -> Self {
        Self {
            history_limit: history_limit.max(1),
            candidates: Vec::new(),
            recent_history: VecDeque::new(),
            previous_stack: Vec::new(),
            pending_round: VecDeque::new(),
            current: None,
            rng,
        }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn set_history_limit(&mut self, limit: usize) {
        self.history_limit = limit.max(1);
        while self.recent_history.len() > self.history_limit {
            self.recent_history.pop_front();
        }
    }

    pub fn candidates(&self) -> &[TrackId] {
        &self.candidates
    }

    /// Most-recent-last.
    pub fn recent_history(&self) -> impl Iterator<Item = &TrackId> {
        self.recent_history.iter()
    }

    pub fn pending_round(&self) -> impl Iterator<Item = &TrackId> {
        self.pending_round.iter()
    }

    pub fn can_go_back(&self) -> bool {
        !self.previous_stack.is_empty()
    }

    /// Replaces the candidate set.
    ///
    /// Without `reset_history`, history and back-navigation entries that are
    /// still candidates survive, which keeps continuity across small queue
    /// edits. The pending round is always regenerated.
    pub fn rebuild(
        &mut self,
        candidates: &[TrackId],
        current: Option<&TrackId>,
        reset_history: bool,
    ) {
        let mut seen = HashSet::with_capacity(candidates.len());
        self.candidates = candidates
            .iter()
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect();

        if reset_history {
            self.recent_history.clear();
            self.previous_stack.clear();
        } else {
            self.recent_history.retain(|id| seen.contains(id));
            self.previous_stack.retain(|id| seen.contains(id));
        }

        self.current = current.cloned();
        self.regenerate_round();

        tracing::debug!(
            candidates = self.candidates.len(),
            reset_history,
            "shuffle state rebuilt"
        );
    }

    /// Picks the track to play after `current`.
    pub fn next_id(&mut self, current: &TrackId) -> Option<TrackId> {
        match self.candidates.len() {
            0 => return None,
            1 => return self.candidates.first().cloned(),
            _ => {}
        }

        self.remember(current);
        self.current = Some(current.clone());

        for _ in 0..2 {
            if self.pending_round.is_empty() {
                self.regenerate_round();
            }
            while let Some(candidate) = self.pending_round.pop_front() {
                if &candidate != current && self.candidates.contains(&candidate) {
                    self.current = Some(candidate.clone());
                    return Some(candidate);
                }
            }
        }

        None
    }

    /// Steps back to the track that was playing before the last advance.
    pub fn previous_id(&mut self) -> Option<TrackId> {
        let previous = self.previous_stack.pop()?;
        self.pending_round.retain(|id| id != &previous);
        self.current = Some(previous.clone());
        Some(previous)
    }

    /// Records an explicit jump so history and back navigation stay coherent.
    pub fn record_jump(&mut self, from: Option<&TrackId>, to: &TrackId) {
        if let Some(from) = from {
            if from != to {
                self.remember(from);
            }
        }
        self.pending_round.retain(|id| id != to);
        self.current = Some(to.clone());
    }

    fn remember(&mut self, id: &TrackId) {
        self.recent_history.retain(|existing| existing != id);
        self.recent_history.push_back(id.clone());
        while self.recent_history.len() > self.history_limit {
            self.recent_history.pop_front();
        }

        self.previous_stack.push(id.clone());
        if self.previous_stack.len() > MAX_PREVIOUS_DEPTH {
            let overflow = self.previous_stack.len() - MAX_PREVIOUS_DEPTH;
            self.previous_stack.drain(0..overflow);
        }
    }

    fn regenerate_round(&mut self) {
        let (mut deferred, mut fresh): (Vec<TrackId>, Vec<TrackId>) = self
            .candidates
            .iter()
            .filter(|id| Some(*id) != self.current.as_ref())
            .cloned()
            .partition(|id| self.recent_history.contains(id));

        fresh.shuffle(&mut self.rng);
        deferred.shuffle(&mut self.rng);

        self.pending_round = fresh.into_iter().chain(deferred).collect();
        tracing::trace!(round = self.pending_round.len(), "shuffle round generated");
    }
}

impl Default for ShuffleQueueManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
