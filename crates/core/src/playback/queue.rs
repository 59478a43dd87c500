use crate::library::{Track, TrackId};

/// Ordered tracks plus the current index.
///
/// The index is `Some` exactly when the queue is not empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Queue {
    tracks: Vec<Track>,
    index: Option<usize>,
}

/// How [`Queue::replace_tracks`] re-anchored the current index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reanchor {
    /// The current track is still queued at the new index.
    Kept(usize),
    /// The current track is gone; the old index was clamped.
    Clamped(usize),
    Emptied,
}

impl Queue {
    /// Returns `None` when `start` is not a valid index into `tracks`.
    pub fn new(tracks: Vec<Track>, start: usize) -> Option<Self> {
        (start < tracks.len()).then_some(Self {
            tracks,
            index: Some(start),
        })
    }

    pub fn single(track: Track) -> Self {
        Self {
            tracks: vec![track],
            index: Some(0),
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn current(&self) -> Option<&Track> {
        self.index.and_then(|index| self.tracks.get(index))
    }

    pub fn ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|track| track.id.clone()).collect()
    }

    pub fn position_of(&self, id: &TrackId) -> Option<usize> {
        self.tracks.iter().position(|track| &track.id == id)
    }

    pub fn set_index(&mut self, index: usize) -> bool {
        if index < self.tracks.len() {
            self.index = Some(index);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.index = None;
    }

    /// Linear successor of the current index, `None` past the end unless
    /// `wrap` is set.
    pub fn following(&self, wrap: bool) -> Option<usize> {
        let index = self.index?;
        if index + 1 < self.tracks.len() {
            Some(index + 1)
        } else if wrap {
            Some(0)
        } else {
            None
        }
    }

    /// Linear predecessor of the current index. Clamps to the first entry,
    /// or wraps to the last one when `wrap` is set.
    pub fn preceding(&self, wrap: bool) -> Option<usize> {
        let index = self.index?;
        if index > 0 {
            Some(index - 1)
        } else if wrap {
            Some(self.tracks.len() - 1)
        } else {
            Some(0)
        }
    }

    /// Swaps in new contents and re-anchors the index to `current` if it is
    /// still present.
    pub fn replace_tracks(&mut self, tracks: Vec<Track>, current: Option<&TrackId>) -> Reanchor {
        let previous = self.index.unwrap_or(0);
        self.tracks = tracks;

        if self.tracks.is_empty() {
            self.index = None;
            return Reanchor::Emptied;
        }

        match current.and_then(|id| self.position_of(id)) {
            Some(index) => {
                self.index = Some(index);
                Reanchor::Kept(index)
            }
            None => {
                let index = previous.min(self.tracks.len() - 1);
                self.index = Some(index);
                Reanchor::Clamped(index)
            }
        }
    }
}
