use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{audio::SampleSource, PlayerError, Result};

/// Stable identifier of a track owned by the library collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TrackId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Read-only view of a library track. The engine never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    /// Duration reported by the library; the decoded source wins when the
    /// two disagree.
    #[serde(default)]
    pub duration_secs: f64,
}

impl Track {
    pub fn new(id: impl Into<TrackId>, duration_secs: f64) -> Self {
        Self {
            id: id.into(),
            duration_secs,
        }
    }
}

/// Turns a track into something the output can play.
pub trait TrackResolver: Send + Sync {
    /// Returns [`PlayerError::SourceUnavailable`] when the track cannot be
    /// played.
    fn resolve(&self, track: &Track) -> Result<Arc<dyn SampleSource>>;
}

/// In-memory registry of decoded sources keyed by track id.
#[derive(Default)]
pub struct TrackStore {
    sources: RwLock<HashMap<TrackId, Arc<dyn SampleSource>>>,
}

impl TrackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` and returns the matching library entry.
    pub fn insert(&self, id: impl Into<TrackId>, source: Arc<dyn SampleSource>) -> Track {
        let id = id.into();
        let track = Track::new(id.clone(), source.duration_secs());
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, source);
        track
    }

    pub fn remove(&self, id: &TrackId) -> bool {
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn contains(&self, id: &TrackId) -> bool {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TrackResolver for TrackStore {
    fn resolve(&self, track: &Track) -> Result<Arc<dyn SampleSource>> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&track.id)
            .cloned()
            .ok_or_else(|| PlayerError::unavailable(track.id.as_str()))
    }
}

impl fmt::Debug for TrackStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackStore")
            .field("tracks", &self.len())
            .finish()
    }
}
