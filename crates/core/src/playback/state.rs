use serde::Serialize;

use crate::library::TrackId;

/// Transport state machine.
///
/// `Idle -> Loading -> Playing <-> Paused -> Draining -> Idle (next track)`,
/// with `Stopped` reachable from anywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    /// The segment finished on the transport clock but the lookahead delay
    /// is still audible.
    Draining,
    Stopped,
}

impl TransportState {
    /// Whether the listener currently hears the track.
    pub fn is_audible(self) -> bool {
        matches!(self, Self::Playing | Self::Draining)
    }
}

/// Observable engine state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybackSnapshot {
    pub state: TransportState,
    pub is_playing: bool,
    /// Audible position in seconds, within `0..=duration`.
    pub current_time: f64,
    pub duration: f64,
    pub current_track_id: Option<TrackId>,
    pub queue_index: Option<usize>,
    pub queue_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlaybackEvent {
    StateChanged {
        state: TransportState,
        is_playing: bool,
    },
    TrackChanged {
        track: Option<TrackId>,
        duration: f64,
    },
    PositionChanged {
        current_time: f64,
        duration: f64,
    },
    QueueChanged {
        len: usize,
        index: Option<usize>,
    },
    /// The resolver could not provide a source; callers usually mark the
    /// track unavailable in the library.
    TrackUnavailable {
        track: TrackId,
    },
}
