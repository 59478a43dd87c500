//! Transport state machine, queue orchestration and latency compensated
//! position reporting.
//!
//! All mutating operations run under one engine lock. Every scheduled
//! segment carries a fresh [`SchedulingToken`](crate::audio::SchedulingToken);
//! completions that arrive with any other token are dropped, which is the
//! only cancellation mechanism for in-flight segments.

mod engine;
mod queue;
mod state;

pub use engine::PlaybackEngine;
pub use queue::{Queue, Reanchor};
pub use state::{PlaybackEvent, PlaybackSnapshot, TransportState};
