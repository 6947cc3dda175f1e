//! The session data model and recorder (spec.md §3, §4.4).

pub mod model;
pub mod recorder;
pub mod serde_support;

pub use model::{
    CloseCode, Direction, EventType, LatencyPercentiles, MessageFrame, SessionEvent,
    SessionRecord, SessionStats,
};
pub use recorder::Recorder;
