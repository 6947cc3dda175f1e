//! Crate-wide error shapes that more than one component needs.
//!
//! Per-component error kinds (connection/transport failures, replay
//! control-flow errors, assertion preconditions) live beside the component
//! that raises them — see [`crate::client::error`], [`crate::proxy`],
//! [`crate::replay`]. This module only holds the one error shared by
//! recorder export and the proxy's persistence collaborator.

use std::fmt;

/// Raised only by [`crate::session::recorder::Recorder::export_json`]
/// (spec.md §4.4: "Recorder operations never fail; serialization failure
/// is surfaced only at `ExportJSON`").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationError(pub String);

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session serialization failed: {}", self.0)
    }
}

impl std::error::Error for SerializationError {}
