//! Conversion progress events.
//!
//! Events are raised on whichever thread the engine raises its callbacks on
//! and are re-marshalled across the isolation boundary as IPC messages.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A notification from the engine about one in-flight conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConversionEvent {
    /// Conversion is about to start; `objects` is the number of content
    /// objects queued into the converter.
    Begin { objects: usize },
    Warning { message: String },
    Error { message: String },
    PhaseChange { phase: i32, description: String },
    /// `progress` is the engine's percentage for the current phase.
    ProgressChange { progress: i32, description: String },
    Finish { success: bool },
}

/// Shared event callback. Cheap to clone; safe to call from any thread.
pub type EventSink = Arc<dyn Fn(&ConversionEvent) + Send + Sync>;

/// Wrap a closure as an [`EventSink`].
pub fn sink(f: impl Fn(&ConversionEvent) + Send + Sync + 'static) -> EventSink {
    Arc::new(f)
}

/// A sink that discards everything.
pub fn null_sink() -> EventSink {
    Arc::new(|_| {})
}
