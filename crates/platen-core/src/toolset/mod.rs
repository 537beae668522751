//! The engine capability surface.
//!
//! [`Toolset`] is the abstract contract the rest of the pipeline is written
//! against: load/unload the engine, build settings objects, assemble a
//! converter, run it, read the output. Implementations:
//!
//! - [`NativeToolset`] — binds the wkhtmltox shared library in-process.
//! - [`StubToolset`] — deterministic in-memory stand-in for tests and for
//!   machines without the native engine.
//! - `BoundaryToolset` (in `isolate`) — proxies every call to a toolset
//!   hosted in a worker process.
//!
//! All implementations are thread-affine by contract: every call on one
//! instance must come from the thread that owns it. The executor enforces
//! this structurally; nothing here takes locks for it.

mod events;
mod native;
mod registry;
mod stub;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use events::{ConversionEvent, EventSink, null_sink, sink};
pub use native::NativeToolset;
pub use stub::{FAIL_MARKER, StubProbe, StubToolset};

/// Opaque id naming a native settings object. Serializable so it can cross
/// the isolation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettingsHandle(pub(crate) u64);

/// Opaque id naming a native converter object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConverterHandle(pub(crate) u64);

/// Which engine a worker (or an in-process pipeline) should host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineSpec {
    /// The native engine library, found under the deployment directory.
    Native {
        /// Directory containing the engine's shared library.
        deployment: PathBuf,
    },
    /// The in-memory stub engine.
    Stub {
        /// Simulated per-conversion latency in milliseconds.
        latency_ms: u64,
    },
}

impl EngineSpec {
    pub fn native(deployment: impl Into<PathBuf>) -> Self {
        Self::Native {
            deployment: deployment.into(),
        }
    }

    pub fn stub() -> Self {
        Self::Stub { latency_ms: 0 }
    }
}

/// The abstract engine surface.
///
/// One loaded instance serves at most one in-flight conversion; calls are
/// serialized by the owning executor thread.
pub trait Toolset: Send {
    /// Load the engine. Idempotent. `deployment` overrides the path the
    /// instance was constructed with, when given.
    fn load(&mut self, deployment: Option<&Path>) -> Result<()>;

    /// Release the engine. Idempotent; best-effort (see the isolation
    /// boundary for the verified, retried variant).
    fn unload(&mut self) -> Result<()>;

    fn create_global_settings(&mut self) -> Result<SettingsHandle>;

    /// Returns whether the engine accepted the setting.
    fn set_global_setting(&mut self, settings: SettingsHandle, name: &str, value: &str)
    -> Result<bool>;

    fn get_global_setting(&mut self, settings: SettingsHandle, name: &str) -> Result<String>;

    fn create_object_settings(&mut self) -> Result<SettingsHandle>;

    fn set_object_setting(&mut self, settings: SettingsHandle, name: &str, value: &str)
    -> Result<bool>;

    fn get_object_setting(&mut self, settings: SettingsHandle, name: &str) -> Result<String>;

    fn create_converter(&mut self, global: SettingsHandle) -> Result<ConverterHandle>;

    /// Wire the engine's warning/error/phase-change/progress/finished hooks
    /// for `converter` to `sink`. The sink stays registered (and alive)
    /// until the converter is destroyed.
    fn register_events(&mut self, converter: ConverterHandle, sink: EventSink) -> Result<()>;

    fn add_object(
        &mut self,
        converter: ConverterHandle,
        object: SettingsHandle,
        content: &[u8],
    ) -> Result<()>;

    /// Run the conversion. Returns the engine's success flag; event hooks
    /// fire while this call is in progress.
    fn perform_conversion(&mut self, converter: ConverterHandle) -> Result<bool>;

    fn get_output(&mut self, converter: ConverterHandle) -> Result<Vec<u8>>;

    /// Destroy the converter and drop its pinned callbacks.
    fn destroy_converter(&mut self, converter: ConverterHandle) -> Result<()>;
}
