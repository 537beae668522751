//! Concurrent, cancellable conversion pipelines over thread-affine
//! HTML-to-PDF engines.
//!
//! The engine this crate wraps is single-threaded, non-reentrant, and does
//! not reliably unload. platen turns it into a service any thread can use:
//!
//! - [`execute::AffinityExecutor`] pins one engine instance to one
//!   dedicated thread and serializes all work onto it.
//! - [`convert::ConversionFrontend`] is the thread-safe request/response
//!   API on top: FIFO queueing, per-request handles, cancellation, abort.
//! - [`isolate::IsolationBoundary`] hosts the engine in a worker process so
//!   it can be force-unloaded and reloaded without destabilizing the caller.
//!
//! One frontend + one executor + one boundary form a pipeline serving one
//! serialized stream of conversions; independent pipelines run in parallel.

pub mod convert;
pub mod document;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod isolate;
pub mod toolset;

pub use convert::{CancelToken, ConversionFrontend, ConversionHandle, ToolsetConverter};
pub use document::{ColorMode, Document, DocumentObject, GlobalSettings, ObjectSettings, Orientation};
pub use error::{Error, Result};
pub use execute::{AffinityExecutor, ExecutorState, Outcome, TaskHandle};
pub use isolate::{BoundaryToolset, IsolationBoundary};
pub use toolset::{
    ConversionEvent, ConverterHandle, EngineSpec, EventSink, NativeToolset, SettingsHandle,
    StubProbe, StubToolset, Toolset,
};
