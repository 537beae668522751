//! Process isolation for the engine.
//!
//! The native module must not be loaded twice with conflicting versions in
//! one process, and it sometimes refuses a clean unload. Hosting it in a
//! worker process makes "unload" and "abort mid-call" both reduce to
//! operations on a child process, which always succeed.
//!
//! - `boundary` - the reloadable host and its `Toolset` client
//! - `host` - worker process spawn/IPC/kill management
//! - `modules` - loaded-module verification and forced release

mod boundary;
mod host;
pub mod modules;

pub use boundary::{BoundaryToolset, IsolationBoundary};
pub use host::{KillSwitch, WorkerHost};
