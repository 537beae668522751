//! IPC layer between the pipeline and its worker process.
//!
//! - `protocol` - command/response messages and length-prefixed framing

pub mod protocol;

pub use protocol::{Command, Response, read_message, write_message};
