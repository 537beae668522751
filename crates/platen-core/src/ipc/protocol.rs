//! IPC protocol messages for platen worker processes.
//!
//! Uses length-prefixed bincode messages over stdin/stdout.
//! Format: 4-byte length (u32 LE) + bincode-encoded message.
//!
//! Most commands get exactly one terminal response; `PerformConversion` may
//! be preceded by any number of `Event` responses raised by the engine's
//! callbacks while the conversion runs.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::toolset::{ConversionEvent, ConverterHandle, EngineSpec, SettingsHandle};

/// Command sent from the pipeline to the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Ping to check if the worker is alive.
    Ping,

    /// Instantiate and load the requested engine.
    Load { engine: EngineSpec },

    CreateGlobalSettings,
    CreateObjectSettings,
    SetGlobalSetting {
        settings: SettingsHandle,
        name: String,
        value: String,
    },
    GetGlobalSetting {
        settings: SettingsHandle,
        name: String,
    },
    SetObjectSetting {
        settings: SettingsHandle,
        name: String,
        value: String,
    },
    GetObjectSetting {
        settings: SettingsHandle,
        name: String,
    },
    CreateConverter { global: SettingsHandle },

    /// Start streaming the converter's engine callbacks back as
    /// [`Response::Event`] messages.
    RegisterEvents { converter: ConverterHandle },

    AddObject {
        converter: ConverterHandle,
        object: SettingsHandle,
        content: Vec<u8>,
    },
    PerformConversion { converter: ConverterHandle },
    GetOutput { converter: ConverterHandle },
    DestroyConverter { converter: ConverterHandle },

    /// Release the engine and verify the module is gone.
    Unload,

    /// Shutdown the worker process gracefully.
    Shutdown,
}

/// Response sent from the worker to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Pong,

    /// Engine instantiated and loaded.
    Loaded {
        /// Resolved module path for native engines; `None` for the stub.
        module: Option<String>,
    },

    Settings { handle: SettingsHandle },
    Converter { handle: ConverterHandle },

    /// Result of a set-setting call: whether the engine accepted it.
    Flag { accepted: bool },

    /// Result of a get-setting call.
    Value { text: String },

    /// Generic acknowledgement for calls with no payload.
    Done,

    /// An engine callback fired; delivered before the terminal response of
    /// the command that triggered it.
    Event(ConversionEvent),

    /// Conversion finished; the engine's success flag.
    Performed { success: bool },

    Output { bytes: Vec<u8> },

    /// Engine released. `clean` is false when the module stayed mapped
    /// after the bounded force-release attempts.
    Unloaded { clean: bool },

    /// The command failed.
    Error { message: String },

    /// Acknowledgement of a shutdown request.
    ShuttingDown,
}

/// Sanity cap on message size: nothing in the protocol should approach it.
const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Write a message using length-prefixed bincode encoding.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| Error::Serialization(format!("failed to encode IPC message: {}", e)))?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message using length-prefixed bincode encoding.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("failed to read IPC message body: {}", e)))?;

    let (message, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| Error::Serialization(format!("failed to decode IPC message: {}", e)))?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_command_roundtrip() {
        let cmd = Command::SetGlobalSetting {
            settings: SettingsHandle(3),
            name: "size.paperSize".to_string(),
            value: "A4".to_string(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: Command = read_message(&mut cursor).unwrap();

        match decoded {
            Command::SetGlobalSetting { settings, name, value } => {
                assert_eq!(settings, SettingsHandle(3));
                assert_eq!(name, "size.paperSize");
                assert_eq!(value, "A4");
            }
            other => panic!("wrong command type: {:?}", other),
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = Response::Output {
            bytes: vec![1, 2, 3, 4, 5],
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &resp).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: Response = read_message(&mut cursor).unwrap();

        match decoded {
            Response::Output { bytes } => assert_eq!(bytes, vec![1, 2, 3, 4, 5]),
            other => panic!("wrong response type: {:?}", other),
        }
    }

    #[test]
    fn test_event_roundtrip() {
        let resp = Response::Event(ConversionEvent::ProgressChange {
            progress: 40,
            description: "40%".to_string(),
        });

        let mut buf = Vec::new();
        write_message(&mut buf, &resp).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: Response = read_message(&mut cursor).unwrap();
        assert!(matches!(
            decoded,
            Response::Event(ConversionEvent::ProgressChange { progress: 40, .. })
        ));
    }

    #[test]
    fn test_truncated_stream_is_an_ipc_error() {
        let cmd = Command::Ping;
        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = Cursor::new(buf);
        let result: Result<Command> = read_message(&mut cursor);
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}
