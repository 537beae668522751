//! Worker process hosting one conversion engine instance.
//!
//! Speaks the platen IPC protocol over stdin/stdout: commands in, responses
//! out, engine callbacks streamed as `Event` messages before the terminal
//! response of the command that raised them. Everything else (logs) goes to
//! stderr so stdout stays a clean IPC channel.
//!
//! The engine runs on this process's main thread for its entire lifetime,
//! which satisfies its thread-affinity contract by construction. The parent
//! enforces isolation the blunt way: if this process misbehaves it is
//! killed, engine and all.

use std::io::{BufReader, BufWriter, Stdout, stdout};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;

use platen_core::error::Error;
use platen_core::ipc::{Command, Response, read_message, write_message};
use platen_core::isolate::modules;
use platen_core::toolset::{EngineSpec, NativeToolset, StubToolset, Toolset, sink};

type SharedWriter = Arc<Mutex<BufWriter<Stdout>>>;

enum HostedEngine {
    Native(NativeToolset),
    Stub(StubToolset),
}

impl HostedEngine {
    fn toolset(&mut self) -> &mut dyn Toolset {
        match self {
            Self::Native(toolset) => toolset,
            Self::Stub(toolset) => toolset,
        }
    }

    fn module_path(&self) -> Option<PathBuf> {
        match self {
            Self::Native(toolset) => toolset.module_path().map(PathBuf::from),
            Self::Stub(_) => None,
        }
    }
}

struct Host {
    engine: Option<HostedEngine>,
    out: SharedWriter,
}

impl Host {
    fn new(out: SharedWriter) -> Self {
        Self { engine: None, out }
    }

    fn toolset(&mut self) -> Result<&mut dyn Toolset, Error> {
        self.engine
            .as_mut()
            .map(HostedEngine::toolset)
            .ok_or_else(|| Error::Conversion("no engine loaded".to_string()))
    }

    fn handle(&mut self, command: Command) -> Result<Response, Error> {
        match command {
            Command::Ping => Ok(Response::Pong),

            Command::Load { engine } => {
                if self.engine.is_none() {
                    let mut hosted = match engine {
                        EngineSpec::Native { deployment } => {
                            HostedEngine::Native(NativeToolset::new(deployment))
                        }
                        EngineSpec::Stub { latency_ms } => HostedEngine::Stub(StubToolset::new(
                            Duration::from_millis(latency_ms),
                        )),
                    };
                    hosted.toolset().load(None)?;
                    self.engine = Some(hosted);
                }
                let module = self
                    .engine
                    .as_ref()
                    .and_then(HostedEngine::module_path)
                    .map(|p| p.to_string_lossy().into_owned());
                Ok(Response::Loaded { module })
            }

            Command::CreateGlobalSettings => {
                let handle = self.toolset()?.create_global_settings()?;
                Ok(Response::Settings { handle })
            }
            Command::CreateObjectSettings => {
                let handle = self.toolset()?.create_object_settings()?;
                Ok(Response::Settings { handle })
            }
            Command::SetGlobalSetting { settings, name, value } => {
                let accepted = self.toolset()?.set_global_setting(settings, &name, &value)?;
                Ok(Response::Flag { accepted })
            }
            Command::GetGlobalSetting { settings, name } => {
                let text = self.toolset()?.get_global_setting(settings, &name)?;
                Ok(Response::Value { text })
            }
            Command::SetObjectSetting { settings, name, value } => {
                let accepted = self.toolset()?.set_object_setting(settings, &name, &value)?;
                Ok(Response::Flag { accepted })
            }
            Command::GetObjectSetting { settings, name } => {
                let text = self.toolset()?.get_object_setting(settings, &name)?;
                Ok(Response::Value { text })
            }
            Command::CreateConverter { global } => {
                let handle = self.toolset()?.create_converter(global)?;
                Ok(Response::Converter { handle })
            }

            Command::RegisterEvents { converter } => {
                // Stream engine callbacks straight back to the parent; they
                // interleave ahead of the terminal response of whatever
                // command is in flight when they fire.
                let out = self.out.clone();
                let event_sink = sink(move |event| {
                    let mut out = out.lock().unwrap();
                    if let Err(e) = write_message(&mut *out, &Response::Event(event.clone())) {
                        tracing::warn!("failed to stream event to parent: {}", e);
                    }
                });
                self.toolset()?.register_events(converter, event_sink)?;
                Ok(Response::Done)
            }

            Command::AddObject { converter, object, content } => {
                self.toolset()?.add_object(converter, object, &content)?;
                Ok(Response::Done)
            }
            Command::PerformConversion { converter } => {
                let success = self.toolset()?.perform_conversion(converter)?;
                Ok(Response::Performed { success })
            }
            Command::GetOutput { converter } => {
                let bytes = self.toolset()?.get_output(converter)?;
                Ok(Response::Output { bytes })
            }
            Command::DestroyConverter { converter } => {
                self.toolset()?.destroy_converter(converter)?;
                Ok(Response::Done)
            }

            Command::Unload => {
                let module = self.engine.as_ref().and_then(HostedEngine::module_path);
                if let Some(mut hosted) = self.engine.take() {
                    hosted.toolset().unload()?;
                }
                // The toolset already retried; report whether the module is
                // actually gone from this process.
                let clean = module.map(|m| !modules::is_mapped(&m)).unwrap_or(true);
                Ok(Response::Unloaded { clean })
            }

            // Handled by the caller; answered here for completeness.
            Command::Shutdown => Ok(Response::ShuttingDown),
        }
    }
}

fn serve() -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let out: SharedWriter = Arc::new(Mutex::new(BufWriter::new(stdout())));

    let mut host = Host::new(out.clone());

    loop {
        let command: Command = match read_message(&mut reader) {
            Ok(command) => command,
            Err(e) => {
                // EOF: the parent went away; exit quietly.
                tracing::debug!("command stream closed: {}", e);
                return Ok(());
            }
        };

        let shutting_down = matches!(command, Command::Shutdown);
        tracing::trace!(?command, "dispatching");

        let response = match catch_unwind(AssertUnwindSafe(|| host.handle(command))) {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => Response::Error {
                message: error.to_string(),
            },
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("engine call panicked: {}", message);
                Response::Error {
                    message: format!("worker panicked: {}", message),
                }
            }
        };

        {
            let mut out = out.lock().unwrap();
            write_message(&mut *out, &response).context("failed to write response")?;
        }

        if shutting_down {
            return Ok(());
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Logs to stderr only; stdout belongs to the IPC protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    serve()
}
