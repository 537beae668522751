//! Worker process management.
//!
//! [`WorkerHost`] spawns and talks to one `platen-worker` child over
//! length-prefixed messages on stdin/stdout. Engine callbacks arrive as
//! [`Response::Event`] messages interleaved before a command's terminal
//! response and are dispatched to the host's event sink as they stream in.
//!
//! [`KillSwitch`] is the interruption path: it can terminate the child from
//! any thread, without the host's `&mut self`, which is what unblocks a
//! dedicated thread stuck inside a conversion request.

use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipc::{Command, Response, read_message, write_message};
use crate::toolset::{EventSink, null_sink};

/// Handle to a worker process.
pub struct WorkerHost {
    child: Child,
    stdin: BufWriter<std::process::ChildStdin>,
    stdout: BufReader<std::process::ChildStdout>,
    events: EventSink,
    killed: bool,
}

impl WorkerHost {
    /// Spawn a new worker process and verify it answers a ping.
    ///
    /// The binary is looked up in order: the `PLATEN_WORKER_PATH`
    /// environment variable, the current executable's directory, the system
    /// PATH, and (for development) the workspace target directories.
    pub fn spawn() -> Result<Self> {
        let worker_path = Self::find_worker_binary()?;

        let mut child = ProcessCommand::new(&worker_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // worker logs to stderr
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "failed to spawn worker process '{}': {}",
                    worker_path.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("failed to get worker stdout".to_string()))?;

        let mut host = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            events: null_sink(),
            killed: false,
        };

        match host.request(&Command::Ping)? {
            Response::Pong => Ok(host),
            other => Err(Error::Ipc(format!(
                "unexpected response from worker: {:?}",
                other
            ))),
        }
    }

    fn find_worker_binary() -> Result<PathBuf> {
        let worker_name = if cfg!(windows) {
            "platen-worker.exe"
        } else {
            "platen-worker"
        };

        if let Ok(path) = std::env::var("PLATEN_WORKER_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(exe_path) = std::env::current_exe()
            && let Some(exe_dir) = exe_path.parent()
        {
            let worker_path = exe_dir.join(worker_name);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }

        if let Ok(path) = which::which(worker_name) {
            return Ok(path);
        }

        // For development: try target/debug or target/release.
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in &["debug", "release"] {
                let path = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(worker_name);
                if path.exists() {
                    return Ok(path.canonicalize().unwrap_or(path));
                }
            }
        }

        Err(Error::Ipc(
            "could not find platen-worker binary; set PLATEN_WORKER_PATH or ensure it is in PATH"
                .to_string(),
        ))
    }

    /// Route engine callbacks streamed by the worker to `sink`.
    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.events = sink;
    }

    /// Send `command` and block for its terminal response, dispatching any
    /// interleaved event messages to the sink along the way.
    pub fn request(&mut self, command: &Command) -> Result<Response> {
        if self.killed {
            return Err(Error::Ipc("worker has been killed".to_string()));
        }
        write_message(&mut self.stdin, command)?;
        loop {
            match read_message(&mut self.stdout)? {
                Response::Event(event) => (self.events)(&event),
                terminal => return Ok(terminal),
            }
        }
    }

    /// Kill the worker process immediately.
    ///
    /// This is the interruption primitive: the child dies mid-computation
    /// without any cooperation from the engine.
    pub fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;

        // Offer a graceful exit first so the engine can release cleanly.
        let _ = write_message(&mut self.stdin, &Command::Shutdown);
        std::thread::sleep(Duration::from_millis(10));

        if let Err(e) = self.child.kill() {
            // ESRCH means the process already exited, which is fine.
            if !e.to_string().contains("No such process") {
                tracing::warn!("failed to kill worker: {}", e);
            }
        }

        // Wait to reap the zombie.
        let _ = self.child.wait();
        Ok(())
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.killed {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Get the process id of the worker.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// A switch that can terminate this worker from any thread.
    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch {
            pid: self.pid(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Graceful shutdown: ask the worker to exit cleanly and wait for it.
    pub fn shutdown(mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        let _ = write_message(&mut self.stdin, &Command::Shutdown);

        match self.child.wait() {
            Ok(status) => {
                self.killed = true;
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::Ipc(format!("worker exited with status: {}", status)))
                }
            }
            Err(e) => Err(Error::Ipc(format!("failed to wait for worker: {}", e))),
        }
    }
}

impl Drop for WorkerHost {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

/// Thread-safe switch for terminating a worker from another thread.
#[derive(Clone)]
pub struct KillSwitch {
    pid: u32,
    fired: Arc<AtomicBool>,
}

impl KillSwitch {
    /// Terminate the worker process. Callable from any thread; later calls
    /// are no-ops.
    pub fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(pid = self.pid, "force-killing worker process");

        #[cfg(unix)]
        {
            // SIGKILL for immediate termination.
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
            }
        }

        #[cfg(windows)]
        {
            use windows::Win32::Foundation::CloseHandle;
            use windows::Win32::System::Threading::{
                OpenProcess, PROCESS_TERMINATE, TerminateProcess,
            };

            unsafe {
                if let Ok(handle) = OpenProcess(PROCESS_TERMINATE, false, self.pid) {
                    let _ = TerminateProcess(handle, 1);
                    let _ = CloseHandle(handle);
                }
            }
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
