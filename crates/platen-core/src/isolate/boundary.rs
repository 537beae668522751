//! The isolation boundary.
//!
//! Hosts one engine instance in a worker process so the native module can
//! be force-unloaded and reconstructed without destabilizing this process.
//! Each `load` spawns a fresh child and mints a fresh instance id; consumers
//! must treat the `Unloaded` event as "this instance is dead" and resume
//! work only through a new load.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::convert::ConversionFrontend;
use crate::error::{Error, Result};
use crate::ipc::{Command, Response};
use crate::toolset::{ConverterHandle, EngineSpec, EventSink, SettingsHandle, Toolset};

use super::host::{KillSwitch, WorkerHost};

struct BoundaryState {
    host: Option<WorkerHost>,
    instance: Option<Uuid>,
    /// Module path the worker resolved at load, for diagnostics.
    module: Option<String>,
}

/// Hosts an engine in an isolated worker process, reloadable on demand.
pub struct IsolationBoundary {
    engine: Mutex<EngineSpec>,
    state: Mutex<BoundaryState>,
    /// Obtainable without `state`, so an abort can terminate the child while
    /// a conversion request holds the state lock.
    kill_switch: Mutex<Option<KillSwitch>>,
    unloaded: Mutex<Vec<Box<dyn Fn() + Send>>>,
}

impl IsolationBoundary {
    pub fn new(engine: EngineSpec) -> Self {
        Self {
            engine: Mutex::new(engine),
            state: Mutex::new(BoundaryState {
                host: None,
                instance: None,
                module: None,
            }),
            kill_switch: Mutex::new(None),
            unloaded: Mutex::new(Vec::new()),
        }
    }

    /// Load the engine in a fresh worker. Idempotent while the current
    /// worker is alive; a dead worker is reaped and replaced.
    pub fn load(&self) -> Result<()> {
        self.load_with(None)
    }

    /// [`load`](Self::load), optionally re-rooting a native engine at a new
    /// deployment directory.
    pub fn load_with(&self, deployment: Option<&Path>) -> Result<()> {
        if let Some(path) = deployment {
            let mut engine = self.engine.lock().unwrap();
            if let EngineSpec::Native { deployment } = &mut *engine {
                *deployment = path.to_path_buf();
            }
        }

        let mut state = self.state.lock().unwrap();
        if let Some(host) = state.host.as_mut() {
            if host.is_alive() {
                return Ok(());
            }
            tracing::warn!("worker process died; rebuilding the boundary");
            drop(state.host.take());
            state.instance = None;
            self.fire_unloaded();
        }

        let mut host = WorkerHost::spawn()?;
        let engine = self.engine.lock().unwrap().clone();
        let module = match host.request(&Command::Load { engine })? {
            Response::Loaded { module } => module,
            Response::Error { message } => return Err(Error::Construction(message)),
            other => {
                return Err(Error::Ipc(format!(
                    "unexpected response to load: {:?}",
                    other
                )));
            }
        };

        let instance = Uuid::new_v4();
        *self.kill_switch.lock().unwrap() = Some(host.kill_switch());
        state.module = module;
        state.instance = Some(instance);
        state.host = Some(host);
        tracing::info!(%instance, module = ?state.module, "isolation boundary loaded");
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().host.is_some()
    }

    /// Identity of the currently hosted instance; fresh per load.
    pub fn instance_id(&self) -> Option<Uuid> {
        self.state.lock().unwrap().instance
    }

    /// Module path the worker resolved, for diagnostics.
    pub fn module_path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().module.clone().map(PathBuf::from)
    }

    /// Release the engine and tear the worker down. Idempotent; failures
    /// are downgraded to warnings since the worker is discarded regardless.
    /// Fires `Unloaded` exactly once per actual unload.
    pub fn unload(&self) {
        self.unload_instance(None);
    }

    /// Unload only if `instance` still names the hosted generation (or is
    /// `None` for unconditional). Stale clients from a pipeline that was
    /// already aborted and rebuilt must not tear down the fresh worker.
    pub(crate) fn unload_instance(&self, instance: Option<Uuid>) {
        let host = {
            let mut state = self.state.lock().unwrap();
            if instance.is_some() && instance != state.instance {
                return;
            }
            state.instance = None;
            state.module = None;
            state.host.take()
        };

        let Some(mut host) = host else {
            tracing::debug!("nothing to unload");
            return;
        };

        match host.request(&Command::Unload) {
            Ok(Response::Unloaded { clean: false }) => {
                tracing::warn!("engine module remained mapped in the worker after release attempts");
            }
            Ok(Response::Unloaded { clean: true }) => {}
            Ok(other) => {
                tracing::warn!("unexpected response to unload: {:?}", other);
            }
            Err(e) => {
                tracing::warn!("unload request failed: {}", e);
            }
        }
        if let Err(e) = host.shutdown() {
            tracing::warn!("worker shutdown failed: {}", e);
        }
        *self.kill_switch.lock().unwrap() = None;
        self.fire_unloaded();
    }

    /// Force-kill the hosted worker without draining. The abort path: safe
    /// to call while another thread is blocked inside a conversion request,
    /// which will fail over IPC and release the boundary for reaping.
    pub fn kill(&self) {
        let switch = self.kill_switch.lock().unwrap().clone();
        if let Some(switch) = switch {
            switch.fire();
        }
    }

    /// Subscribe to the `Unloaded` event.
    pub fn on_unloaded(&self, subscriber: impl Fn() + Send + 'static) {
        self.unloaded.lock().unwrap().push(Box::new(subscriber));
    }

    fn fire_unloaded(&self) {
        for subscriber in self.unloaded.lock().unwrap().iter() {
            subscriber();
        }
    }
}

impl Drop for IsolationBoundary {
    fn drop(&mut self) {
        self.unload();
    }
}

/// [`Toolset`] client proxying every call to the boundary's worker.
///
/// Tagged with the instance generation it loaded against, so a stale client
/// cannot unload a successor instance.
pub struct BoundaryToolset {
    boundary: Arc<IsolationBoundary>,
    instance: Option<Uuid>,
}

impl BoundaryToolset {
    pub fn new(boundary: Arc<IsolationBoundary>) -> Self {
        Self {
            boundary,
            instance: None,
        }
    }

    fn request(&self, command: Command) -> Result<Response> {
        let mut state = self.boundary.state.lock().unwrap();
        let host = state
            .host
            .as_mut()
            .ok_or(Error::Closed)?;
        match host.request(&command)? {
            Response::Error { message } => Err(Error::Conversion(message)),
            response => Ok(response),
        }
    }

    fn unexpected<T>(response: Response) -> Result<T> {
        Err(Error::Ipc(format!("unexpected worker response: {:?}", response)))
    }
}

impl Toolset for BoundaryToolset {
    fn load(&mut self, deployment: Option<&Path>) -> Result<()> {
        self.boundary.load_with(deployment)?;
        self.instance = self.boundary.instance_id();
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        self.boundary.unload_instance(self.instance.take());
        Ok(())
    }

    fn create_global_settings(&mut self) -> Result<SettingsHandle> {
        match self.request(Command::CreateGlobalSettings)? {
            Response::Settings { handle } => Ok(handle),
            other => Self::unexpected(other),
        }
    }

    fn set_global_setting(&mut self, settings: SettingsHandle, name: &str, value: &str)
    -> Result<bool> {
        match self.request(Command::SetGlobalSetting {
            settings,
            name: name.to_string(),
            value: value.to_string(),
        })? {
            Response::Flag { accepted } => Ok(accepted),
            other => Self::unexpected(other),
        }
    }

    fn get_global_setting(&mut self, settings: SettingsHandle, name: &str) -> Result<String> {
        match self.request(Command::GetGlobalSetting {
            settings,
            name: name.to_string(),
        })? {
            Response::Value { text } => Ok(text),
            other => Self::unexpected(other),
        }
    }

    fn create_object_settings(&mut self) -> Result<SettingsHandle> {
        match self.request(Command::CreateObjectSettings)? {
            Response::Settings { handle } => Ok(handle),
            other => Self::unexpected(other),
        }
    }

    fn set_object_setting(&mut self, settings: SettingsHandle, name: &str, value: &str)
    -> Result<bool> {
        match self.request(Command::SetObjectSetting {
            settings,
            name: name.to_string(),
            value: value.to_string(),
        })? {
            Response::Flag { accepted } => Ok(accepted),
            other => Self::unexpected(other),
        }
    }

    fn get_object_setting(&mut self, settings: SettingsHandle, name: &str) -> Result<String> {
        match self.request(Command::GetObjectSetting {
            settings,
            name: name.to_string(),
        })? {
            Response::Value { text } => Ok(text),
            other => Self::unexpected(other),
        }
    }

    fn create_converter(&mut self, global: SettingsHandle) -> Result<ConverterHandle> {
        match self.request(Command::CreateConverter { global })? {
            Response::Converter { handle } => Ok(handle),
            other => Self::unexpected(other),
        }
    }

    fn register_events(&mut self, converter: ConverterHandle, sink: EventSink) -> Result<()> {
        {
            let mut state = self.boundary.state.lock().unwrap();
            if let Some(host) = state.host.as_mut() {
                host.set_event_sink(sink);
            }
        }
        match self.request(Command::RegisterEvents { converter })? {
            Response::Done => Ok(()),
            other => Self::unexpected(other),
        }
    }

    fn add_object(&mut self, converter: ConverterHandle, object: SettingsHandle, content: &[u8])
    -> Result<()> {
        match self.request(Command::AddObject {
            converter,
            object,
            content: content.to_vec(),
        })? {
            Response::Done => Ok(()),
            other => Self::unexpected(other),
        }
    }

    fn perform_conversion(&mut self, converter: ConverterHandle) -> Result<bool> {
        match self.request(Command::PerformConversion { converter })? {
            Response::Performed { success } => Ok(success),
            other => Self::unexpected(other),
        }
    }

    fn get_output(&mut self, converter: ConverterHandle) -> Result<Vec<u8>> {
        match self.request(Command::GetOutput { converter })? {
            Response::Output { bytes } => Ok(bytes),
            other => Self::unexpected(other),
        }
    }

    fn destroy_converter(&mut self, converter: ConverterHandle) -> Result<()> {
        match self.request(Command::DestroyConverter { converter })? {
            Response::Done => Ok(()),
            other => Self::unexpected(other),
        }
    }
}

impl ConversionFrontend<BoundaryToolset> {
    /// A frontend whose pipeline lives behind `boundary`: aborts kill the
    /// worker process, graceful disposal unloads it, and each rebuild loads
    /// a fresh instance.
    pub fn isolated(boundary: Arc<IsolationBoundary>) -> Self {
        let factory_boundary = boundary.clone();
        let teardown_boundary = boundary.clone();
        let graceful_boundary = boundary;
        ConversionFrontend::with_hooks(
            move || Ok(BoundaryToolset::new(factory_boundary.clone())),
            move || teardown_boundary.kill(),
            move || graceful_boundary.unload(),
        )
    }
}
