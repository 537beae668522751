//! In-memory engine stand-in.
//!
//! Behaves like the native toolset — settings objects, converters, event
//! emission, serialized single-instance execution — without the shared
//! library. The test-suite drives its timing and concurrency properties
//! through [`StubProbe`]; CI machines without the engine can host it in a
//! worker process via `EngineSpec::Stub`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};

use super::events::{ConversionEvent, EventSink, null_sink};
use super::{ConverterHandle, SettingsHandle, Toolset};

/// Shared execution counters for asserting pipeline properties.
///
/// `active` is incremented on entry to the simulated native call and
/// decremented on exit; `max_active` records the high-water mark, which must
/// never exceed 1 for a single pipeline.
#[derive(Clone, Default)]
pub struct StubProbe {
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    executed: Arc<AtomicUsize>,
    instances: Arc<AtomicUsize>,
}

impl StubProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conversions currently inside the simulated native call.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest concurrency ever observed.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Total conversions that entered the simulated native call.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Number of stub instances constructed against this probe.
    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.executed.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Object content that makes [`StubToolset::perform_conversion`] fail.
pub const FAIL_MARKER: &[u8] = b"<!--stub:fail-->";

struct StubConverter {
    objects: Vec<Vec<u8>>,
    sink: EventSink,
}

/// Deterministic in-memory [`Toolset`].
pub struct StubToolset {
    latency: Duration,
    probe: StubProbe,
    loaded: bool,
    /// Distinguishes instances across reloads.
    instance: usize,
    next_handle: u64,
    settings: HashMap<SettingsHandle, HashMap<String, String>>,
    converters: HashMap<ConverterHandle, StubConverter>,
}

impl StubToolset {
    pub fn new(latency: Duration) -> Self {
        Self::with_probe(latency, StubProbe::new())
    }

    pub fn with_probe(latency: Duration, probe: StubProbe) -> Self {
        let instance = probe.instances.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            latency,
            probe,
            loaded: false,
            instance,
            next_handle: 1,
            settings: HashMap::new(),
            converters: HashMap::new(),
        }
    }

    /// Identity of this stub instance; fresh per construction.
    pub fn instance_id(&self) -> usize {
        self.instance
    }

    fn next(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn require_loaded(&self) -> Result<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(Error::Conversion("stub engine not loaded".to_string()))
        }
    }

    fn converter_mut(&mut self, handle: ConverterHandle) -> Result<&mut StubConverter> {
        self.converters
            .get_mut(&handle)
            .ok_or_else(|| Error::Conversion(format!("unknown converter handle {:?}", handle)))
    }
}

impl Toolset for StubToolset {
    fn load(&mut self, _deployment: Option<&Path>) -> Result<()> {
        self.loaded = true;
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        self.loaded = false;
        self.settings.clear();
        self.converters.clear();
        Ok(())
    }

    fn create_global_settings(&mut self) -> Result<SettingsHandle> {
        self.require_loaded()?;
        let handle = SettingsHandle(self.next());
        self.settings.insert(handle, HashMap::new());
        Ok(handle)
    }

    fn set_global_setting(
        &mut self,
        settings: SettingsHandle,
        name: &str,
        value: &str,
    ) -> Result<bool> {
        self.require_loaded()?;
        match self.settings.get_mut(&settings) {
            Some(map) => {
                map.insert(name.to_string(), value.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get_global_setting(&mut self, settings: SettingsHandle, name: &str) -> Result<String> {
        self.require_loaded()?;
        Ok(self
            .settings
            .get(&settings)
            .and_then(|map| map.get(name))
            .cloned()
            .unwrap_or_default())
    }

    fn create_object_settings(&mut self) -> Result<SettingsHandle> {
        self.create_global_settings()
    }

    fn set_object_setting(
        &mut self,
        settings: SettingsHandle,
        name: &str,
        value: &str,
    ) -> Result<bool> {
        self.set_global_setting(settings, name, value)
    }

    fn get_object_setting(&mut self, settings: SettingsHandle, name: &str) -> Result<String> {
        self.get_global_setting(settings, name)
    }

    fn create_converter(&mut self, global: SettingsHandle) -> Result<ConverterHandle> {
        self.require_loaded()?;
        // Like the real engine, the converter takes ownership of the global
        // settings object.
        if self.settings.remove(&global).is_none() {
            return Err(Error::Conversion(format!(
                "unknown settings handle {:?}",
                global
            )));
        }
        let handle = ConverterHandle(self.next());
        self.converters.insert(
            handle,
            StubConverter {
                objects: Vec::new(),
                sink: null_sink(),
            },
        );
        Ok(handle)
    }

    fn register_events(&mut self, converter: ConverterHandle, sink: EventSink) -> Result<()> {
        self.converter_mut(converter)?.sink = sink;
        Ok(())
    }

    fn add_object(
        &mut self,
        converter: ConverterHandle,
        object: SettingsHandle,
        content: &[u8],
    ) -> Result<()> {
        // The converter takes ownership of the object settings.
        if self.settings.remove(&object).is_none() {
            return Err(Error::Conversion(format!(
                "unknown settings handle {:?}",
                object
            )));
        }
        self.converter_mut(converter)?.objects.push(content.to_vec());
        Ok(())
    }

    fn perform_conversion(&mut self, converter: ConverterHandle) -> Result<bool> {
        self.require_loaded()?;
        let latency = self.latency;
        let probe = self.probe.clone();
        let conv = self.converter_mut(converter)?;
        let sink = conv.sink.clone();
        let objects = conv.objects.len();
        // Content marker that makes the stub report failure, for tests that
        // need a deterministic engine-side fault.
        let poisoned = conv
            .objects
            .iter()
            .any(|o| o.windows(FAIL_MARKER.len()).any(|w| w == FAIL_MARKER));

        probe.enter();
        sink(&ConversionEvent::PhaseChange {
            phase: 1,
            description: "Loading pages".to_string(),
        });
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        sink(&ConversionEvent::ProgressChange {
            progress: 100,
            description: "100%".to_string(),
        });
        let success = objects > 0 && !poisoned;
        sink(&ConversionEvent::Finish { success });
        probe.exit();

        Ok(success)
    }

    fn get_output(&mut self, converter: ConverterHandle) -> Result<Vec<u8>> {
        self.require_loaded()?;
        let instance = self.instance;
        let conv = self.converter_mut(converter)?;
        // A recognizable fake PDF: header, one line per object, instance tag.
        let mut out = format!("%PDF-1.4\n%stub engine instance {}\n", instance).into_bytes();
        for (index, object) in conv.objects.iter().enumerate() {
            out.extend_from_slice(format!("% object {} ({} bytes)\n", index, object.len()).as_bytes());
        }
        out.extend_from_slice(b"%%EOF\n");
        Ok(out)
    }

    fn destroy_converter(&mut self, converter: ConverterHandle) -> Result<()> {
        self.converters.remove(&converter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_once(toolset: &mut StubToolset, html: &str) -> Vec<u8> {
        let global = toolset.create_global_settings().unwrap();
        let converter = toolset.create_converter(global).unwrap();
        let object = toolset.create_object_settings().unwrap();
        toolset.add_object(converter, object, html.as_bytes()).unwrap();
        assert!(toolset.perform_conversion(converter).unwrap());
        let out = toolset.get_output(converter).unwrap();
        toolset.destroy_converter(converter).unwrap();
        out
    }

    #[test]
    fn test_stub_produces_pdf_shaped_output() {
        let mut toolset = StubToolset::new(Duration::ZERO);
        toolset.load(None).unwrap();
        let out = convert_once(&mut toolset, "<p>hello</p>");
        assert!(out.starts_with(b"%PDF-1.4"));
        assert!(out.ends_with(b"%%EOF\n"));
    }

    #[test]
    fn test_probe_counts_executions() {
        let probe = StubProbe::new();
        let mut toolset = StubToolset::with_probe(Duration::ZERO, probe.clone());
        toolset.load(None).unwrap();
        convert_once(&mut toolset, "<p>a</p>");
        convert_once(&mut toolset, "<p>b</p>");
        assert_eq!(probe.executed(), 2);
        assert_eq!(probe.active(), 0);
        assert_eq!(probe.max_active(), 1);
    }

    #[test]
    fn test_instances_distinguishable() {
        let probe = StubProbe::new();
        let first = StubToolset::with_probe(Duration::ZERO, probe.clone());
        let second = StubToolset::with_probe(Duration::ZERO, probe.clone());
        assert_ne!(first.instance_id(), second.instance_id());
        assert_eq!(probe.instances(), 2);
    }

    #[test]
    fn test_conversion_without_objects_reports_failure() {
        let mut toolset = StubToolset::new(Duration::ZERO);
        toolset.load(None).unwrap();
        let global = toolset.create_global_settings().unwrap();
        let converter = toolset.create_converter(global).unwrap();
        assert!(!toolset.perform_conversion(converter).unwrap());
    }

    #[test]
    fn test_calls_fail_before_load() {
        let mut toolset = StubToolset::new(Duration::ZERO);
        assert!(toolset.create_global_settings().is_err());
    }
}
