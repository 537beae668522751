//! In-process binding to the wkhtmltox shared library.
//!
//! The engine is single-threaded and non-reentrant; one loaded instance
//! serves one conversion at a time, always from the thread that owns the
//! [`NativeToolset`]. Unloading is best-effort: the library sometimes stays
//! mapped after a clean-looking release, so `unload` verifies the module is
//! gone and retries a bounded number of forced releases before downgrading
//! to a warning.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_int, c_long, c_void};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use libloading::Library;

use crate::error::{Error, Result};
use crate::isolate::modules;

use super::events::{ConversionEvent, EventSink};
use super::registry::DelegateRegistry;
use super::{ConverterHandle, SettingsHandle, Toolset};

#[cfg(target_os = "windows")]
const ENGINE_LIBRARY: &str = "wkhtmltox.dll";
#[cfg(target_os = "macos")]
const ENGINE_LIBRARY: &str = "libwkhtmltox.dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const ENGINE_LIBRARY: &str = "libwkhtmltox.so";

/// Buffer size for settings reads; matches the engine's documented maximum.
const SETTING_BUF_LEN: usize = 2048;

/// How many forced-release rounds to attempt before giving up on a module
/// that refuses to unmap.
const UNLOAD_ATTEMPTS: usize = 10;

type InitFn = unsafe extern "C" fn(c_int) -> c_int;
type DeinitFn = unsafe extern "C" fn() -> c_int;
type CreateSettingsFn = unsafe extern "C" fn() -> *mut c_void;
type SetSettingFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> c_int;
type GetSettingFn = unsafe extern "C" fn(*mut c_void, *const c_char, *mut c_char, c_int) -> c_int;
type CreateConverterFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type DestroyConverterFn = unsafe extern "C" fn(*mut c_void);
type AddObjectFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *const c_char);
type ConvertFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type GetOutputFn = unsafe extern "C" fn(*mut c_void, *mut *const u8) -> c_long;
type HttpErrorCodeFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type CurrentPhaseFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type PhaseDescriptionFn = unsafe extern "C" fn(*mut c_void, c_int) -> *const c_char;

type StrCallback = unsafe extern "C" fn(*mut c_void, *const c_char);
type IntCallback = unsafe extern "C" fn(*mut c_void, c_int);
type VoidCallback = unsafe extern "C" fn(*mut c_void);
type SetStrCallbackFn = unsafe extern "C" fn(*mut c_void, Option<StrCallback>);
type SetIntCallbackFn = unsafe extern "C" fn(*mut c_void, Option<IntCallback>);
type SetVoidCallbackFn = unsafe extern "C" fn(*mut c_void, Option<VoidCallback>);

/// The engine's symbol table, resolved once at load.
///
/// Plain fn pointers copied out of `libloading::Symbol`s; valid only while
/// the owning `Library` stays alive, which `NativeToolset` guarantees by
/// dropping the bindings before the library.
#[derive(Clone, Copy)]
struct Bindings {
    init: InitFn,
    deinit: DeinitFn,
    create_global_settings: CreateSettingsFn,
    create_object_settings: CreateSettingsFn,
    set_global_setting: SetSettingFn,
    get_global_setting: GetSettingFn,
    set_object_setting: SetSettingFn,
    get_object_setting: GetSettingFn,
    create_converter: CreateConverterFn,
    destroy_converter: DestroyConverterFn,
    add_object: AddObjectFn,
    convert: ConvertFn,
    get_output: GetOutputFn,
    http_error_code: HttpErrorCodeFn,
    current_phase: CurrentPhaseFn,
    phase_description: PhaseDescriptionFn,
    set_warning_callback: SetStrCallbackFn,
    set_error_callback: SetStrCallbackFn,
    set_phase_changed_callback: SetVoidCallbackFn,
    set_progress_changed_callback: SetIntCallbackFn,
    set_finished_callback: SetIntCallbackFn,
}

impl Bindings {
    fn resolve(library: &Library) -> Result<Self> {
        // Safety: symbol names and signatures match the engine's published
        // C ABI; the returned fn pointers outlive this call only inside
        // NativeToolset, which keeps the library loaded.
        unsafe {
            Ok(Self {
                init: *library.get(b"wkhtmltopdf_init\0")?,
                deinit: *library.get(b"wkhtmltopdf_deinit\0")?,
                create_global_settings: *library.get(b"wkhtmltopdf_create_global_settings\0")?,
                create_object_settings: *library.get(b"wkhtmltopdf_create_object_settings\0")?,
                set_global_setting: *library.get(b"wkhtmltopdf_set_global_setting\0")?,
                get_global_setting: *library.get(b"wkhtmltopdf_get_global_setting\0")?,
                set_object_setting: *library.get(b"wkhtmltopdf_set_object_setting\0")?,
                get_object_setting: *library.get(b"wkhtmltopdf_get_object_setting\0")?,
                create_converter: *library.get(b"wkhtmltopdf_create_converter\0")?,
                destroy_converter: *library.get(b"wkhtmltopdf_destroy_converter\0")?,
                add_object: *library.get(b"wkhtmltopdf_add_object\0")?,
                convert: *library.get(b"wkhtmltopdf_convert\0")?,
                get_output: *library.get(b"wkhtmltopdf_get_output\0")?,
                http_error_code: *library.get(b"wkhtmltopdf_http_error_code\0")?,
                current_phase: *library.get(b"wkhtmltopdf_current_phase\0")?,
                phase_description: *library.get(b"wkhtmltopdf_phase_description\0")?,
                set_warning_callback: *library.get(b"wkhtmltopdf_set_warning_callback\0")?,
                set_error_callback: *library.get(b"wkhtmltopdf_set_error_callback\0")?,
                set_phase_changed_callback: *library
                    .get(b"wkhtmltopdf_set_phase_changed_callback\0")?,
                set_progress_changed_callback: *library
                    .get(b"wkhtmltopdf_set_progress_changed_callback\0")?,
                set_finished_callback: *library.get(b"wkhtmltopdf_set_finished_callback\0")?,
            })
        }
    }
}

/// Phase-query pointers the callback trampolines need to enrich events.
/// Set while an engine is loaded; the engine cannot be loaded twice in one
/// process, so a single slot suffices.
static PHASE_QUERIES: Mutex<Option<(CurrentPhaseFn, PhaseDescriptionFn)>> = Mutex::new(None);

unsafe extern "C" fn warning_trampoline(converter: *mut c_void, message: *const c_char) {
    let message = unsafe { cstr_to_string(message) };
    DelegateRegistry::global().dispatch(converter as usize, ConversionEvent::Warning { message });
}

unsafe extern "C" fn error_trampoline(converter: *mut c_void, message: *const c_char) {
    let message = unsafe { cstr_to_string(message) };
    DelegateRegistry::global().dispatch(converter as usize, ConversionEvent::Error { message });
}

unsafe extern "C" fn phase_changed_trampoline(converter: *mut c_void) {
    let (phase, description) = match *PHASE_QUERIES.lock().unwrap() {
        Some((current_phase, phase_description)) => unsafe {
            let phase = current_phase(converter);
            (phase, cstr_to_string(phase_description(converter, phase)))
        },
        None => (-1, String::new()),
    };
    DelegateRegistry::global().dispatch(
        converter as usize,
        ConversionEvent::PhaseChange { phase, description },
    );
}

unsafe extern "C" fn progress_changed_trampoline(converter: *mut c_void, progress: c_int) {
    DelegateRegistry::global().dispatch(
        converter as usize,
        ConversionEvent::ProgressChange {
            progress,
            description: format!("{}%", progress),
        },
    );
}

unsafe extern "C" fn finished_trampoline(converter: *mut c_void, status: c_int) {
    DelegateRegistry::global().dispatch(
        converter as usize,
        ConversionEvent::Finish { success: status != 0 },
    );
}

unsafe fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}

/// In-process [`Toolset`] over the engine's shared library.
pub struct NativeToolset {
    deployment: PathBuf,
    library: Option<Library>,
    bindings: Option<Bindings>,
    module_path: Option<PathBuf>,
    /// Opaque id → native pointer, for settings and converters alike.
    handles: HashMap<u64, *mut c_void>,
    next_handle: u64,
}

// SAFETY: the raw pointers in `handles` name engine-side objects that are
// only ever touched through this instance, and the executor confines the
// instance to its dedicated thread for the instance's entire lifetime.
unsafe impl Send for NativeToolset {}

impl NativeToolset {
    /// Binding rooted at `deployment`, not yet loaded.
    pub fn new(deployment: impl Into<PathBuf>) -> Self {
        Self {
            deployment: deployment.into(),
            library: None,
            bindings: None,
            module_path: None,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.library.is_some()
    }

    /// Full path of the loaded module, if any.
    pub fn module_path(&self) -> Option<&Path> {
        self.module_path.as_deref()
    }

    fn bindings(&self) -> Result<Bindings> {
        self.bindings
            .ok_or_else(|| Error::Conversion("engine not loaded".to_string()))
    }

    fn store(&mut self, ptr: *mut c_void) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id, ptr);
        id
    }

    fn ptr(&self, id: u64) -> Result<*mut c_void> {
        self.handles
            .get(&id)
            .copied()
            .ok_or_else(|| Error::Conversion(format!("unknown engine handle {}", id)))
    }

    fn set_setting(&mut self, f: SetSettingFn, settings: SettingsHandle, name: &str, value: &str)
    -> Result<bool> {
        let ptr = self.ptr(settings.0)?;
        let name = CString::new(name)
            .map_err(|_| Error::Conversion("setting name contains NUL".to_string()))?;
        let value = CString::new(value)
            .map_err(|_| Error::Conversion("setting value contains NUL".to_string()))?;
        // Safety: valid settings pointer, NUL-terminated strings.
        let accepted = unsafe { f(ptr, name.as_ptr(), value.as_ptr()) };
        Ok(accepted == 1)
    }

    fn get_setting(&mut self, f: GetSettingFn, settings: SettingsHandle, name: &str)
    -> Result<String> {
        let ptr = self.ptr(settings.0)?;
        let name = CString::new(name)
            .map_err(|_| Error::Conversion("setting name contains NUL".to_string()))?;
        let mut buf = [0u8; SETTING_BUF_LEN];
        // Safety: the engine writes at most `len` bytes, NUL-terminated.
        unsafe {
            f(ptr, name.as_ptr(), buf.as_mut_ptr() as *mut c_char, buf.len() as c_int);
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// The engine's HTTP error code for the last conversion on `converter`.
    pub fn http_error_code(&mut self, converter: ConverterHandle) -> Result<i32> {
        let bindings = self.bindings()?;
        let ptr = self.ptr(converter.0)?;
        // Safety: valid converter pointer.
        Ok(unsafe { (bindings.http_error_code)(ptr) })
    }
}

impl Toolset for NativeToolset {
    fn load(&mut self, deployment: Option<&Path>) -> Result<()> {
        if self.library.is_some() {
            return Ok(());
        }
        if let Some(path) = deployment {
            self.deployment = path.to_path_buf();
        }

        let module_path = self.deployment.join(ENGINE_LIBRARY);
        tracing::debug!(module = %module_path.display(), "loading engine library");

        // Safety: loading the engine module; its initializers are the
        // documented entry points called below.
        let library = unsafe { Library::new(&module_path) }?;
        let bindings = Bindings::resolve(&library)?;

        // Safety: init(0) per the engine contract (no graphics system hook).
        let rc = unsafe { (bindings.init)(0) };
        if rc != 1 {
            return Err(Error::Construction(format!(
                "engine init returned {} for {}",
                rc,
                module_path.display()
            )));
        }

        *PHASE_QUERIES.lock().unwrap() = Some((bindings.current_phase, bindings.phase_description));
        self.module_path = Some(module_path);
        self.bindings = Some(bindings);
        self.library = Some(library);
        tracing::info!(module = ?self.module_path, "engine loaded");
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        let Some(library) = self.library.take() else {
            tracing::debug!("nothing to unload");
            return Ok(());
        };
        let bindings = self.bindings.take();
        *PHASE_QUERIES.lock().unwrap() = None;
        self.handles.clear();

        if let Some(bindings) = bindings {
            // Safety: engine loaded; deinit is the matching teardown call.
            let rc = unsafe { (bindings.deinit)() };
            if rc != 1 {
                tracing::warn!("engine deinit returned {}", rc);
            }
        }
        drop(library);

        // The wrapper reporting success does not mean the module is gone;
        // verify and force-release while it remains mapped.
        if let Some(module_path) = self.module_path.take()
            && !modules::force_unload(&module_path, UNLOAD_ATTEMPTS)
        {
            tracing::warn!(
                module = %module_path.display(),
                "engine module still mapped after {} release attempts",
                UNLOAD_ATTEMPTS
            );
        }
        Ok(())
    }

    fn create_global_settings(&mut self) -> Result<SettingsHandle> {
        let bindings = self.bindings()?;
        // Safety: engine loaded.
        let ptr = unsafe { (bindings.create_global_settings)() };
        Ok(SettingsHandle(self.store(ptr)))
    }

    fn set_global_setting(&mut self, settings: SettingsHandle, name: &str, value: &str)
    -> Result<bool> {
        let f = self.bindings()?.set_global_setting;
        self.set_setting(f, settings, name, value)
    }

    fn get_global_setting(&mut self, settings: SettingsHandle, name: &str) -> Result<String> {
        let f = self.bindings()?.get_global_setting;
        self.get_setting(f, settings, name)
    }

    fn create_object_settings(&mut self) -> Result<SettingsHandle> {
        let bindings = self.bindings()?;
        // Safety: engine loaded.
        let ptr = unsafe { (bindings.create_object_settings)() };
        Ok(SettingsHandle(self.store(ptr)))
    }

    fn set_object_setting(&mut self, settings: SettingsHandle, name: &str, value: &str)
    -> Result<bool> {
        let f = self.bindings()?.set_object_setting;
        self.set_setting(f, settings, name, value)
    }

    fn get_object_setting(&mut self, settings: SettingsHandle, name: &str) -> Result<String> {
        let f = self.bindings()?.get_object_setting;
        self.get_setting(f, settings, name)
    }

    fn create_converter(&mut self, global: SettingsHandle) -> Result<ConverterHandle> {
        let bindings = self.bindings()?;
        let global_ptr = self.ptr(global.0)?;
        // Safety: valid global-settings pointer. The converter takes
        // ownership of the settings object.
        let ptr = unsafe { (bindings.create_converter)(global_ptr) };
        self.handles.remove(&global.0);
        Ok(ConverterHandle(self.store(ptr)))
    }

    fn register_events(&mut self, converter: ConverterHandle, sink: EventSink) -> Result<()> {
        let bindings = self.bindings()?;
        let ptr = self.ptr(converter.0)?;
        // The registry entry keeps `sink` alive for as long as the native
        // converter exists; the trampolines find it by converter pointer.
        DelegateRegistry::global().register(ptr as usize, sink);
        // Safety: valid converter pointer; trampolines are 'static.
        unsafe {
            (bindings.set_warning_callback)(ptr, Some(warning_trampoline));
            (bindings.set_error_callback)(ptr, Some(error_trampoline));
            (bindings.set_phase_changed_callback)(ptr, Some(phase_changed_trampoline));
            (bindings.set_progress_changed_callback)(ptr, Some(progress_changed_trampoline));
            (bindings.set_finished_callback)(ptr, Some(finished_trampoline));
        }
        Ok(())
    }

    fn add_object(&mut self, converter: ConverterHandle, object: SettingsHandle, content: &[u8])
    -> Result<()> {
        let bindings = self.bindings()?;
        let converter_ptr = self.ptr(converter.0)?;
        let object_ptr = self.ptr(object.0)?;
        let content = CString::new(content)
            .map_err(|_| Error::Conversion("object content contains NUL".to_string()))?;
        // Safety: valid pointers; the engine copies the content. The
        // converter takes ownership of the object settings.
        unsafe { (bindings.add_object)(converter_ptr, object_ptr, content.as_ptr()) };
        self.handles.remove(&object.0);
        Ok(())
    }

    fn perform_conversion(&mut self, converter: ConverterHandle) -> Result<bool> {
        let bindings = self.bindings()?;
        let ptr = self.ptr(converter.0)?;
        tracing::debug!(converter = converter.0, "starting conversion");
        // Safety: valid converter pointer; this call blocks until the
        // engine finishes and may invoke the registered trampolines.
        Ok(unsafe { (bindings.convert)(ptr) } != 0)
    }

    fn get_output(&mut self, converter: ConverterHandle) -> Result<Vec<u8>> {
        let bindings = self.bindings()?;
        let ptr = self.ptr(converter.0)?;
        let mut data: *const u8 = std::ptr::null();
        // Safety: valid converter pointer; the engine owns `data` until the
        // converter is destroyed, so we copy it out immediately.
        let len = unsafe { (bindings.get_output)(ptr, &mut data) };
        if data.is_null() || len <= 0 {
            return Err(Error::Conversion("engine returned no output".to_string()));
        }
        Ok(unsafe { std::slice::from_raw_parts(data, len as usize) }.to_vec())
    }

    fn destroy_converter(&mut self, converter: ConverterHandle) -> Result<()> {
        let bindings = self.bindings()?;
        let ptr = self.ptr(converter.0)?;
        // Safety: valid converter pointer, destroyed exactly once.
        unsafe { (bindings.destroy_converter)(ptr) };
        self.handles.remove(&converter.0);
        DelegateRegistry::global().unregister(ptr as usize);
        Ok(())
    }
}

impl Drop for NativeToolset {
    fn drop(&mut self) {
        if self.library.is_some()
            && let Err(e) = self.unload()
        {
            tracing::warn!("engine unload on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_fails_for_missing_deployment() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut toolset = NativeToolset::new(temp.path());
        assert!(toolset.load(None).is_err());
        assert!(!toolset.is_loaded());
    }

    #[test]
    fn test_unload_without_load_is_noop() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut toolset = NativeToolset::new(temp.path());
        assert!(toolset.unload().is_ok());
    }

    #[test]
    fn test_calls_fail_before_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut toolset = NativeToolset::new(temp.path());
        assert!(toolset.create_global_settings().is_err());
    }
}
