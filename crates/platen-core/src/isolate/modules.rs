//! Loaded-module verification and forced release.
//!
//! A native library can stay mapped in the process even after its wrapper
//! reports a clean unload. These helpers check the process's loaded-module
//! state for a specific path and force-release lingering references a
//! bounded number of times before the caller gives up and logs.

use std::path::Path;

/// Whether `module` is currently mapped into this process.
#[cfg(target_os = "linux")]
pub fn is_mapped(module: &Path) -> bool {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return false;
    };
    // Mappings list fully resolved paths.
    let module = module.canonicalize().unwrap_or_else(|_| module.to_path_buf());
    let needle = module.to_string_lossy();
    maps.lines().any(|line| line.ends_with(needle.as_ref()))
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn is_mapped(module: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let Ok(path) = std::ffi::CString::new(module.as_os_str().as_bytes()) else {
        return false;
    };
    // RTLD_NOLOAD hands back a handle only if the module is already loaded.
    let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_LAZY) };
    if handle.is_null() {
        false
    } else {
        unsafe { libc::dlclose(handle) };
        true
    }
}

#[cfg(windows)]
pub fn is_mapped(module: &Path) -> bool {
    module_handle(module).is_some()
}

/// Drop one outstanding reference on `module`, if the loader still holds
/// any. Returns whether a reference was found.
#[cfg(unix)]
fn release_once(module: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let Ok(path) = std::ffi::CString::new(module.as_os_str().as_bytes()) else {
        return false;
    };
    let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_LAZY) };
    if handle.is_null() {
        return false;
    }
    // Once for the probe reference, once for the lingering one.
    unsafe {
        libc::dlclose(handle);
        libc::dlclose(handle);
    }
    true
}

#[cfg(windows)]
fn module_handle(module: &Path) -> Option<windows::Win32::Foundation::HMODULE> {
    use std::os::windows::ffi::OsStrExt;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::core::PCWSTR;

    let wide: Vec<u16> = module.as_os_str().encode_wide().chain(Some(0)).collect();
    unsafe { GetModuleHandleW(PCWSTR(wide.as_ptr())) }.ok()
}

#[cfg(windows)]
fn release_once(module: &Path) -> bool {
    use windows::Win32::System::LibraryLoader::FreeLibrary;

    match module_handle(module) {
        Some(handle) => {
            let _ = unsafe { FreeLibrary(handle) };
            true
        }
        None => false,
    }
}

/// Verify `module` is gone; while it remains mapped, force-release it up to
/// `attempts` times. Returns whether the module ended up unmapped.
pub fn force_unload(module: &Path, attempts: usize) -> bool {
    for attempt in 0..attempts {
        if !is_mapped(module) {
            return true;
        }
        tracing::debug!(
            attempt,
            module = %module.display(),
            "module still mapped, forcing release"
        );
        if !release_once(module) {
            break;
        }
    }
    !is_mapped(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_current_exe_is_mapped() {
        let exe = std::env::current_exe().unwrap();
        assert!(is_mapped(&exe));
    }

    #[test]
    fn test_missing_module_is_not_mapped() {
        assert!(!is_mapped(Path::new("/nonexistent/libplaten-missing.so")));
    }

    #[test]
    fn test_force_unload_of_missing_module_succeeds() {
        assert!(force_unload(Path::new("/nonexistent/libplaten-missing.so"), 10));
    }
}
