//! Pre-fork engine warmup.
//!
//! The supervisor calls this once before forking worker children: the
//! engine library is loaded with global visibility and its one-time
//! initializer primes caches that stay valid across `fork`, so children
//! share the read-only pages instead of rebuilding them per process.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::path::Path;

use crate::error::{KitError, Result};

use super::ffi::{self, PreInitFn};

/// User-profile URL handed to the engine; resolves inside the jail.
pub const USER_PROFILE_URL: &str = "file:///user";

/// Load the engine library from `<lo_template>/program` and run
/// `lok_preinit`.
///
/// On success the library handle is deliberately leaked so the mapping
/// survives into forked children. The supervisor must not fork worker
/// children when this fails.
pub fn global_preinit(lo_template: &str) -> Result<()> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

    let program_dir = Path::new(lo_template).join("program");
    let merged = program_dir.join(ffi::LIB_MERGED);
    let app = program_dir.join(ffi::LIB_APP);

    let path = if merged.exists() {
        merged
    } else if app.exists() {
        app
    } else {
        return Err(KitError::Engine(format!(
            "neither {} nor {} exists in {}",
            ffi::LIB_MERGED,
            ffi::LIB_APP,
            program_dir.display()
        )));
    };

    tracing::trace!("dlopen({}, RTLD_GLOBAL|RTLD_NOW)", path.display());
    let library = unsafe { UnixLibrary::open(Some(&path), RTLD_GLOBAL | RTLD_NOW)? };

    let install_path = program_dir.to_string_lossy().into_owned();
    let result = unsafe {
        let preinit: libloading::os::unix::Symbol<PreInitFn> = library.get(ffi::PREINIT_SYMBOL)?;
        let install = CString::new(install_path.as_str())
            .map_err(|_| KitError::Engine("embedded NUL in install path".into()))?;
        let profile = CString::new(USER_PROFILE_URL).expect("static string");
        tracing::trace!("lok_preinit({install_path}, {USER_PROFILE_URL})");
        preinit(install.as_ptr(), profile.as_ptr())
    };

    if result != 0 {
        return Err(KitError::Engine(format!(
            "lok_preinit in {} returned {result}",
            path.display()
        )));
    }

    // Keep the engine mapped for every child forked after us.
    std::mem::forget(library);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preinit_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("program")).unwrap();
        let err = global_preinit(dir.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains(ffi::LIB_MERGED));
    }
}
