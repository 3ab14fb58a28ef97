//! Safe wrappers around the office-document engine.
//!
//! The engine is not thread-safe and not reentrant: every call through a
//! handle happens while that handle's mutex is held. The wrappers expose a
//! guard type per handle; all engine capabilities are methods on the guard,
//! so holding a guard for a sequence of calls is the locking strategy.

#![allow(unsafe_code)]

pub mod ffi;
pub mod preinit;

#[cfg(test)]
pub mod testkit;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{KitError, Result};
use crate::pngenc::TileMode;
use ffi::{CallbackFn, EngineDocumentHandle, EngineHandle, InitFn};

/// Copy an engine-allocated C string and release it with `free(3)`.
///
/// # Safety
/// `ptr` must be NUL-terminated and allocated by the engine's allocator,
/// or null.
unsafe fn take_engine_string(ptr: *mut c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let copied = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
    unsafe { libc::free(ptr.cast::<c_void>()) };
    Some(copied)
}

fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| KitError::Engine(format!("embedded NUL in [{value}]")))
}

/// The engine (office) handle.
///
/// Owns the shared library for the process lifetime; dropping an `Office`
/// does not unload the engine.
pub struct Office {
    inner: Mutex<OfficeGuardState>,
    // Same pointer as in `inner`; read only by the reentrant password path,
    // which runs on the thread already holding the mutex.
    raw_handle: *mut EngineHandle,
    // Keeps the dlopen'd engine mapped. None when the handle was
    // fabricated in-process (tests).
    _library: Option<libloading::Library>,
}

struct OfficeGuardState {
    handle: *mut EngineHandle,
}

// The raw handle is only touched through the mutex (see
// `set_document_password_reentrant` for the one exception).
unsafe impl Send for OfficeGuardState {}
unsafe impl Send for Office {}
unsafe impl Sync for Office {}

impl Office {
    /// Load the engine library from `<install_dir>` and initialize it.
    ///
    /// Prefers the merged library, falls back to the standalone app
    /// library; resolves `lok_init_2` and calls it with the install
    /// directory and the user-profile URL.
    pub fn init(install_dir: &str, user_profile_url: &str) -> Result<Self> {
        let library = open_engine_library(Path::new(install_dir))?;

        let handle = unsafe {
            let init: libloading::Symbol<'_, InitFn> = library.get(ffi::INIT_SYMBOL)?;
            let install = to_cstring(install_dir)?;
            let profile = to_cstring(user_profile_url)?;
            init(install.as_ptr(), profile.as_ptr())
        };
        if handle.is_null() {
            return Err(KitError::Engine(format!(
                "engine initialization failed for install dir [{install_dir}]"
            )));
        }

        Ok(Self {
            inner: Mutex::new(OfficeGuardState { handle }),
            raw_handle: handle,
            _library: Some(library),
        })
    }

    /// Wrap a handle created in-process, without a backing library.
    #[allow(dead_code)] // used by the test engine
    pub fn from_raw(handle: *mut EngineHandle) -> Self {
        Self {
            inner: Mutex::new(OfficeGuardState { handle }),
            raw_handle: handle,
            _library: None,
        }
    }

    /// Take the engine mutex; all office capabilities live on the guard.
    pub fn lock(&self) -> OfficeGuard<'_> {
        OfficeGuard {
            state: self.inner.lock().unwrap(),
        }
    }

    /// Submit a password without taking the engine mutex.
    ///
    /// Only valid from the engine's password callback, which fires on the
    /// thread that is inside `document_load` and already holds the mutex;
    /// locking again there would deadlock.
    pub unsafe fn set_document_password_reentrant(&self, url: &str, password: Option<&str>) {
        let Ok(url) = to_cstring(url) else { return };
        let password = password.and_then(|p| to_cstring(p).ok());
        let password_ptr = password.as_ref().map_or(std::ptr::null(), |p| p.as_ptr());
        let handle = self.raw_handle;
        unsafe { ((*(*handle).class).set_document_password)(handle, url.as_ptr(), password_ptr) };
    }
}

/// Exclusive access to the office handle.
pub struct OfficeGuard<'a> {
    state: MutexGuard<'a, OfficeGuardState>,
}

impl OfficeGuard<'_> {
    fn handle(&self) -> *mut EngineHandle {
        self.state.handle
    }

    fn class(&self) -> &ffi::EngineClass {
        unsafe { &*(*self.handle()).class }
    }

    /// Load a document; `None` when the engine rejected it (wrong format,
    /// password pending, ...). Password callbacks fire synchronously from
    /// inside this call.
    pub fn document_load(&self, url: &str) -> Result<Option<EngineDocument>> {
        let url = to_cstring(url)?;
        let doc = unsafe { (self.class().document_load)(self.handle(), url.as_ptr()) };
        if doc.is_null() {
            return Ok(None);
        }
        Ok(Some(EngineDocument::from_raw(doc)))
    }

    pub fn get_error(&self) -> String {
        let ptr = unsafe { (self.class().get_error)(self.handle()) };
        unsafe { take_engine_string(ptr) }.unwrap_or_default()
    }

    pub fn register_callback(&self, callback: Option<CallbackFn>, data: *mut c_void) {
        unsafe { (self.class().register_callback)(self.handle(), callback, data) };
    }

    pub fn set_optional_features(&self, features: u64) {
        unsafe { (self.class().set_optional_features)(self.handle(), features) };
    }

    pub fn get_version_info(&self) -> String {
        let ptr = unsafe { (self.class().get_version_info)(self.handle()) };
        unsafe { take_engine_string(ptr) }.unwrap_or_default()
    }
}

/// A loaded document handle, mutex-guarded like [`Office`].
pub struct EngineDocument {
    inner: Mutex<DocGuardState>,
}

struct DocGuardState {
    handle: *mut EngineDocumentHandle,
}

unsafe impl Send for DocGuardState {}

impl EngineDocument {
    fn from_raw(handle: *mut EngineDocumentHandle) -> Self {
        Self {
            inner: Mutex::new(DocGuardState { handle }),
        }
    }

    /// Take the document mutex; all document capabilities live on the guard.
    pub fn lock(&self) -> DocGuard<'_> {
        DocGuard {
            state: self.inner.lock().unwrap(),
        }
    }
}

/// Exclusive access to a loaded document.
pub struct DocGuard<'a> {
    state: MutexGuard<'a, DocGuardState>,
}

impl DocGuard<'_> {
    fn handle(&self) -> *mut EngineDocumentHandle {
        self.state.handle
    }

    fn class(&self) -> &ffi::EngineDocumentClass {
        unsafe { &*(*self.handle()).class }
    }

    pub fn initialize_for_rendering(&self, render_opts: &str) -> Result<()> {
        let opts = to_cstring(render_opts)?;
        unsafe { (self.class().initialize_for_rendering)(self.handle(), opts.as_ptr()) };
        Ok(())
    }

    pub fn register_callback(&self, callback: Option<CallbackFn>, data: *mut c_void) {
        unsafe { (self.class().register_callback)(self.handle(), callback, data) };
    }

    pub fn get_views_count(&self) -> i32 {
        unsafe { (self.class().get_views_count)(self.handle()) }
    }

    /// Current view ids, straight from the engine.
    pub fn get_view_ids(&self) -> Vec<i32> {
        let count = self.get_views_count().max(0);
        let mut ids = vec![0 as c_int; count as usize];
        let filled = unsafe { (self.class().get_view_ids)(self.handle(), ids.as_mut_ptr(), count) };
        ids.truncate(filled.clamp(0, count) as usize);
        ids
    }

    pub fn create_view(&self) -> i32 {
        unsafe { (self.class().create_view)(self.handle()) }
    }

    pub fn destroy_view(&self, view_id: i32) {
        unsafe { (self.class().destroy_view)(self.handle(), view_id) };
    }

    pub fn set_view(&self, view_id: i32) {
        unsafe { (self.class().set_view)(self.handle(), view_id) };
    }

    pub fn get_view(&self) -> i32 {
        unsafe { (self.class().get_view)(self.handle()) }
    }

    pub fn get_tile_mode(&self) -> Result<TileMode> {
        TileMode::from_raw(unsafe { (self.class().get_tile_mode)(self.handle()) })
    }

    /// Paint a document region into `buffer`, which must hold
    /// `4 * canvas_width * canvas_height` bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn paint_part_tile(
        &self,
        buffer: &mut [u8],
        part: i32,
        canvas_width: i32,
        canvas_height: i32,
        tile_pos_x: i32,
        tile_pos_y: i32,
        tile_width: i32,
        tile_height: i32,
    ) {
        debug_assert!(buffer.len() >= 4 * canvas_width as usize * canvas_height as usize);
        unsafe {
            (self.class().paint_part_tile)(
                self.handle(),
                buffer.as_mut_ptr(),
                part,
                canvas_width,
                canvas_height,
                tile_pos_x,
                tile_pos_y,
                tile_width,
                tile_height,
            )
        };
    }

    pub fn get_command_values(&self, command: &str) -> Result<Option<String>> {
        let command = to_cstring(command)?;
        let ptr = unsafe { (self.class().get_command_values)(self.handle(), command.as_ptr()) };
        Ok(unsafe { take_engine_string(ptr) })
    }
}

/// Open the engine shared library with global symbol visibility and
/// immediate binding, preferring the merged build.
fn open_engine_library(install_dir: &Path) -> Result<libloading::Library> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

    let merged = install_dir.join(ffi::LIB_MERGED);
    let app = install_dir.join(ffi::LIB_APP);
    let path = if merged.exists() {
        merged
    } else if app.exists() {
        app
    } else {
        return Err(KitError::Engine(format!(
            "neither {} nor {} exists in {}",
            ffi::LIB_MERGED,
            ffi::LIB_APP,
            install_dir.display()
        )));
    };

    tracing::trace!("dlopen({}, RTLD_GLOBAL|RTLD_NOW)", path.display());
    let library = unsafe { UnixLibrary::open(Some(&path), RTLD_GLOBAL | RTLD_NOW)? };
    Ok(library.into())
}
