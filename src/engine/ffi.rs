//! C ABI of the office-document engine.
//!
//! The engine is a shared library exposing two entry symbols and two
//! vtable-based handle types. A handle's first field is a pointer to its
//! class struct; every capability the worker uses is a function pointer in
//! one of the two classes.

#![allow(unsafe_code)]
#![allow(dead_code)] // the constants cover the engine's full callback surface

use std::os::raw::{c_char, c_int, c_uchar, c_ulonglong, c_void};

/// Callback types emitted by the engine.
pub const CALLBACK_INVALIDATE_TILES: c_int = 0;
pub const CALLBACK_INVALIDATE_VISIBLE_CURSOR: c_int = 1;
pub const CALLBACK_CELL_CURSOR: c_int = 17;
pub const CALLBACK_DOCUMENT_PASSWORD: c_int = 20;
pub const CALLBACK_DOCUMENT_PASSWORD_TO_MODIFY: c_int = 21;
pub const CALLBACK_INVALIDATE_VIEW_CURSOR: c_int = 24;
pub const CALLBACK_CELL_VIEW_CURSOR: c_int = 26;

/// Optional-feature bits accepted by `set_optional_features`.
pub const FEATURE_DOCUMENT_PASSWORD: c_ulonglong = 1 << 0;
pub const FEATURE_DOCUMENT_PASSWORD_TO_MODIFY: c_ulonglong = 1 << 1;
pub const FEATURE_PART_IN_INVALIDATION_CALLBACK: c_ulonglong = 1 << 2;

/// Engine callback: `(type, payload, userdata)`. The payload is a
/// NUL-terminated string owned by the engine, valid for the duration of
/// the call only.
pub type CallbackFn = unsafe extern "C" fn(n_type: c_int, payload: *const c_char, data: *mut c_void);

/// Vtable of the engine (office) handle.
#[repr(C)]
pub struct EngineClass {
    pub destroy: unsafe extern "C" fn(this: *mut EngineHandle),
    pub document_load:
        unsafe extern "C" fn(this: *mut EngineHandle, url: *const c_char) -> *mut EngineDocumentHandle,
    pub get_error: unsafe extern "C" fn(this: *mut EngineHandle) -> *mut c_char,
    pub register_callback:
        unsafe extern "C" fn(this: *mut EngineHandle, callback: Option<CallbackFn>, data: *mut c_void),
    pub set_optional_features: unsafe extern "C" fn(this: *mut EngineHandle, features: c_ulonglong),
    pub set_document_password:
        unsafe extern "C" fn(this: *mut EngineHandle, url: *const c_char, password: *const c_char),
    pub get_version_info: unsafe extern "C" fn(this: *mut EngineHandle) -> *mut c_char,
}

/// The engine (office) handle.
#[repr(C)]
pub struct EngineHandle {
    pub class: *const EngineClass,
}

/// Vtable of a loaded document handle.
#[repr(C)]
pub struct EngineDocumentClass {
    pub destroy: unsafe extern "C" fn(this: *mut EngineDocumentHandle),
    pub initialize_for_rendering:
        unsafe extern "C" fn(this: *mut EngineDocumentHandle, render_opts: *const c_char),
    pub register_callback: unsafe extern "C" fn(
        this: *mut EngineDocumentHandle,
        callback: Option<CallbackFn>,
        data: *mut c_void,
    ),
    pub get_views_count: unsafe extern "C" fn(this: *mut EngineDocumentHandle) -> c_int,
    pub get_view_ids:
        unsafe extern "C" fn(this: *mut EngineDocumentHandle, ids: *mut c_int, count: c_int) -> c_int,
    pub create_view: unsafe extern "C" fn(this: *mut EngineDocumentHandle) -> c_int,
    pub destroy_view: unsafe extern "C" fn(this: *mut EngineDocumentHandle, view_id: c_int),
    pub set_view: unsafe extern "C" fn(this: *mut EngineDocumentHandle, view_id: c_int),
    pub get_view: unsafe extern "C" fn(this: *mut EngineDocumentHandle) -> c_int,
    pub get_tile_mode: unsafe extern "C" fn(this: *mut EngineDocumentHandle) -> c_int,
    #[allow(clippy::type_complexity)]
    pub paint_part_tile: unsafe extern "C" fn(
        this: *mut EngineDocumentHandle,
        buffer: *mut c_uchar,
        part: c_int,
        canvas_width: c_int,
        canvas_height: c_int,
        tile_pos_x: c_int,
        tile_pos_y: c_int,
        tile_width: c_int,
        tile_height: c_int,
    ),
    pub get_command_values:
        unsafe extern "C" fn(this: *mut EngineDocumentHandle, command: *const c_char) -> *mut c_char,
}

/// A loaded document handle.
#[repr(C)]
pub struct EngineDocumentHandle {
    pub class: *const EngineDocumentClass,
}

/// `lok_init_2(install_path, user_profile_url)`: create the engine handle.
pub type InitFn =
    unsafe extern "C" fn(install_path: *const c_char, user_profile_url: *const c_char) -> *mut EngineHandle;

/// `lok_preinit(install_path, user_profile_url)`: one-time pre-fork warmup,
/// zero on success.
pub type PreInitFn =
    unsafe extern "C" fn(install_path: *const c_char, user_profile_url: *const c_char) -> c_int;

/// Preferred (merged) engine library filename.
pub const LIB_MERGED: &str = "libmergedlo.so";

/// Standalone app library filename, used when no merged build is present.
pub const LIB_APP: &str = "libsofficeapp.so";

pub const INIT_SYMBOL: &[u8] = b"lok_init_2\0";
pub const PREINIT_SYMBOL: &[u8] = b"lok_preinit\0";
