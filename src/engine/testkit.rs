//! In-process fake engine for tests.
//!
//! Builds office/document handles over the same C ABI the real library
//! exports, backed by plain Rust state: views are a vector, paints fill a
//! deterministic pattern keyed on absolute twip coordinates (so a
//! sub-rectangle of a large paint is byte-identical to a small paint of the
//! same region), and password-protected documents drive the callback
//! handshake exactly like the real engine does during `document_load`.
//!
//! Handles are leaked; instances are test-lifetime only.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_uchar, c_ulonglong, c_void};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::Office;
use super::ffi::{
    CALLBACK_DOCUMENT_PASSWORD, CallbackFn, EngineClass, EngineDocumentClass,
    EngineDocumentHandle, EngineHandle,
};

pub const FAKE_VERSION_INFO: &str =
    r#"{"ProductName":"FakeOffice","ProductVersion":"5.1","BuildId":"0"}"#;

/// Fake engine configuration.
#[derive(Debug, Clone, Default)]
pub struct FakeConfig {
    /// Password callback type fired during load, if the document is
    /// protected (`CALLBACK_DOCUMENT_PASSWORD` or `..._TO_MODIFY`).
    pub password_type: Option<c_int>,
    /// The password that unlocks the document.
    pub password: Option<String>,
    /// Raw tile mode reported by `get_tile_mode` (0 = RGBA, 1 = BGRA).
    pub tile_mode: c_int,
    /// JSON returned for `.uno:TrackedChangeAuthors`.
    pub authors: Option<String>,
}

type CallbackSlot = Option<(CallbackFn, usize)>;

/// Shared state behind both fake handles.
pub struct FakeState {
    config: FakeConfig,
    global_cb: Mutex<CallbackSlot>,
    view_cbs: Mutex<HashMap<i32, (CallbackFn, usize)>>,
    views: Mutex<Vec<i32>>,
    current_view: AtomicI32,
    next_view: AtomicI32,
    features: Mutex<c_ulonglong>,
    /// Last password submission: outer None = never called,
    /// `Some(None)` = explicit null.
    submitted: Mutex<Option<Option<String>>>,
    pub load_calls: AtomicUsize,
    pub destroyed_views: Mutex<Vec<i32>>,
}

impl FakeState {
    fn new(config: FakeConfig) -> Self {
        Self {
            config,
            global_cb: Mutex::new(None),
            view_cbs: Mutex::new(HashMap::new()),
            views: Mutex::new(Vec::new()),
            current_view: AtomicI32::new(-1),
            next_view: AtomicI32::new(0),
            features: Mutex::new(0),
            submitted: Mutex::new(None),
            load_calls: AtomicUsize::new(0),
            destroyed_views: Mutex::new(Vec::new()),
        }
    }

    pub fn view_ids(&self) -> Vec<i32> {
        self.views.lock().unwrap().clone()
    }

    pub fn features(&self) -> c_ulonglong {
        *self.features.lock().unwrap()
    }

    pub fn has_view_callback(&self, view_id: i32) -> bool {
        self.view_cbs.lock().unwrap().contains_key(&view_id)
    }

    /// Fire the registered per-view callback, as the engine would from one
    /// of its internal threads.
    pub fn emit_view_callback(&self, view_id: i32, n_type: c_int, payload: &str) {
        let slot = self.view_cbs.lock().unwrap().get(&view_id).copied();
        if let Some((callback, data)) = slot {
            let payload = CString::new(payload).unwrap();
            unsafe { callback(n_type, payload.as_ptr(), data as *mut c_void) };
        }
    }

    /// Fire the registered global callback.
    pub fn emit_global_callback(&self, n_type: c_int, payload: &str) {
        let slot = *self.global_cb.lock().unwrap();
        if let Some((callback, data)) = slot {
            let payload = CString::new(payload).unwrap();
            unsafe { callback(n_type, payload.as_ptr(), data as *mut c_void) };
        }
    }
}

/// A fake engine: shared state plus an [`Office`] wrapper over the fake
/// handle.
pub struct FakeEngine {
    pub state: &'static FakeState,
    office: Arc<Office>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_config(FakeConfig::default())
    }

    pub fn password_protected(password_type: c_int, password: &str) -> Self {
        Self::with_config(FakeConfig {
            password_type: Some(password_type),
            password: Some(password.to_string()),
            ..FakeConfig::default()
        })
    }

    pub fn with_config(config: FakeConfig) -> Self {
        let state: &'static FakeState = Box::leak(Box::new(FakeState::new(config)));
        let office_handle: &'static mut FakeOffice = Box::leak(Box::new(FakeOffice {
            handle: EngineHandle { class: &OFFICE_CLASS },
            state,
        }));
        let office = Arc::new(Office::from_raw(std::ptr::from_mut(office_handle).cast()));
        Self { state, office }
    }

    pub fn office(&self) -> Arc<Office> {
        Arc::clone(&self.office)
    }
}

#[repr(C)]
struct FakeOffice {
    handle: EngineHandle,
    state: &'static FakeState,
}

#[repr(C)]
struct FakeDoc {
    handle: EngineDocumentHandle,
    state: &'static FakeState,
}

fn malloc_cstring(value: &str) -> *mut c_char {
    let bytes = value.as_bytes();
    unsafe {
        let ptr = libc::malloc(bytes.len() + 1).cast::<u8>();
        assert!(!ptr.is_null());
        ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        *ptr.add(bytes.len()) = 0;
        ptr.cast()
    }
}

unsafe fn office_state<'a>(this: *mut EngineHandle) -> &'a FakeState {
    unsafe { (*this.cast::<FakeOffice>()).state }
}

unsafe fn doc_state<'a>(this: *mut EngineDocumentHandle) -> &'a FakeState {
    unsafe { (*this.cast::<FakeDoc>()).state }
}

static OFFICE_CLASS: EngineClass = EngineClass {
    destroy: fake_office_destroy,
    document_load: fake_document_load,
    get_error: fake_get_error,
    register_callback: fake_office_register_callback,
    set_optional_features: fake_set_optional_features,
    set_document_password: fake_set_document_password,
    get_version_info: fake_get_version_info,
};

static DOC_CLASS: EngineDocumentClass = EngineDocumentClass {
    destroy: fake_doc_destroy,
    initialize_for_rendering: fake_initialize_for_rendering,
    register_callback: fake_doc_register_callback,
    get_views_count: fake_get_views_count,
    get_view_ids: fake_get_view_ids,
    create_view: fake_create_view,
    destroy_view: fake_destroy_view,
    set_view: fake_set_view,
    get_view: fake_get_view,
    get_tile_mode: fake_get_tile_mode,
    paint_part_tile: fake_paint_part_tile,
    get_command_values: fake_get_command_values,
};

unsafe extern "C" fn fake_office_destroy(_this: *mut EngineHandle) {}

unsafe extern "C" fn fake_document_load(
    this: *mut EngineHandle,
    url: *const c_char,
) -> *mut EngineDocumentHandle {
    let state = unsafe { office_state(this) };
    state.load_calls.fetch_add(1, Ordering::SeqCst);

    if let Some(password_type) = state.config.password_type {
        let url = unsafe { CStr::from_ptr(url) }.to_string_lossy().into_owned();
        // Ask for the password until the handler either gives the right
        // one or submits null; this is the real engine's handshake.
        loop {
            *state.submitted.lock().unwrap() = None;
            let slot = *state.global_cb.lock().unwrap();
            let Some((callback, data)) = slot else {
                return std::ptr::null_mut();
            };
            let payload = CString::new(url.as_str()).unwrap();
            unsafe { callback(password_type, payload.as_ptr(), data as *mut c_void) };

            match state.submitted.lock().unwrap().clone() {
                None | Some(None) => return std::ptr::null_mut(),
                Some(Some(given)) if Some(&given) == state.config.password.as_ref() => break,
                Some(Some(_)) => continue,
            }
        }
    }

    // Loading creates the first view.
    let view_id = state.next_view.fetch_add(1, Ordering::SeqCst);
    state.views.lock().unwrap().push(view_id);
    state.current_view.store(view_id, Ordering::SeqCst);

    let doc: &'static mut FakeDoc = Box::leak(Box::new(FakeDoc {
        handle: EngineDocumentHandle { class: &DOC_CLASS },
        state,
    }));
    std::ptr::from_mut(doc).cast()
}

unsafe extern "C" fn fake_get_error(_this: *mut EngineHandle) -> *mut c_char {
    malloc_cstring("")
}

unsafe extern "C" fn fake_office_register_callback(
    this: *mut EngineHandle,
    callback: Option<CallbackFn>,
    data: *mut c_void,
) {
    let state = unsafe { office_state(this) };
    *state.global_cb.lock().unwrap() = callback.map(|cb| (cb, data as usize));
}

unsafe extern "C" fn fake_set_optional_features(this: *mut EngineHandle, features: c_ulonglong) {
    let state = unsafe { office_state(this) };
    *state.features.lock().unwrap() = features;
}

unsafe extern "C" fn fake_set_document_password(
    this: *mut EngineHandle,
    _url: *const c_char,
    password: *const c_char,
) {
    let state = unsafe { office_state(this) };
    let submitted = if password.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(password) }.to_string_lossy().into_owned())
    };
    *state.submitted.lock().unwrap() = Some(submitted);
}

unsafe extern "C" fn fake_get_version_info(_this: *mut EngineHandle) -> *mut c_char {
    malloc_cstring(FAKE_VERSION_INFO)
}

unsafe extern "C" fn fake_doc_destroy(_this: *mut EngineDocumentHandle) {}

unsafe extern "C" fn fake_initialize_for_rendering(
    _this: *mut EngineDocumentHandle,
    _render_opts: *const c_char,
) {
}

unsafe extern "C" fn fake_doc_register_callback(
    this: *mut EngineDocumentHandle,
    callback: Option<CallbackFn>,
    data: *mut c_void,
) {
    let state = unsafe { doc_state(this) };
    let current = state.current_view.load(Ordering::SeqCst);
    let mut cbs = state.view_cbs.lock().unwrap();
    match callback {
        Some(cb) => {
            cbs.insert(current, (cb, data as usize));
        }
        None => {
            cbs.remove(&current);
        }
    }
}

unsafe extern "C" fn fake_get_views_count(this: *mut EngineDocumentHandle) -> c_int {
    let state = unsafe { doc_state(this) };
    state.views.lock().unwrap().len() as c_int
}

unsafe extern "C" fn fake_get_view_ids(
    this: *mut EngineDocumentHandle,
    ids: *mut c_int,
    count: c_int,
) -> c_int {
    let state = unsafe { doc_state(this) };
    let views = state.views.lock().unwrap();
    let n = views.len().min(count.max(0) as usize);
    for (i, id) in views.iter().take(n).enumerate() {
        unsafe { *ids.add(i) = *id };
    }
    n as c_int
}

unsafe extern "C" fn fake_create_view(this: *mut EngineDocumentHandle) -> c_int {
    let state = unsafe { doc_state(this) };
    let view_id = state.next_view.fetch_add(1, Ordering::SeqCst);
    state.views.lock().unwrap().push(view_id);
    state.current_view.store(view_id, Ordering::SeqCst);
    view_id
}

unsafe extern "C" fn fake_destroy_view(this: *mut EngineDocumentHandle, view_id: c_int) {
    let state = unsafe { doc_state(this) };
    state.views.lock().unwrap().retain(|v| *v != view_id);
    state.destroyed_views.lock().unwrap().push(view_id);
}

unsafe extern "C" fn fake_set_view(this: *mut EngineDocumentHandle, view_id: c_int) {
    let state = unsafe { doc_state(this) };
    state.current_view.store(view_id, Ordering::SeqCst);
}

unsafe extern "C" fn fake_get_view(this: *mut EngineDocumentHandle) -> c_int {
    let state = unsafe { doc_state(this) };
    state.current_view.load(Ordering::SeqCst)
}

unsafe extern "C" fn fake_get_tile_mode(this: *mut EngineDocumentHandle) -> c_int {
    let state = unsafe { doc_state(this) };
    state.config.tile_mode
}

/// Fill each pixel from a hash of its absolute twip coordinate, so any two
/// paints of the same document region produce the same bytes regardless of
/// the canvas they share. The hash keeps the output incompressible, like
/// real document content.
unsafe extern "C" fn fake_paint_part_tile(
    _this: *mut EngineDocumentHandle,
    buffer: *mut c_uchar,
    part: c_int,
    canvas_width: c_int,
    canvas_height: c_int,
    tile_pos_x: c_int,
    tile_pos_y: c_int,
    tile_width: c_int,
    tile_height: c_int,
) {
    let pixels =
        unsafe { std::slice::from_raw_parts_mut(buffer, 4 * (canvas_width * canvas_height) as usize) };
    for py in 0..canvas_height as i64 {
        for px in 0..canvas_width as i64 {
            let u = tile_pos_x as i64 + px * tile_width as i64 / canvas_width as i64;
            let v = tile_pos_y as i64 + py * tile_height as i64 / canvas_height as i64;
            let mix = (u.wrapping_mul(0x9E37_79B9)
                ^ v.wrapping_mul(0x85EB_CA6B)
                ^ ((part as i64) << 7))
                .wrapping_mul(0xC2B2_AE35) as u64;
            let idx = 4 * (py * canvas_width as i64 + px) as usize;
            pixels[idx] = mix as u8;
            pixels[idx + 1] = (mix >> 8) as u8;
            pixels[idx + 2] = (mix >> 16) as u8;
            pixels[idx + 3] = 0xff;
        }
    }
}

unsafe extern "C" fn fake_get_command_values(
    this: *mut EngineDocumentHandle,
    command: *const c_char,
) -> *mut c_char {
    let state = unsafe { doc_state(this) };
    let command = unsafe { CStr::from_ptr(command) }.to_string_lossy();
    if command == ".uno:TrackedChangeAuthors"
        && let Some(ref authors) = state.config.authors
    {
        return malloc_cstring(authors);
    }
    std::ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ffi::CALLBACK_INVALIDATE_TILES;

    #[test]
    fn test_load_without_password() {
        let fake = FakeEngine::new();
        let office = fake.office();
        let doc = office.lock().document_load("file:///x.odt").unwrap();
        assert!(doc.is_some());
        assert_eq!(fake.state.view_ids(), vec![0]);
        assert_eq!(fake.state.load_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_protected_load_fails_without_handler() {
        let fake = FakeEngine::password_protected(CALLBACK_DOCUMENT_PASSWORD, "secret");
        let office = fake.office();
        // No global callback registered: the engine cannot ask, load fails.
        let doc = office.lock().document_load("file:///x.odt").unwrap();
        assert!(doc.is_none());
    }

    #[test]
    fn test_view_callback_dispatch() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn observer(n_type: c_int, _payload: *const c_char, data: *mut c_void) {
            assert_eq!(n_type, CALLBACK_INVALIDATE_TILES);
            assert_eq!(data as usize, 0x5a);
            FIRED.fetch_add(1, Ordering::SeqCst);
        }

        let fake = FakeEngine::new();
        let office = fake.office();
        let doc = office.lock().document_load("file:///x.odt").unwrap().unwrap();
        doc.lock()
            .register_callback(Some(observer), 0x5a as *mut c_void);

        fake.state
            .emit_view_callback(0, CALLBACK_INVALIDATE_TILES, "0, 0, 100, 100");
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        // Unregistering stops dispatch.
        doc.lock().register_callback(None, std::ptr::null_mut());
        fake.state
            .emit_view_callback(0, CALLBACK_INVALIDATE_TILES, "EMPTY");
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_paint_is_position_stable() {
        let fake = FakeEngine::new();
        let office = fake.office();
        let doc = office.lock().document_load("file:///x.odt").unwrap().unwrap();
        let guard = doc.lock();

        // One big paint covering two tiles side by side.
        let mut big = vec![0u8; 4 * 512 * 256];
        guard.paint_part_tile(&mut big, 0, 512, 256, 0, 0, 7680, 3840);

        // The right half alone.
        let mut small = vec![0u8; 4 * 256 * 256];
        guard.paint_part_tile(&mut small, 0, 256, 256, 3840, 0, 3840, 3840);

        for row in 0..256usize {
            let big_row = &big[4 * (row * 512 + 256)..4 * (row * 512 + 512)];
            let small_row = &small[4 * (row * 256)..4 * (row * 256 + 256)];
            assert_eq!(big_row, small_row, "row {row} differs");
        }
    }
}
