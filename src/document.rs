//! The document manager.
//!
//! One Document exists per worker process. It owns the engine document
//! handle, the sessions editing it, and the dispatch thread that drains
//! the tile queue. Engine callbacks never touch session state directly:
//! they are routed through the queue so that command execution and
//! callback delivery share a single thread, and the non-reentrant engine
//! is never re-entered.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use serde_json::{Value, json};

use crate::channel::FrameSink;
use crate::engine::ffi::{
    CALLBACK_CELL_CURSOR, CALLBACK_CELL_VIEW_CURSOR, CALLBACK_DOCUMENT_PASSWORD,
    CALLBACK_DOCUMENT_PASSWORD_TO_MODIFY, CALLBACK_INVALIDATE_VIEW_CURSOR,
    CALLBACK_INVALIDATE_VISIBLE_CURSOR, FEATURE_DOCUMENT_PASSWORD,
    FEATURE_DOCUMENT_PASSWORD_TO_MODIFY, FEATURE_PART_IN_INVALIDATION_CALLBACK,
};
use crate::engine::{EngineDocument, Office};
use crate::error::{EXIT_OK, KitError, Result, fatal};
use crate::protocol::{abbreviate, parse_name_value, tokenize, url_decode};
use crate::queue::TileQueue;
use crate::session::{ChildSession, UNASSIGNED_VIEW};
use crate::tiles::{Rect, TileCombined, TileDesc};
use crate::worker::termination_requested;

/// Password-protected documents come in two flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PasswordType {
    ToView,
    ToModify,
}

impl PasswordType {
    fn as_str(self) -> &'static str {
        match self {
            Self::ToView => "to-view",
            Self::ToModify => "to-modify",
        }
    }
}

#[derive(Debug)]
struct PasswordState {
    /// A password callback fired for this document.
    protected: bool,
    /// The current load attempt supplied a password.
    provided: bool,
    /// The password supplied with the current load attempt.
    stored: String,
    kind: PasswordType,
}

impl Default for PasswordState {
    fn default() -> Self {
        Self {
            protected: false,
            provided: false,
            stored: String::new(),
            kind: PasswordType::ToView,
        }
    }
}

/// Userdata handed to the engine for per-view callbacks; lives exactly as
/// long as the view's registration.
struct CallbackDescriptor {
    document: Weak<Document>,
    view_id: i32,
}

/// Outcome of a session purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purge {
    /// The session map was contended; try later.
    Unavailable,
    /// Sessions remaining after removing closed ones.
    Remaining(usize),
}

/// Internal purge result, before the no-live-sessions exit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reap {
    Unavailable,
    NoneLive,
    Remaining(usize),
}

/// The one document this process hosts.
pub struct Document {
    office: Arc<Office>,
    jail_id: String,
    #[allow(dead_code)]
    doc_key: String,
    url: String,
    tile_queue: Arc<TileQueue>,
    sink: Arc<dyn FrameSink>,

    /// Document URL as visible inside the jail; the URL handed to the
    /// engine's password API.
    jailed_url: Mutex<String>,
    /// Render options recorded at first load; later loads cannot change
    /// them.
    render_opts: Mutex<String>,
    password: Mutex<PasswordState>,
    engine_doc: Mutex<Option<Arc<EngineDocument>>>,
    sessions: Mutex<HashMap<String, Arc<ChildSession>>>,
    callbacks: Mutex<HashMap<i32, Box<CallbackDescriptor>>>,

    /// Load attempts in flight; waited on by `cv_loading`.
    loading: Mutex<usize>,
    cv_loading: Condvar,
    client_views: AtomicUsize,
    stop: AtomicBool,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Document {
    /// Create the document and start its dispatch thread.
    pub fn create(
        office: Arc<Office>,
        jail_id: &str,
        doc_key: &str,
        url: &str,
        tile_queue: Arc<TileQueue>,
        sink: Arc<dyn FrameSink>,
    ) -> Arc<Self> {
        let document = Self::new_unstarted(office, jail_id, doc_key, url, tile_queue, sink);

        let weak = Arc::downgrade(&document);
        let handle = std::thread::Builder::new()
            .name("kit_dispatch".to_string())
            .spawn(move || dispatch_loop(weak))
            .expect("Failed to spawn dispatch thread");
        *document.dispatch_thread.lock().unwrap() = Some(handle);

        document
    }

    /// Construct without the dispatch thread; the caller drains the queue.
    pub(crate) fn new_unstarted(
        office: Arc<Office>,
        jail_id: &str,
        doc_key: &str,
        url: &str,
        tile_queue: Arc<TileQueue>,
        sink: Arc<dyn FrameSink>,
    ) -> Arc<Self> {
        tracing::info!("Document ctor for url [{url}] on child [{jail_id}].");

        Arc::new(Self {
            office,
            jail_id: jail_id.to_string(),
            doc_key: doc_key.to_string(),
            url: url.to_string(),
            tile_queue,
            sink,
            jailed_url: Mutex::new(String::new()),
            render_opts: Mutex::new(String::new()),
            password: Mutex::new(PasswordState::default()),
            engine_doc: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            loading: Mutex::new(0),
            cv_loading: Condvar::new(),
            client_views: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            dispatch_thread: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    #[allow(dead_code)] // diagnostics and tests
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub(crate) fn session(&self, session_id: &str) -> Option<Arc<ChildSession>> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Create a session; idempotent, the document is never loaded here.
    pub fn create_session(self: &Arc<Self>, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();

        if sessions.contains_key(session_id) {
            tracing::warn!("Session [{session_id}] is already running.");
            return true;
        }

        tracing::info!(
            "Creating {} view for url: {} for sessionId: {session_id} on jailId: {}",
            if self.client_views.load(Ordering::SeqCst) > 0 { "new" } else { "first" },
            self.url,
            self.jail_id
        );

        let session = Arc::new(ChildSession::new(
            session_id,
            &self.jail_id,
            Arc::downgrade(self),
        ));
        sessions.insert(session_id.to_string(), session);
        tracing::debug!("Sessions: {}", sessions.len());
        true
    }

    /// Remove closed sessions. Exits the process when no live session
    /// remains; that is the worker's only normal exit path.
    pub fn purge_sessions(&self) -> Purge {
        match self.reap_sessions() {
            Reap::Unavailable => Purge::Unavailable,
            Reap::NoneLive => {
                tracing::info!("No more sessions, exiting bluntly");
                std::process::exit(EXIT_OK);
            }
            Reap::Remaining(count) => Purge::Remaining(count),
        }
    }

    fn reap_sessions(&self) -> Reap {
        let mut dead = Vec::new();
        let remaining;
        {
            let Ok(mut sessions) = self.sessions.try_lock() else {
                // Not a good time, try later.
                return Reap::Unavailable;
            };

            let live = sessions
                .values()
                .filter(|session| !session.is_close_frame())
                .count();
            if live == 0 {
                return Reap::NoneLive;
            }

            sessions.retain(|_, session| {
                if session.is_close_frame() {
                    dead.push(Arc::clone(session));
                    false
                } else {
                    true
                }
            });
            remaining = sessions.len();
        }

        // Dropped outside the lock: a session teardown may call back in.
        drop(dead);
        Reap::Remaining(remaining)
    }

    /// True while at least one live session exists. A contended purge is
    /// read conservatively as "sessions may exist".
    pub fn has_sessions(&self) -> bool {
        self.purge_sessions() != Purge::Remaining(0)
    }

    pub fn can_discard(&self) -> bool {
        !self.has_sessions()
    }

    /// Mark every session closed; used when the controller connection
    /// itself went away.
    pub fn mark_sessions_closed(&self) {
        for session in self.sessions.lock().unwrap().values() {
            session.set_close_frame();
        }
    }

    /// Send a text frame on the control socket.
    pub fn send_text_frame(&self, message: &str) -> bool {
        match self.sink.send_text_frame(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "Document::send_text_frame: {e} while sending [{}]",
                    abbreviate(message)
                );
                false
            }
        }
    }

    /// Broadcast a fatal alert to every client of this document.
    #[allow(dead_code)] // for the fatal-error handlers
    pub fn alert_all_users(&self, cmd: &str, kind: &str) {
        self.send_text_frame(&format!("errortoall: cmd={cmd} kind={kind}"));
    }

    /// Load the document (first call) or create an additional view.
    ///
    /// Serializes with any load already in flight. On success the updated
    /// view info is broadcast to every active session.
    pub fn on_load(
        self: &Arc<Self>,
        session_id: &str,
        uri: &str,
        user_name: &str,
        doc_password: &str,
        render_opts: &str,
        have_doc_password: bool,
    ) -> Result<Option<Arc<EngineDocument>>> {
        tracing::info!(
            "Session {session_id} is loading. {} views loaded.",
            self.client_views.load(Ordering::SeqCst)
        );

        {
            let mut loading = self.loading.lock().unwrap();
            while *loading > 0 {
                loading = self.cv_loading.wait(loading).unwrap();
            }
            *loading += 1;
        }

        let result = self.load(
            session_id,
            uri,
            user_name,
            doc_password,
            render_opts,
            have_doc_password,
        );

        {
            let mut loading = self.loading.lock().unwrap();
            *loading -= 1;
        }
        self.cv_loading.notify_one();

        match result {
            Ok(Some(engine_doc)) => {
                self.client_views.fetch_add(1, Ordering::SeqCst);
                let view_ids = engine_doc.lock().get_view_ids();
                self.notify_view_info(&view_ids);
                Ok(Some(engine_doc))
            }
            other => other,
        }
    }

    fn load(
        self: &Arc<Self>,
        session_id: &str,
        uri: &str,
        user_name: &str,
        doc_password: &str,
        render_opts: &str,
        have_doc_password: bool,
    ) -> Result<Option<Arc<EngineDocument>>> {
        let Some(session) = self.session(session_id) else {
            return Err(KitError::Protocol(format!(
                "Cannot find session [{session_id}]"
            )));
        };

        if !user_name.is_empty() {
            let decoded = url_decode(user_name).unwrap_or_else(|_| user_name.to_string());
            session.set_user_name(&decoded);
        }

        let engine_doc = match self.engine_doc.lock().unwrap().clone() {
            Some(existing) => {
                // Additional view on the already loaded document.
                {
                    let password = self.password.lock().unwrap();
                    if password.protected {
                        if !have_doc_password {
                            session.send_text_frame(&format!(
                                "error: cmd=load kind=passwordrequired:{}",
                                password.kind.as_str()
                            ));
                            return Ok(None);
                        } else if doc_password != password.stored {
                            session.send_text_frame("error: cmd=load kind=wrongpassword");
                            return Ok(None);
                        }
                    }
                }

                tracing::info!(
                    "Loading view to document from URI: [{uri}] for session [{session_id}]."
                );
                existing.lock().create_view();
                tracing::trace!("View created.");
                existing
            }
            None => {
                tracing::info!(
                    "Loading new document from URI: [{uri}] for session [{session_id}]."
                );

                let office = self.office.lock();
                office.register_callback(
                    Some(global_callback),
                    Arc::as_ptr(self) as *mut c_void,
                );
                office.set_optional_features(
                    FEATURE_DOCUMENT_PASSWORD
                        | FEATURE_DOCUMENT_PASSWORD_TO_MODIFY
                        | FEATURE_PART_IN_INVALIDATION_CALLBACK,
                );

                // Record the password and jailed url for the callbacks that
                // fire from inside document_load.
                {
                    let mut password = self.password.lock().unwrap();
                    password.provided = have_doc_password;
                    password.stored = doc_password.to_string();
                    password.protected = false;
                }
                *self.jailed_url.lock().unwrap() = uri.to_string();

                tracing::debug!("Calling engine document_load.");
                let loaded = office.document_load(uri)?;
                tracing::debug!("Returned engine document_load.");

                let Some(loaded) = loaded else {
                    let error = office.get_error();
                    tracing::error!("Failed to load: {uri}, error: {error}");
                    drop(office);

                    let password = self.password.lock().unwrap();
                    if password.protected {
                        if !password.provided {
                            tracing::info!(
                                "No password provided for password-protected document [{uri}]."
                            );
                            session.send_text_frame(&format!(
                                "error: cmd=load kind=passwordrequired:{}",
                                password.kind.as_str()
                            ));
                        } else {
                            tracing::info!(
                                "Wrong password for password-protected document [{uri}]."
                            );
                            session.send_text_frame("error: cmd=load kind=wrongpassword");
                        }
                        return Ok(None);
                    }
                    // Not a password problem: the engine cannot host this
                    // document and the process is useless.
                    fatal(&format!("Failed to load [{uri}]: {error}"));
                };

                // Render options are fixed at first open.
                *self.render_opts.lock().unwrap() = render_opts.to_string();
                Arc::new(loaded)
            }
        };
        *self.engine_doc.lock().unwrap() = Some(Arc::clone(&engine_doc));

        let render_opts_json = self.build_render_opts(user_name)?;
        let view_id;
        {
            let guard = engine_doc.lock();
            // initialize_for_rendering before register_callback: the former
            // may itself create a view.
            guard.initialize_for_rendering(&render_opts_json)?;

            view_id = guard.get_view();
            session.set_view_id(view_id);

            let descriptor = Box::new(CallbackDescriptor {
                document: Arc::downgrade(self),
                view_id,
            });
            let data = std::ptr::from_ref::<CallbackDescriptor>(&descriptor).cast_mut();
            guard.register_callback(Some(view_callback), data.cast());
            self.callbacks.lock().unwrap().insert(view_id, descriptor);
        }
        session.set_active(true);

        tracing::info!(
            "Document [{}] view [{view_id}] loaded, leaving {} views.",
            self.url,
            self.client_views.load(Ordering::SeqCst) + 1
        );

        Ok(Some(engine_doc))
    }

    /// Tear down a session's view and broadcast the updated view info.
    pub fn on_unload(&self, session: &ChildSession) {
        let session_id = session.id();
        tracing::info!("Unloading [{session_id}].");

        self.tile_queue.remove_cursor_position(session.view_id());

        let engine_doc = self.engine_doc.lock().unwrap().clone();
        let Some(engine_doc) = engine_doc else {
            tracing::error!("Unloading session [{session_id}] without a loaded document.");
            return;
        };

        self.client_views.fetch_sub(1, Ordering::SeqCst);
        tracing::info!(
            "Document [{}] session [{session_id}] unloaded, {} views",
            self.url,
            self.client_views.load(Ordering::SeqCst)
        );

        let view_id = session.view_id();
        let view_ids;
        {
            let guard = engine_doc.lock();
            guard.set_view(view_id);
            guard.register_callback(None, std::ptr::null_mut());
            guard.destroy_view(view_id);
            view_ids = guard.get_view_ids();
        }
        self.callbacks.lock().unwrap().remove(&view_id);
        tracing::debug!("Destroyed view {view_id}");

        self.notify_view_info(&view_ids);
    }

    /// View id to user name for every live session.
    fn get_view_info(&self) -> HashMap<i32, String> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|session| !session.is_close_frame())
            .map(|session| (session.view_id(), session.view_user_name()))
            .collect()
    }

    /// Author name to color, from the engine's tracked-change table.
    fn get_view_colors(&self) -> HashMap<String, i64> {
        let Some(engine_doc) = self.engine_doc.lock().unwrap().clone() else {
            return HashMap::new();
        };
        let raw = match engine_doc.lock().get_command_values(".uno:TrackedChangeAuthors") {
            Ok(Some(raw)) => raw,
            Ok(None) => return HashMap::new(),
            Err(e) => {
                tracing::error!("TrackedChangeAuthors query failed: {e}");
                return HashMap::new();
            }
        };

        let mut colors = HashMap::new();
        match serde_json::from_str::<Value>(&raw) {
            Ok(root) => {
                if let Some(authors) = root.get("authors").and_then(Value::as_array) {
                    for author in authors {
                        if let (Some(name), Some(color)) = (
                            author.get("name").and_then(Value::as_str),
                            author.get("color").and_then(Value::as_i64),
                        ) {
                            colors.insert(name.to_string(), color);
                        }
                    }
                }
            }
            Err(e) => tracing::error!("Malformed TrackedChangeAuthors payload: {e}"),
        }
        colors
    }

    /// Broadcast the current view list (with usernames and author colors)
    /// to every live, active session.
    pub fn notify_view_info(&self, view_ids: &[i32]) {
        let view_info = self.get_view_info();
        let view_colors = self.get_view_colors();

        let array: Vec<Value> = view_ids
            .iter()
            .map(|view_id| match view_info.get(view_id) {
                Some(user_name) => json!({
                    "id": view_id,
                    "username": user_name,
                    "color": view_colors.get(user_name).copied().unwrap_or(0),
                }),
                None => {
                    tracing::error!("No username found for viewId [{view_id}].");
                    json!({ "id": view_id, "username": "Unknown", "color": 0 })
                }
            })
            .collect();

        let message = format!("viewinfo: {}", Value::Array(array));

        let recipients: Vec<Arc<ChildSession>> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|session| !session.is_close_frame() && session.is_active())
            .cloned()
            .collect();
        for session in recipients {
            session.send_text_frame(&message);
        }
    }

    /// Password state machine, driven by the engine's password callbacks
    /// during `document_load`.
    fn set_document_password(&self, n_type: c_int) {
        let url;
        let submit;
        {
            let mut password = self.password.lock().unwrap();
            tracing::info!(
                "setDocumentPassword: passwordProtected={} passwordProvided={}",
                password.protected,
                password.provided
            );

            url = self.jailed_url.lock().unwrap().clone();

            if password.protected && password.provided {
                // Second prompt in one load attempt: the supplied password
                // was wrong. Submit null to abort.
                submit = None;
            } else {
                password.protected = true;
                password.kind = if n_type == CALLBACK_DOCUMENT_PASSWORD_TO_MODIFY {
                    PasswordType::ToModify
                } else {
                    PasswordType::ToView
                };
                submit = password.provided.then(|| password.stored.clone());
            }
        }

        tracing::info!("Submitting {} password", if submit.is_some() { "stored" } else { "null" });
        unsafe {
            self.office
                .set_document_password_reentrant(&url, submit.as_deref());
        }
    }

    fn build_render_opts(&self, user_name: &str) -> Result<String> {
        let stored = self.render_opts.lock().unwrap().clone();
        let mut opts: serde_json::Map<String, Value> = if stored.is_empty() {
            serde_json::Map::new()
        } else {
            serde_json::from_str(&stored)?
        };

        if !user_name.is_empty() {
            let decoded = url_decode(user_name)?;
            opts.insert(
                ".uno:Author".to_string(),
                json!({ "type": "string", "value": decoded }),
            );
        }

        Ok(Value::Object(opts).to_string())
    }

    /// Dispatch one queue payload; called from the dispatch thread only.
    pub fn process(&self, message: &str) -> Result<()> {
        let tokens = tokenize(message);
        let Some(&command) = tokens.first() else {
            return Ok(());
        };

        match command {
            "tile" => self.render_tile(&tokens),
            "tilecombine" => self.render_combined_tiles(&tokens),
            "callback" => self.deliver_callback(&tokens, message),
            _ => {
                if let Some(("child", session_key)) = parse_name_value(command, '-') {
                    self.forward_to_child(session_key, message, command.len());
                    Ok(())
                } else {
                    tracing::error!("Unexpected queue message: [{}].", abbreviate(message));
                    Ok(())
                }
            }
        }
    }

    fn forward_to_child(&self, session_key: &str, message: &str, prefix_len: usize) {
        let body = message[prefix_len..].trim_start();
        tracing::trace!("Forwarding payload to child-{session_key}: {}", abbreviate(body));

        if body == "disconnect" {
            let removed = self.sessions.lock().unwrap().remove(session_key);
            match removed {
                Some(session) => {
                    tracing::debug!("Removing ChildSession {session_key}");
                    if session.is_active() && session.view_id() != UNASSIGNED_VIEW {
                        self.on_unload(&session);
                    }
                }
                None => tracing::warn!("Disconnect for unknown session [{session_key}]"),
            }
            return;
        }

        let session = self.session(session_key);
        match session {
            Some(session) => {
                if let Err(e) = session.handle_input(body) {
                    tracing::error!("Session [{session_key}] input failed: {e}");
                }
            }
            None => tracing::warn!(
                "Child session [{session_key}] not found to forward message: {}",
                abbreviate(body)
            ),
        }
    }

    fn deliver_callback(&self, tokens: &[&str], message: &str) -> Result<()> {
        if tokens.len() < 3 {
            return Err(KitError::Protocol(format!(
                "malformed callback message: [{}]",
                abbreviate(message)
            )));
        }
        let view_id: i32 = tokens[1]
            .parse()
            .map_err(|_| KitError::Protocol(format!("bad callback view id [{}]", tokens[1])))?;
        let n_type: i32 = tokens[2]
            .parse()
            .map_err(|_| KitError::Protocol(format!("bad callback type [{}]", tokens[2])))?;

        // Payload is everything after the three leading tokens.
        let payload = message
            .splitn(4, ' ')
            .nth(3)
            .unwrap_or("");

        let recipients: Vec<Arc<ChildSession>> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|session| view_id == -1 || session.view_id() == view_id)
            .cloned()
            .collect();

        let mut found = false;
        for session in recipients {
            if session.is_close_frame() {
                tracing::error!(
                    "Session [{}] for view {view_id} is closed. Dropping callback type={n_type} payload [{}].",
                    session.id(),
                    abbreviate(payload)
                );
                continue;
            }
            found = true;
            session.engine_callback(n_type, payload);
        }
        if !found {
            tracing::warn!(
                "Callback [{view_id}] type={n_type} [{}] has no receiving session.",
                abbreviate(payload)
            );
        }
        Ok(())
    }

    /// Render one tile and send it as a binary frame: textual header,
    /// newline, PNG bytes.
    pub fn render_tile(&self, tokens: &[&str]) -> Result<()> {
        let tile = TileDesc::parse(tokens)?;
        let response = format!("{}\n", tile.serialize("tile:"));

        let Some(engine_doc) = self.engine_doc.lock().unwrap().clone() else {
            tracing::error!("Tile rendering requested before loading document.");
            return Ok(());
        };

        let mut pixmap = vec![0u8; 4 * tile.width as usize * tile.height as usize];
        let mode;
        {
            let guard = engine_doc.lock();
            if guard.get_views_count() <= 0 {
                tracing::error!("Tile rendering requested without views.");
                return Ok(());
            }

            let start = Instant::now();
            guard.paint_part_tile(
                &mut pixmap,
                tile.part,
                tile.width,
                tile.height,
                tile.tile_pos_x,
                tile.tile_pos_y,
                tile.tile_width,
                tile.tile_height,
            );
            tracing::trace!(
                "paintTile at ({}, {}, {}) ver: {} rendered in {:?}",
                tile.part,
                tile.tile_pos_x,
                tile.tile_pos_y,
                tile.version,
                start.elapsed()
            );
            mode = guard.get_tile_mode()?;
        }

        let mut output = response.clone().into_bytes();
        if let Err(e) = crate::pngenc::encode_buffer(
            &pixmap,
            tile.width as u32,
            tile.height as u32,
            mode,
            &mut output,
        ) {
            tracing::error!("Failed to encode tile into PNG: {e}");
            return Ok(());
        }

        tracing::trace!(
            "Sending render-tile response ({} bytes) for: {}",
            output.len(),
            abbreviate(&response)
        );
        if let Err(e) = self.sink.send_binary_frame(&output) {
            tracing::error!("Failed to send tile frame: {e}");
        }
        Ok(())
    }

    /// Render a combined request with one engine paint over the bounding
    /// rectangle, then slice and encode each requested sub-tile.
    pub fn render_combined_tiles(&self, tokens: &[&str]) -> Result<()> {
        let mut combined = TileCombined::parse(tokens)?;
        let render_area = combined.render_area();

        let tiles_by_x = (render_area.width / combined.tile_width) as usize;
        let tiles_by_y = (render_area.height / combined.tile_height) as usize;
        let pixmap_width = tiles_by_x * combined.width as usize;
        let pixmap_height = tiles_by_y * combined.height as usize;
        let mut pixmap = vec![0u8; 4 * pixmap_width * pixmap_height];

        let Some(engine_doc) = self.engine_doc.lock().unwrap().clone() else {
            tracing::error!("Tile rendering requested before loading document.");
            return Ok(());
        };

        let mode;
        {
            let guard = engine_doc.lock();
            if guard.get_views_count() <= 0 {
                tracing::error!("Tile rendering requested without views.");
                return Ok(());
            }

            let start = Instant::now();
            guard.paint_part_tile(
                &mut pixmap,
                combined.part,
                pixmap_width as i32,
                pixmap_height as i32,
                render_area.left,
                render_area.top,
                render_area.width,
                render_area.height,
            );
            tracing::debug!(
                "paintTile (combined) at ({}, {}), ({}, {}) ver: {} rendered in {:?}",
                render_area.left,
                render_area.top,
                render_area.width,
                render_area.height,
                combined.version,
                start.elapsed()
            );
            mode = guard.get_tile_mode()?;
        }

        let mut images = Vec::with_capacity(pixmap.len());
        for index in 0..combined.tiles.len() {
            let rect = combined.tiles[index].rect();
            let position_x = ((rect.left - render_area.left) / combined.tile_width) as u32;
            let position_y = ((rect.top - render_area.top) / combined.tile_height) as u32;

            let old_size = images.len();
            if let Err(e) = crate::pngenc::encode_sub_buffer(
                &pixmap,
                position_x * combined.width as u32,
                position_y * combined.height as u32,
                combined.width as u32,
                combined.height as u32,
                pixmap_width as u32,
                pixmap_height as u32,
                mode,
                &mut images,
            ) {
                tracing::error!("Failed to encode tile into PNG: {e}");
                return Ok(());
            }
            let img_size = images.len() - old_size;
            tracing::trace!("Encoded tile #{index} in {img_size} bytes.");
            combined.tiles[index].img_size = img_size;
        }

        let header = format!("{}\n", combined.serialize("tilecombine:"));
        tracing::trace!("Sending back painted tiles for {}", abbreviate(&header));

        let mut response = header.into_bytes();
        response.extend_from_slice(&images);
        if let Err(e) = self.sink.send_binary_frame(&response) {
            tracing::error!("Failed to send tilecombine frame: {e}");
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn reap_for_test(&self) -> Option<usize> {
        match self.reap_sessions() {
            Reap::NoneLive => None,
            Reap::Remaining(count) => Some(count),
            Reap::Unavailable => Some(usize::MAX),
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        tracing::info!(
            "~Document dtor for url [{}] on child [{}]. There are {} views.",
            self.url,
            self.jail_id,
            self.client_views.load(Ordering::SeqCst)
        );

        // Wake the dispatch thread and wait for it to finish.
        self.stop.store(true, Ordering::SeqCst);
        self.tile_queue.put("eof");
        if let Some(handle) = self.dispatch_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// The dispatch loop: single consumer of the tile queue.
///
/// Holds only a weak reference while blocked so the document can be torn
/// down underneath it.
fn dispatch_loop(document: Weak<Document>) {
    tracing::debug!("Dispatch thread started.");

    loop {
        let Some(strong) = document.upgrade() else {
            break;
        };
        if strong.stop.load(Ordering::SeqCst) || termination_requested() {
            break;
        }
        let queue = Arc::clone(&strong.tile_queue);
        drop(strong);

        let payload = queue.get();

        let Some(strong) = document.upgrade() else {
            break;
        };
        if strong.stop.load(Ordering::SeqCst) || termination_requested() {
            break;
        }

        let message = String::from_utf8_lossy(&payload).into_owned();
        if crate::protocol::first_token(&message) == "eof" {
            tracing::info!("Received EOF. Finishing.");
            break;
        }

        if let Err(e) = strong.process(&message) {
            tracing::error!("Dispatch: {e} while handling [{}]", abbreviate(&message));
        }
    }

    tracing::debug!("Dispatch thread finished.");
}

/// Global engine callback: password requests feed the password state
/// machine, everything else is broadcast through the queue.
unsafe extern "C" fn global_callback(n_type: c_int, payload: *const c_char, data: *mut c_void) {
    if termination_requested() {
        return;
    }

    let payload = if payload.is_null() {
        "(nil)".to_string()
    } else {
        unsafe { CStr::from_ptr(payload) }.to_string_lossy().into_owned()
    };
    tracing::trace!("Document::global_callback {n_type} [{}].", abbreviate(&payload));

    let document = unsafe { &*data.cast::<Document>() };
    if n_type == CALLBACK_DOCUMENT_PASSWORD || n_type == CALLBACK_DOCUMENT_PASSWORD_TO_MODIFY {
        document.set_document_password(n_type);
        return;
    }

    document
        .tile_queue
        .put(format!("callback -1 {n_type} {payload}"));
}

/// Per-view engine callback: cursor movements update the queue's cursor
/// hints, then the callback itself is enqueued for the dispatch thread.
unsafe extern "C" fn view_callback(n_type: c_int, payload: *const c_char, data: *mut c_void) {
    if termination_requested() {
        return;
    }

    let descriptor = unsafe { &*data.cast::<CallbackDescriptor>() };
    let Some(document) = descriptor.document.upgrade() else {
        return;
    };

    let payload = if payload.is_null() {
        "(nil)".to_string()
    } else {
        unsafe { CStr::from_ptr(payload) }.to_string_lossy().into_owned()
    };
    tracing::trace!(
        "Document::view_callback [{}] type={n_type} [{}].",
        descriptor.view_id,
        abbreviate(&payload)
    );

    if n_type == CALLBACK_INVALIDATE_VISIBLE_CURSOR || n_type == CALLBACK_CELL_CURSOR {
        if let Some(rect) = parse_cursor_rect(&payload) {
            document.tile_queue.update_cursor_position(0, 0, rect);
        }
    } else if n_type == CALLBACK_INVALIDATE_VIEW_CURSOR || n_type == CALLBACK_CELL_VIEW_CURSOR {
        match serde_json::from_str::<Value>(&payload) {
            Ok(command) => {
                let view_id = json_int(&command, "viewId");
                let part = json_int(&command, "part");
                let rect = command
                    .get("rectangle")
                    .and_then(Value::as_str)
                    .and_then(parse_cursor_rect);
                if let (Some(view_id), Some(part), Some(rect)) = (view_id, part, rect) {
                    document
                        .tile_queue
                        .update_cursor_position(view_id, part, rect);
                }
            }
            Err(e) => tracing::warn!("Malformed view-cursor payload [{}]: {e}", abbreviate(&payload)),
        }
    }

    document
        .tile_queue
        .put(format!("callback {} {n_type} {payload}", descriptor.view_id));
}

/// Parse `x,y,w,h`; the literal `EMPTY` means no rectangle.
fn parse_cursor_rect(payload: &str) -> Option<Rect> {
    let parts: Vec<i32> = payload
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map_while(|s| s.parse().ok())
        .collect();
    if parts.len() == 4 {
        Some(Rect::new(parts[0], parts[1], parts[2], parts[3]))
    } else {
        None
    }
}

/// Integer field that may arrive as a JSON number or a numeric string.
fn json_int(value: &Value, key: &str) -> Option<i32> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().map(|v| v as i32),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
