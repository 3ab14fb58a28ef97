//! Per-view session state.
//!
//! A session is one remote editing view of the document, multiplexed over
//! the single control connection. The document exclusively owns its
//! sessions; a session reaches back through a weak reference, so dropping
//! the document invalidates every session's back-channel at once.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::document::Document;
use crate::error::{KitError, Result};
use crate::protocol::{get_token_string, tokenize};

/// View id of a session whose view has not been created yet.
pub const UNASSIGNED_VIEW: i32 = -1;

/// One editing view bound to the document.
pub struct ChildSession {
    id: String,
    jail_id: String,
    document: Weak<Document>,
    /// Assigned by the engine at view creation, unique for the document's
    /// lifetime.
    view_id: AtomicI32,
    user_name: std::sync::Mutex<String>,
    /// The controller end closed; no further output may be written.
    close_frame: AtomicBool,
    /// The view was created and the session participates in broadcasts.
    active: AtomicBool,
    #[cfg(test)]
    callbacks_seen: std::sync::Mutex<Vec<(i32, String)>>,
}

impl ChildSession {
    pub fn new(id: &str, jail_id: &str, document: Weak<Document>) -> Self {
        Self {
            id: id.to_string(),
            jail_id: jail_id.to_string(),
            document,
            view_id: AtomicI32::new(UNASSIGNED_VIEW),
            user_name: std::sync::Mutex::new(String::new()),
            close_frame: AtomicBool::new(false),
            active: AtomicBool::new(false),
            #[cfg(test)]
            callbacks_seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn view_id(&self) -> i32 {
        self.view_id.load(Ordering::SeqCst)
    }

    pub fn set_view_id(&self, view_id: i32) {
        self.view_id.store(view_id, Ordering::SeqCst);
    }

    pub fn view_user_name(&self) -> String {
        self.user_name.lock().unwrap().clone()
    }

    /// Set by the document at load time, already URL-decoded.
    pub(crate) fn set_user_name(&self, user_name: &str) {
        *self.user_name.lock().unwrap() = user_name.to_string();
    }

    pub fn is_close_frame(&self) -> bool {
        self.close_frame.load(Ordering::SeqCst)
    }

    pub fn set_close_frame(&self) {
        self.close_frame.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Marked by the document once the view exists.
    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Send a text frame to this session's controller end.
    ///
    /// A failed send means the controller is gone: the close-frame flag is
    /// set so the reaper collects this session.
    pub fn send_text_frame(&self, message: &str) -> bool {
        if self.is_close_frame() {
            tracing::debug!(
                "Session [{}] is closed; dropping [{}]",
                self.id,
                crate::protocol::abbreviate(message)
            );
            return false;
        }
        let Some(document) = self.document.upgrade() else {
            return false;
        };
        let sent = document.send_text_frame(message);
        if !sent {
            self.set_close_frame();
        }
        sent
    }

    /// Handle a command forwarded to this session from the controller.
    pub fn handle_input(&self, message: &str) -> Result<()> {
        let tokens = tokenize(message);
        match tokens.first() {
            Some(&"load") => self.load_document(&tokens),
            Some(command) => {
                // Editing commands beyond load are relayed by the
                // controller once a view exists; nothing to do here.
                tracing::debug!("Session [{}] ignoring command [{command}]", self.id);
                Ok(())
            }
            None => Err(KitError::Protocol("empty child command".into())),
        }
    }

    /// Engine callback delivered to this view by the dispatch loop.
    ///
    /// Translation of callback types into client frames is the session
    /// protocol's concern; the core only guarantees delivery order.
    pub fn engine_callback(&self, n_type: i32, payload: &str) {
        tracing::trace!(
            "Session [{}] view [{}] callback type={n_type} [{}]",
            self.id,
            self.view_id(),
            crate::protocol::abbreviate(payload)
        );
        #[cfg(test)]
        self.callbacks_seen
            .lock()
            .unwrap()
            .push((n_type, payload.to_string()));
    }

    #[cfg(test)]
    pub(crate) fn callbacks_seen(&self) -> Vec<(i32, String)> {
        self.callbacks_seen.lock().unwrap().clone()
    }

    fn load_document(&self, tokens: &[&str]) -> Result<()> {
        let Some(document) = self.document.upgrade() else {
            return Err(KitError::Protocol("session outlived its document".into()));
        };

        let Some(url) = get_token_string(tokens, "url") else {
            return Err(KitError::Protocol(format!(
                "load command without url from session [{}]",
                self.id
            )));
        };

        let user_name = get_token_string(tokens, "user").unwrap_or("");
        let password = get_token_string(tokens, "password");
        let have_password = password.is_some();
        let render_opts = get_token_string(tokens, "renderopts").unwrap_or("");

        tracing::info!(
            "Session [{}] on jail [{}] loading url [{url}]",
            self.id,
            self.jail_id
        );

        document.on_load(
            &self.id,
            url,
            user_name,
            password.unwrap_or(""),
            render_opts,
            have_password,
        )?;
        Ok(())
    }
}
