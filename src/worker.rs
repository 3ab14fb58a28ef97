//! Worker main: jail, engine, control channel, message loop.
//!
//! The supervisor forks one worker per document. The worker builds and
//! enters its jail, initializes the engine, registers with the controller
//! over the control channel, and then routes inbound commands until the
//! last session is gone.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::{
    ControlSocket, FrameSink, Inbound, WsSink, connect_to_controller, read_frame,
};
use crate::document::Document;
use crate::engine::Office;
use crate::error::{EXIT_OK, fatal};
use crate::jail;
use crate::protocol::{abbreviate, parse_name_value, tokenize, url_decode};
use crate::queue::TileQueue;

/// Process-wide termination flag; engine callbacks short-circuit once set.
pub static TERMINATION_FLAG: AtomicBool = AtomicBool::new(false);

pub fn termination_requested() -> bool {
    TERMINATION_FLAG.load(Ordering::Acquire)
}

pub fn request_termination() {
    TERMINATION_FLAG.store(true, Ordering::Release);
}

extern "C" fn handle_termination_signal(_signal: c_int) {
    TERMINATION_FLAG.store(true, Ordering::Release);
}

fn set_termination_signals() {
    use nix::sys::signal::{SigHandler, Signal, signal};

    // Ignore SIGPIPE: channel errors surface through send results.
    unsafe {
        let handler = SigHandler::Handler(handle_termination_signal);
        let _ = signal(Signal::SIGTERM, handler);
        let _ = signal(Signal::SIGINT, handler);
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

/// Startup parameters, straight from the command line.
#[derive(Debug, Clone)]
pub struct KitConfig {
    pub child_root: String,
    pub sys_template: String,
    pub lo_template: String,
    pub lo_sub_path: String,
    pub master_port: u16,
    /// Developer mode: skip the jail and capability drop.
    pub no_capabilities: bool,
    /// Report the engine version to the controller.
    pub query_version: bool,
    /// Print the engine version to stdout as well.
    pub display_version: bool,
}

/// Per-process routing state for the control loop.
pub(crate) struct KitState {
    office: Arc<Office>,
    jail_id: String,
    queue: Arc<TileQueue>,
    sink: Arc<dyn FrameSink>,
    document: Mutex<Option<Arc<Document>>>,
}

impl KitState {
    pub(crate) fn new(
        office: Arc<Office>,
        jail_id: &str,
        queue: Arc<TileQueue>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            office,
            jail_id: jail_id.to_string(),
            queue,
            sink,
            document: Mutex::new(None),
        }
    }

    pub(crate) fn document(&self) -> Option<Arc<Document>> {
        self.document.lock().unwrap().clone()
    }

    /// Route one inbound control frame.
    pub(crate) fn handle_message(&self, message: &str) {
        tracing::debug!("channel: recv [{}]", abbreviate(message));

        if termination_requested() {
            tracing::debug!("Too late, we're going down");
            return;
        }

        let tokens = tokenize(message);
        let Some(&command) = tokens.first() else {
            return;
        };

        if command == "session" {
            if tokens.len() < 3 {
                tracing::error!("Bad session command: [{}]", abbreviate(message));
                return;
            }
            let session_id = tokens[1];
            let doc_key = tokens[2];
            let url = match url_decode(doc_key) {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!("Bad document key in session command: {e}");
                    return;
                }
            };
            tracing::info!("New session [{session_id}] request on url [{url}].");

            let document = {
                let mut slot = self.document.lock().unwrap();
                if slot.is_none() {
                    // The document binds to this URL for the process
                    // lifetime.
                    *slot = Some(Document::create(
                        Arc::clone(&self.office),
                        &self.jail_id,
                        doc_key,
                        &url,
                        Arc::clone(&self.queue),
                        Arc::clone(&self.sink),
                    ));
                }
                slot.clone().expect("document just created")
            };

            if !(document.url() == url && document.create_session(session_id)) {
                tracing::debug!("CreateSession failed.");
            }
        } else if command == "tile"
            || command == "tilecombine"
            || command == "canceltiles"
            || matches!(parse_name_value(command, '-'), Some(("child", _)))
        {
            if self.document().is_some() {
                self.queue.put(message);
            } else {
                tracing::warn!("No document while processing {command} request.");
            }
        } else {
            tracing::error!("Bad or unknown token [{command}]");
        }
    }
}

/// Read frames until termination; poll the discard condition in between.
fn control_loop(state: &KitState, socket: &Mutex<ControlSocket>) {
    while !termination_requested() {
        match read_frame(socket) {
            Ok(Inbound::Text(message)) => state.handle_message(&message),
            Ok(Inbound::Idle) => {}
            Ok(Inbound::Closed) => {
                tracing::info!("Controller closed the connection.");
                match state.document() {
                    Some(document) => document.mark_sessions_closed(),
                    None => break,
                }
            }
            Err(e) => {
                tracing::error!("Control channel error: {e}");
                match state.document() {
                    Some(document) => document.mark_sessions_closed(),
                    None => break,
                }
            }
        }

        // purge_sessions exits the process once the last live session is
        // gone; this poll only catches the edge where it cannot.
        if let Some(document) = state.document()
            && document.can_discard()
        {
            tracing::info!("Last session discarded. Terminating.");
            request_termination();
        }
    }
}

/// The worker process body; only returns by exiting.
pub fn kit_main(config: KitConfig) -> ! {
    // Reinitialize logging when forked.
    crate::logging::init(&crate::logging::LogConfig::from_env());

    let pid = std::process::id();
    // The supervisor cleans our jail directory up when we die, so the
    // jail id is simply our pid.
    let jail_id = pid.to_string();

    tracing::debug!("Process started.");
    set_termination_signals();

    let paths = if config.no_capabilities {
        jail::paths_without_jail(&config.child_root, &config.lo_template, &jail_id)
    } else {
        match jail::enter(
            &config.child_root,
            &config.sys_template,
            &config.lo_template,
            &config.lo_sub_path,
            &jail_id,
        ) {
            Ok(paths) => paths,
            Err(e) => fatal(&format!("Jail construction failed: {e}")),
        }
    };

    let office = match Office::init(&paths.instdir, &paths.userdir_url) {
        Ok(office) => Arc::new(office),
        Err(e) => fatal(&format!("Engine initialization failed: {e}")),
    };
    tracing::info!("Process is ready.");

    let version = config
        .query_version
        .then(|| office.lock().get_version_info());
    if config.display_version
        && let Some(ref version) = version
    {
        println!("office version details: {version}");
    }

    let socket = match connect_to_controller(config.master_port, pid, version.as_deref()) {
        Ok(socket) => socket,
        Err(e) => fatal(&format!("Controller connection failed: {e}")),
    };

    let sink: Arc<dyn FrameSink> = Arc::new(WsSink::new(Arc::clone(&socket)));
    let queue = Arc::new(TileQueue::default());
    let state = KitState::new(office, &jail_id, queue, sink);

    control_loop(&state, &socket);

    // The jail directory is the supervisor's to clean up.
    tracing::info!("Process finished.");
    std::process::exit(EXIT_OK);
}
