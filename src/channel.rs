//! Control channel to the controller process.
//!
//! One upgraded, persistent connection carries every command for this
//! worker: text frames inbound, text and binary frames outbound. Any frame
//! larger than [`SMALL_MESSAGE_SIZE`] is preceded by a `nextmessage:`
//! sentinel so the peer can size its receive buffer.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::error::Result;
use crate::protocol::{abbreviate, url_encode};

/// Frames above this size get a `nextmessage: size=<N>` sentinel first.
pub const SMALL_MESSAGE_SIZE: usize = 1024;

/// Registration path on the controller.
pub const NEW_CHILD_URI: &str = "/newchild";

/// How long a read blocks before the control loop gets to poll
/// termination conditions.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type ControlSocket = WebSocket<MaybeTlsStream<TcpStream>>;

/// The narrow send capability handed to the document and its sessions.
///
/// Implementations provide the raw frame writes; the sentinel logic lives
/// in the provided methods so every sink behaves the same.
pub trait FrameSink: Send + Sync {
    fn write_text(&self, message: &str) -> Result<()>;
    fn write_binary(&self, data: &[u8]) -> Result<()>;

    /// Send a text frame, preceded by a sentinel when large.
    fn send_text_frame(&self, message: &str) -> Result<()> {
        if message.len() > SMALL_MESSAGE_SIZE {
            self.write_text(&format!("nextmessage: size={}", message.len()))?;
        }
        self.write_text(message)
    }

    /// Send a binary frame, preceded by a sentinel when large.
    fn send_binary_frame(&self, data: &[u8]) -> Result<()> {
        if data.len() > SMALL_MESSAGE_SIZE {
            self.write_text(&format!("nextmessage: size={}", data.len()))?;
        }
        self.write_binary(data)
    }
}

/// What a blocking read produced.
pub enum Inbound {
    /// A textual command frame.
    Text(String),
    /// Nothing yet; the poll interval elapsed.
    Idle,
    /// The controller closed the connection.
    Closed,
}

/// Open the registration connection to the controller.
///
/// The URL carries our pid so the controller can match us to the jail it
/// prepared, plus the engine version string when known.
pub fn connect_to_controller(
    master_port: u16,
    pid: u32,
    version: Option<&str>,
) -> Result<Arc<Mutex<ControlSocket>>> {
    let mut url = format!("ws://127.0.0.1:{master_port}{NEW_CHILD_URI}?pid={pid}");
    if let Some(version) = version {
        url.push_str(&format!("&version={}", url_encode(version)));
    }

    tracing::info!("Connecting to controller at {url}");
    let (mut socket, _response) = tungstenite::connect(url.as_str())?;

    if let MaybeTlsStream::Plain(stream) = socket.get_mut() {
        stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;
    }

    Ok(Arc::new(Mutex::new(socket)))
}

/// Read one frame, yielding [`Inbound::Idle`] at the poll interval so the
/// caller can check termination conditions.
pub fn read_frame(socket: &Mutex<ControlSocket>) -> Result<Inbound> {
    let mut guard = socket.lock().unwrap();
    match guard.read() {
        Ok(Message::Text(text)) => Ok(Inbound::Text(text)),
        Ok(Message::Binary(data)) => Ok(Inbound::Text(String::from_utf8_lossy(&data).into_owned())),
        Ok(Message::Close(_)) => Ok(Inbound::Closed),
        Ok(_) => Ok(Inbound::Idle),
        Err(tungstenite::Error::Io(e))
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Ok(Inbound::Idle)
        }
        Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
            Ok(Inbound::Closed)
        }
        Err(e) => Err(e.into()),
    }
}

/// [`FrameSink`] over the shared control socket.
pub struct WsSink {
    socket: Arc<Mutex<ControlSocket>>,
}

impl WsSink {
    pub fn new(socket: Arc<Mutex<ControlSocket>>) -> Self {
        Self { socket }
    }
}

impl FrameSink for WsSink {
    fn write_text(&self, message: &str) -> Result<()> {
        let mut guard = self.socket.lock().unwrap();
        if !guard.can_write() {
            return Err(tungstenite::Error::AlreadyClosed.into());
        }
        tracing::trace!("send: [{}]", abbreviate(message));
        guard.send(Message::Text(message.to_string()))?;
        Ok(())
    }

    fn write_binary(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.socket.lock().unwrap();
        if !guard.can_write() {
            return Err(tungstenite::Error::AlreadyClosed.into());
        }
        tracing::trace!("send: {} binary bytes", data.len());
        guard.send(Message::Binary(data.to_vec()))?;
        Ok(())
    }
}

/// Frame-capturing sink for tests.
#[cfg(test)]
pub mod capture {
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    use super::FrameSink;
    use crate::error::Result;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Frame {
        Text(String),
        Binary(Vec<u8>),
    }

    #[derive(Default)]
    pub struct CaptureSink {
        frames: Mutex<Vec<Frame>>,
        cv: Condvar,
    }

    impl CaptureSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn frames(&self) -> Vec<Frame> {
            self.frames.lock().unwrap().clone()
        }

        pub fn text_frames(&self) -> Vec<String> {
            self.frames()
                .into_iter()
                .filter_map(|f| match f {
                    Frame::Text(t) => Some(t),
                    Frame::Binary(_) => None,
                })
                .collect()
        }

        pub fn clear(&self) {
            self.frames.lock().unwrap().clear();
        }

        /// Block until at least `count` frames have been captured.
        pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
            let guard = self.frames.lock().unwrap();
            let (guard, result) = self
                .cv
                .wait_timeout_while(guard, timeout, |frames| frames.len() < count)
                .unwrap();
            drop(guard);
            !result.timed_out()
        }
    }

    impl FrameSink for CaptureSink {
        fn write_text(&self, message: &str) -> Result<()> {
            self.frames
                .lock()
                .unwrap()
                .push(Frame::Text(message.to_string()));
            self.cv.notify_all();
            Ok(())
        }

        fn write_binary(&self, data: &[u8]) -> Result<()> {
            self.frames.lock().unwrap().push(Frame::Binary(data.to_vec()));
            self.cv.notify_all();
            Ok(())
        }
    }
}
