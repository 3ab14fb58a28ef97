//! Error types for the kit worker.

use thiserror::Error;

/// Normal process exit: the last live session was reaped.
pub const EXIT_OK: i32 = 0;

/// Software-failure exit: jail construction, engine load, or a
/// password-handler misuse left the process in an unusable state.
pub const EXIT_SOFTWARE: i32 = 70;

/// Main error type for the kit worker.
#[derive(Error, Debug)]
pub enum KitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Control channel error: {0}")]
    Channel(#[from] Box<tungstenite::Error>),

    #[error("PNG encoding error: {0}")]
    Png(#[from] png::EncodingError),

    #[error("Shared library error: {0}")]
    Library(#[from] libloading::Error),

    #[error("Jail setup failed: {0}")]
    Jail(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<tungstenite::Error> for KitError {
    fn from(err: tungstenite::Error) -> Self {
        Self::Channel(Box::new(err))
    }
}

/// Result type alias for kit worker operations.
pub type Result<T> = std::result::Result<T, KitError>;

/// Log and terminate immediately with the software-failure exit code.
///
/// Used for errors after which the process must not continue: a partially
/// built jail, a failed privilege drop, or an unusable engine.
pub fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}. Exiting.");
    std::process::exit(EXIT_SOFTWARE);
}
