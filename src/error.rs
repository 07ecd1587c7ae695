//! Error types for the command-port subsystem.
//!
//! Registry-level errors (`InvalidName`, `InvalidPort`, `LanguageUnsupported`,
//! `AlreadyActive`, `NoSuchPort`) are returned to the caller of `open` and
//! `close`. Session-level errors (`InvalidEncoding`, `Socket`,
//! `ExecutionDenied`) end a single session and are only logged.

/// Errors that can occur while managing or serving command ports.
#[derive(Debug)]
pub enum CommandPortError {
    /// Port name is empty or does not parse into an endpoint.
    InvalidName(String),
    /// Port number is outside 1-65535.
    InvalidPort(String),
    /// No evaluator factory is registered for the language key.
    LanguageUnsupported(String),
    /// A port with this name is already open.
    AlreadyActive(String),
    /// No port with this name is open.
    NoSuchPort(String),
    /// Request bytes are not valid UTF-8.
    InvalidEncoding,
    /// Transport failure, either while binding a port or on one session.
    Socket(std::io::Error),
    /// The approver refused to let this session execute commands.
    ExecutionDenied,
    /// The execution context is gone (its loop exited or a job panicked).
    DispatcherClosed,
}

impl std::fmt::Display for CommandPortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "Invalid command port name: {name:?}"),
            Self::InvalidPort(name) => write!(f, "Invalid port number in command port name: {name:?}"),
            Self::LanguageUnsupported(lang) => write!(f, "Language not supported: {lang:?}"),
            Self::AlreadyActive(name) => write!(f, "Command port {name:?} is already active"),
            Self::NoSuchPort(name) => write!(f, "No such command port: {name:?}"),
            Self::InvalidEncoding => write!(f, "Request is not valid UTF-8"),
            Self::Socket(e) => write!(f, "Socket error: {e}"),
            Self::ExecutionDenied => write!(f, "Execution denied"),
            Self::DispatcherClosed => write!(f, "Execution context is not running"),
        }
    }
}

impl std::error::Error for CommandPortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Socket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CommandPortError {
    fn from(e: std::io::Error) -> Self {
        Self::Socket(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = CommandPortError> = std::result::Result<T, E>;
