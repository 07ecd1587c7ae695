//! Command port - remote command execution for a single-threaded interpreter.
//!
//! Clients connect over TCP or a Unix-domain socket, send command text and
//! read back terminator-delimited results. Commands from every session of
//! every port run one at a time on a single execution context, so the
//! hosted interpreter never sees concurrent calls.
//!
//! # Architecture
//!
//! - **PortRegistry** - name → live server; validates names, binds, closes
//! - **CommandPortServer** - listener plus accept loop (tokio task)
//! - **Session** - per-connection read / approve / execute / reply loop
//! - **Dispatcher** - hands jobs to the one [`DispatchLoop`]
//! - **Evaluator** - language interpreter bound to a port
//! - **OutputRelay** - fans asynchronous interpreter output out to sessions
//!
//! # Modules
//!
//! - [`registry`] - open/close/list ports
//! - [`endpoint`] - port name parsing and resolution
//! - [`codec`] - request decoding and response encoding
//! - [`pickle`] - binary encoding of structured results
//! - [`config`] - configuration loading/saving

pub mod approval;
pub mod codec;
pub mod commands;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod endpoint;
pub mod env;
pub mod error;
pub mod evaluator;
pub mod options;
pub mod pickle;
pub mod registry;
pub mod relay;
pub mod server;
pub mod shell;

mod session;

// Re-export commonly used types
pub use approval::{ApprovalDecision, Approver, StaticApprover};
pub use config::{Config, PortEntry};
pub use dispatch::{DispatchLoop, Dispatcher};
pub use endpoint::Endpoint;
pub use error::{CommandPortError, Result};
pub use evaluator::{EvalError, Evaluation, Evaluator, ResultValue};
pub use options::{PortOptions, ServerConfig};
pub use registry::PortRegistry;
pub use relay::OutputRelay;
pub use server::{CommandPortServer, ServerState};
pub use shell::ShellEvaluator;
