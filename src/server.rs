//! Command port server: one listening socket and its accept loop.
//!
//! Binds a TCP or Unix-domain listener and spawns an accept loop that runs
//! a session task for every connection.
//!
//! # Lifecycle
//!
//! ```text
//! Starting ──bind──► Listening ──shutdown()──► Stopping ──accept loop exits──► Stopped
//! ```
//!
//! `shutdown` sets the stop flag, then connects to the port once and sends a
//! single NUL byte so a pending `accept()` returns and sees the flag. Open
//! sessions notice the flag within one read timeout and close.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::approval::Approver;
use crate::constants::{ACCEPT_RETRY_DELAY, SESSION_READ_TIMEOUT, WAKE_CONNECT_TIMEOUT, WAKE_SENTINEL};
use crate::dispatch::Dispatcher;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::options::ServerConfig;
use crate::relay::OutputRelay;
use crate::session::{generate_session_id, run_session};

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Listening,
    /// Stop requested; accept loop winding down.
    Stopping,
    /// Accept loop finished, listener released.
    Stopped,
}

/// State shared between a server, its accept loop and its sessions.
pub(crate) struct ServerShared {
    pub(crate) name: String,
    pub(crate) config: ServerConfig,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) approver: Arc<dyn Approver>,
    pub(crate) relay: OutputRelay,
    /// Starts as `config.security_warning`; cleared by an allow-all answer.
    pub(crate) security_warning: AtomicBool,
    pub(crate) active_sessions: AtomicUsize,
    stopping: AtomicBool,
    state: Mutex<ServerState>,
}

impl ServerShared {
    pub(crate) fn new(
        name: String,
        config: ServerConfig,
        evaluator: Arc<dyn Evaluator>,
        dispatcher: Dispatcher,
        approver: Arc<dyn Approver>,
        relay: OutputRelay,
    ) -> Self {
        Self {
            security_warning: AtomicBool::new(config.security_warning),
            name,
            config,
            evaluator,
            dispatcher,
            approver,
            relay,
            active_sessions: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            state: Mutex::new(ServerState::Starting),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn state(&self) -> ServerState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: ServerState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Local(UnixListener),
}

enum Connection {
    Tcp(TcpStream),
    Local(UnixStream),
}

/// One open command port.
pub struct CommandPortServer {
    endpoint: Endpoint,
    shared: Arc<ServerShared>,
    accept_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CommandPortServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPortServer")
            .field("name", &self.shared.name)
            .field("endpoint", &self.endpoint)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl CommandPortServer {
    /// Bind `endpoint` and spawn the accept loop on `runtime`.
    ///
    /// A stale Unix socket file at the endpoint path is removed first.
    ///
    /// # Errors
    ///
    /// Returns `Socket` if the listener cannot be bound.
    pub(crate) fn start(endpoint: Endpoint, shared: ServerShared, runtime: &Handle) -> Result<Self> {
        let shared = Arc::new(shared);
        let _guard = runtime.enter();

        let (listener, endpoint) = match endpoint {
            Endpoint::Tcp(addr) => {
                let std_listener = std::net::TcpListener::bind(addr)?;
                std_listener.set_nonblocking(true)?;
                let bound = std_listener.local_addr()?;
                (Listener::Tcp(TcpListener::from_std(std_listener)?), Endpoint::Tcp(bound))
            }
            Endpoint::Local(path) => {
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        // Probably won't be able to bind, but try anyway
                        log::warn!("[CommandPort] Failed to remove stale socket {}: {e}", path.display());
                    }
                }
                let std_listener = std::os::unix::net::UnixListener::bind(&path)?;
                std_listener.set_nonblocking(true)?;
                (Listener::Local(UnixListener::from_std(std_listener)?), Endpoint::Local(path))
            }
        };

        log::info!(
            "[CommandPort] {} listening on {} ({})",
            shared.name,
            endpoint,
            endpoint.family_label()
        );
        shared.set_state(ServerState::Listening);
        let accept_handle = runtime.spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(Self {
            endpoint,
            shared,
            accept_handle: Some(accept_handle),
        })
    }

    /// Port name this server was opened under.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Bound endpoint (for TCP, the actual local address).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Number of sessions currently being served.
    pub fn session_count(&self) -> usize {
        self.shared.active_sessions.load(Ordering::SeqCst)
    }

    /// Stop accepting, wait for the accept loop, release the endpoint.
    ///
    /// Commands already running on the execution context are not
    /// interrupted; their sessions close after replying.
    pub async fn shutdown(mut self) {
        log::info!("[CommandPort] Closing {}", self.shared.name);
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.set_state(ServerState::Stopping);

        wake_accept_loop(&self.endpoint).await;

        if let Some(mut handle) = self.accept_handle.take() {
            if tokio::time::timeout(SESSION_READ_TIMEOUT, &mut handle).await.is_err() {
                log::warn!("[CommandPort] {} accept loop did not wake, aborting it", self.shared.name);
                handle.abort();
            }
        }

        if let Endpoint::Local(path) = &self.endpoint {
            remove_socket_file(path);
        }
        self.shared.set_state(ServerState::Stopped);
        log::info!("[CommandPort] {} closed", self.shared.name);
    }
}

impl Drop for CommandPortServer {
    fn drop(&mut self) {
        // Only reached without shutdown() when the owner is torn down abruptly
        if let Some(handle) = self.accept_handle.take() {
            self.shared.stopping.store(true, Ordering::SeqCst);
            handle.abort();
            if let Endpoint::Local(path) = &self.endpoint {
                remove_socket_file(path);
            }
            self.shared.set_state(ServerState::Stopped);
        }
    }
}

fn remove_socket_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::debug!("[CommandPort] Socket file {} not removed: {e}", path.display());
    }
}

/// Accept loop: runs as a tokio task until the stop flag is seen.
async fn accept_loop(listener: Listener, shared: Arc<ServerShared>) {
    loop {
        let accepted = match &listener {
            Listener::Tcp(l) => l
                .accept()
                .await
                .map(|(stream, addr)| (Connection::Tcp(stream), addr.to_string())),
            Listener::Local(l) => l
                .accept()
                .await
                .map(|(stream, _addr)| (Connection::Local(stream), "local client".to_string())),
        };

        if shared.is_stopping() {
            // A connection accepted now is the wake-up poke; dropping it closes it unserved
            log::info!("[CommandPort] {} stop flag set, leaving accept loop", shared.name);
            break;
        }

        match accepted {
            Ok((connection, peer)) => {
                log::info!("[CommandPort] {} accepted {peer}", shared.name);
                let id = generate_session_id(&shared.name);
                match connection {
                    Connection::Tcp(stream) => tokio::spawn(run_session(id, stream, Arc::clone(&shared))),
                    Connection::Local(stream) => tokio::spawn(run_session(id, stream, Arc::clone(&shared))),
                };
            }
            Err(e) => {
                log::error!("[CommandPort] {} accept error: {e}", shared.name);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Connect to our own endpoint and poke it so a blocked `accept()` returns.
async fn wake_accept_loop(endpoint: &Endpoint) {
    let poke = async {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let mut target = *addr;
                if target.ip().is_unspecified() {
                    let loopback = if target.is_ipv6() {
                        crate::env::AddressFamily::V6.loopback()
                    } else {
                        crate::env::AddressFamily::V4.loopback()
                    };
                    target.set_ip(loopback);
                }
                let mut stream = TcpStream::connect(target).await?;
                stream.write_all(WAKE_SENTINEL).await
            }
            Endpoint::Local(path) => {
                let mut stream = UnixStream::connect(path).await?;
                stream.write_all(WAKE_SENTINEL).await
            }
        }
    };
    match tokio::time::timeout(WAKE_CONNECT_TIMEOUT, poke).await {
        Ok(Ok(())) => {}
        // Several errors are fine here: the socket is being closed anyway
        Ok(Err(e)) => log::debug!("[CommandPort] Wake-up connect to {endpoint} failed: {e}"),
        Err(_) => log::debug!("[CommandPort] Wake-up connect to {endpoint} timed out"),
    }
}
