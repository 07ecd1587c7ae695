//! Registry of open command ports.
//!
//! Owns every live [`CommandPortServer`] keyed by port name, plus the table
//! of language evaluators that `open` can bind a port to. All ports share
//! one [`Dispatcher`], so commands from every port run on the same
//! execution context.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;

use crate::approval::Approver;
use crate::dispatch::Dispatcher;
use crate::endpoint::{parse_port_name, Endpoint};
use crate::env::AddressFamily;
use crate::error::{CommandPortError, Result};
use crate::evaluator::{Evaluator, EvaluatorFactory};
use crate::options::{PortOptions, ServerConfig};
use crate::relay::OutputRelay;
use crate::server::{CommandPortServer, ServerShared};
use crate::shell::ShellEvaluator;

/// Language key of the built-in shell evaluator.
pub const SHELL_LANGUAGE: &str = "shell";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Name → live server map.
pub struct PortRegistry {
    ports: Mutex<HashMap<String, CommandPortServer>>,
    /// Names whose `open` is resolving or binding outside the `ports` lock.
    opening: Mutex<HashSet<String>>,
    languages: Mutex<HashMap<String, EvaluatorFactory>>,
    dispatcher: Dispatcher,
    approver: Arc<dyn Approver>,
    relay: OutputRelay,
    runtime: Handle,
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("ports", &self.list())
            .field("languages", &self.languages())
            .finish_non_exhaustive()
    }
}

impl PortRegistry {
    /// Create an empty registry with no languages registered.
    ///
    /// Accept loops and sessions are spawned on `runtime`.
    pub fn new(runtime: Handle, dispatcher: Dispatcher, approver: Arc<dyn Approver>, relay: OutputRelay) -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            opening: Mutex::new(HashSet::new()),
            languages: Mutex::new(HashMap::new()),
            dispatcher,
            approver,
            relay,
            runtime,
        }
    }

    /// Register the built-in `"shell"` language.
    #[must_use]
    pub fn with_default_languages(self) -> Self {
        let relay = self.relay.clone();
        self.register_language(SHELL_LANGUAGE, move || {
            Arc::new(ShellEvaluator::new().with_relay(relay.clone())) as Arc<dyn Evaluator>
        });
        self
    }

    /// Register (or replace) the evaluator factory for `lang`.
    pub fn register_language<F>(&self, lang: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Evaluator> + Send + Sync + 'static,
    {
        let factory: EvaluatorFactory = Arc::new(factory);
        if lock(&self.languages).insert(lang.to_string(), factory).is_some() {
            log::info!("[CommandPort] Replaced evaluator for language {lang:?}");
        }
    }

    /// Registered language keys, sorted.
    pub fn languages(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.languages).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Open a command port.
    ///
    /// Binds the endpoint, spawns its accept loop and returns without
    /// waiting for clients.
    ///
    /// # Errors
    ///
    /// `InvalidName`/`InvalidPort` for a malformed name, `LanguageUnsupported`
    /// for an unknown `lang`, `AlreadyActive` if `name` is open or another
    /// `open` of it is in progress, `Socket` if binding fails.
    pub fn open(&self, name: &str, lang: &str, options: PortOptions) -> Result<()> {
        let spec = parse_port_name(name)?;

        let factory = lock(&self.languages)
            .get(lang)
            .cloned()
            .ok_or_else(|| CommandPortError::LanguageUnsupported(lang.to_string()))?;

        // Host lookup and bind can block, so they run without the map locked
        let _reservation = self.reserve(name)?;

        let endpoint = spec.resolve(name, AddressFamily::preferred())?;
        let shared = ServerShared::new(
            name.to_string(),
            ServerConfig::from(options),
            factory(),
            self.dispatcher.clone(),
            Arc::clone(&self.approver),
            self.relay.clone(),
        );
        let server = CommandPortServer::start(endpoint, shared, &self.runtime).map_err(|e| {
            log::error!("[CommandPort] Failed to open {name}: {e}");
            e
        })?;

        log::info!("[CommandPort] Opened {name} ({lang})");
        lock(&self.ports).insert(name.to_string(), server);
        Ok(())
    }

    /// Claim `name` for an `open` in progress.
    fn reserve(&self, name: &str) -> Result<Reservation<'_>> {
        let ports = lock(&self.ports);
        let mut opening = lock(&self.opening);
        if ports.contains_key(name) || !opening.insert(name.to_string()) {
            return Err(CommandPortError::AlreadyActive(name.to_string()));
        }
        Ok(Reservation {
            opening: &self.opening,
            name: name.to_string(),
        })
    }

    /// Close the port registered under `name`.
    ///
    /// The entry is removed first, so the name can be reopened as soon as
    /// this returns.
    ///
    /// # Errors
    ///
    /// `NoSuchPort` if `name` is not open.
    pub async fn close(&self, name: &str) -> Result<()> {
        let server = lock(&self.ports)
            .remove(name)
            .ok_or_else(|| CommandPortError::NoSuchPort(name.to_string()))?;
        server.shutdown().await;
        Ok(())
    }

    /// Close every open port.
    pub async fn close_all(&self) {
        let servers: Vec<CommandPortServer> = lock(&self.ports).drain().map(|(_, server)| server).collect();
        if servers.is_empty() {
            return;
        }
        log::info!("[CommandPort] Closing {} port(s)", servers.len());
        for server in servers {
            server.shutdown().await;
        }
    }

    /// Names of the open ports, in no particular order.
    pub fn list(&self) -> Vec<String> {
        lock(&self.ports).keys().cloned().collect()
    }

    /// Bound endpoint of an open port.
    pub fn endpoint(&self, name: &str) -> Option<Endpoint> {
        lock(&self.ports).get(name).map(|server| server.endpoint().clone())
    }

    /// Relay that echo-enabled ports read asynchronous output from.
    pub fn relay(&self) -> &OutputRelay {
        &self.relay
    }
}

/// Releases an `open` claim on drop, whether or not the open succeeded.
struct Reservation<'a> {
    opening: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.opening).remove(&self.name);
    }
}
