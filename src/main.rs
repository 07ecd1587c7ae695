//! command-port CLI - serve command ports or send commands to one.
//!
//! This is the main binary entry point. See the `command_port` library for
//! the core functionality.

use anyhow::{Context, Result};
use command_port::{
    commands, dispatch, ApprovalDecision, Approver, Config, OutputRelay, PortOptions, PortRegistry,
};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// How long one pass of the main loop waits for a queued command.
const MAIN_LOOP_TICK: Duration = Duration::from_millis(100);

/// Asks on the controlling terminal before an insecure port runs commands.
#[derive(Debug)]
struct TerminalApprover;

impl Approver for TerminalApprover {
    fn approve(&self, port_name: &str, preview: &str) -> ApprovalDecision {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "Command port {port_name} received:\n  {preview}");
        let _ = write!(stderr, "Allow execution? [y]es / [n]o / [a]lways: ");
        let _ = stderr.flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return ApprovalDecision::Deny;
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => ApprovalDecision::Allow,
            "a" | "always" => ApprovalDecision::AllowAllFuture,
            _ => ApprovalDecision::Deny,
        }
    }
}

/// Opens the configured ports and serves them until a shutdown signal.
///
/// The main thread is the execution context: it pumps the dispatch loop
/// while tokio worker threads run the sockets.
fn run_serve(args: ServeArgs) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let config = Config::load(args.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("command-port-io")
        .build()
        .context("Failed to start tokio runtime")?;

    let (dispatcher, dispatch_loop) = dispatch::channel();
    let registry = PortRegistry::new(
        runtime.handle().clone(),
        dispatcher,
        Arc::new(TerminalApprover),
        OutputRelay::new(),
    )
    .with_default_languages();

    for entry in &config.ports {
        // A bad config entry shouldn't keep the other ports down
        if let Err(e) = registry.open(&entry.name, &entry.lang, entry.options.clone()) {
            log::error!("[CommandPort] Skipping configured port {}: {e}", entry.name);
        }
    }
    if let Some(name) = &args.port {
        registry
            .open(name, &args.lang, args.port_options())
            .with_context(|| format!("Failed to open command port {name}"))?;
    }

    let open = registry.list();
    if open.is_empty() {
        anyhow::bail!("No command ports open (pass --port or list ports in the config file)");
    }
    println!("Serving command ports: {}", open.join(", "));

    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        dispatch_loop.run_for(MAIN_LOOP_TICK);
    }

    println!("Shutting down...");
    runtime.block_on(registry.close_all());
    drop(registry);
    // Release sessions still parked on the dispatcher
    dispatch_loop.run_pending();
    drop(dispatch_loop);
    runtime.shutdown_timeout(Duration::from_secs(2));
    Ok(())
}

fn run_send(name: &str, text: &str, timeout: f64) -> Result<()> {
    let quiet = Duration::try_from_secs_f64(timeout).context("Invalid --timeout")?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;
    let frames = runtime.block_on(commands::send(name, text, quiet))?;
    for frame in frames {
        println!("{frame}");
    }
    Ok(())
}

// CLI
#[derive(Parser)]
#[command(name = "command-port")]
#[command(version)]
#[command(about = "Serve command ports that execute socket-fed commands one at a time")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open command ports and serve them until interrupted
    Serve(ServeArgs),
    /// Send text to a command port and print the replies
    Send {
        /// Port name (host:port, :port, or socket path/name)
        name: String,
        /// Command text to send
        text: String,
        /// Seconds of silence after which the reply is considered complete
        #[arg(long, default_value_t = 2.0)]
        timeout: f64,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Config file (defaults to COMMAND_PORT_CONFIG or the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Extra port to open
    #[arg(long)]
    port: Option<String>,
    /// Language of the extra port
    #[arg(long, default_value = "shell")]
    lang: String,
    /// Command prepended to every request line
    #[arg(long, default_value = "")]
    prefix: String,
    /// Don't send results back
    #[arg(long)]
    no_results: bool,
    /// Reply with the number of commands instead of their output
    #[arg(long)]
    count: bool,
    /// Relay asynchronous interpreter output to clients
    #[arg(long)]
    echo: bool,
    /// Socket read chunk size in bytes
    #[arg(long, default_value_t = command_port::constants::DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,
    /// Ask before the first command of each connection runs
    #[arg(long)]
    security_warning: bool,
    /// Pickle structured results
    #[arg(long)]
    pickle: bool,
}

impl ServeArgs {
    fn port_options(&self) -> PortOptions {
        PortOptions {
            prefix: self.prefix.clone(),
            send_results: !self.no_results,
            return_command_count: self.count,
            echo_output: self.echo,
            buffer_size: self.buffer_size,
            security_warning: self.security_warning,
            pickle_results: self.pickle,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_serve(args)?,
        Commands::Send { name, text, timeout } => run_send(&name, &text, timeout)?,
    }

    Ok(())
}
