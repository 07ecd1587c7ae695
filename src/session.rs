//! Per-connection session loop.
//!
//! Each accepted connection runs [`run_session`] as its own tokio task:
//!
//! 1. flush relayed interpreter output (echo ports only)
//! 2. wait up to [`SESSION_READ_TIMEOUT`] for a request
//! 3. on the first request of an insecure port, ask the approver
//! 4. evaluate on the execution context, write the encoded response
//!
//! Any error ends this session only; the server and other sessions keep
//! running.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::approval::{ApprovalDecision, ApprovalState};
use crate::codec::{self, ReadOutcome, Request, RequestReader};
use crate::constants::SESSION_READ_TIMEOUT;
use crate::error::{CommandPortError, Result};
use crate::relay::OutputSubscription;
use crate::server::ServerShared;

/// One accepted connection and its loop state.
struct Session<S> {
    id: String,
    stream: S,
    reader: RequestReader,
    approval: ApprovalState,
    output: Option<OutputSubscription>,
    shared: Arc<ServerShared>,
}

/// Serve one connection until the client hangs up, the port closes, or an
/// error ends it.
pub(crate) async fn run_session<S>(id: String, stream: S, shared: Arc<ServerShared>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    shared.active_sessions.fetch_add(1, Ordering::SeqCst);
    let output = shared.config.echo_output.then(|| shared.relay.subscribe());
    let mut session = Session {
        reader: RequestReader::new(shared.config.buffer_size),
        id,
        stream,
        approval: ApprovalState::Unknown,
        output,
        shared: Arc::clone(&shared),
    };

    match session.serve().await {
        Ok(()) => log::info!("[CommandPort] Session {} closed", session.id),
        Err(CommandPortError::ExecutionDenied) => {
            log::warn!("[CommandPort] Session {} denied by approver", session.id);
        }
        Err(e) => log::warn!("[CommandPort] Session {} ended: {e}", session.id),
    }

    // Best effort: the peer may already be gone
    let _ = session.stream.shutdown().await;
    drop(session);
    shared.active_sessions.fetch_sub(1, Ordering::SeqCst);
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn serve(&mut self) -> Result<()> {
        loop {
            if self.shared.is_stopping() {
                log::debug!("[CommandPort] Session {} sees port closing", self.id);
                return Ok(());
            }

            self.flush_output().await?;

            let request = match self.reader.read(&mut self.stream, SESSION_READ_TIMEOUT).await {
                Ok(ReadOutcome::Request(request)) => request,
                Ok(ReadOutcome::Idle) => continue,
                Ok(ReadOutcome::HangUp) => return Ok(()),
                Err(CommandPortError::InvalidEncoding) => {
                    // Dropped without a reply, matching legacy clients' expectations
                    log::warn!("[CommandPort] Session {}: request is not valid UTF-8, ignored", self.id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.check_approval(&request).await?;

            let response = self.execute(request).await?;
            self.stream.write_all(&response).await?;
            self.stream.flush().await?;
        }
    }

    async fn flush_output(&mut self) -> Result<()> {
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };
        let lines = output.drain();
        if lines.is_empty() {
            return Ok(());
        }
        for line in &lines {
            self.stream.write_all(&codec::encode_line(line)).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn check_approval(&mut self, request: &Request) -> Result<()> {
        if self.approval != ApprovalState::Unknown {
            return Ok(());
        }
        if !self.shared.security_warning.load(Ordering::SeqCst) {
            self.approval = ApprovalState::Allowed;
            return Ok(());
        }

        let preview = request.approval_preview();
        let shared = Arc::clone(&self.shared);
        let decision = self
            .shared
            .dispatcher
            .run(move || shared.approver.approve(&shared.name, &preview))
            .await?;
        log::info!("[CommandPort] Session {}: approval {:?}", self.id, decision);

        match decision {
            ApprovalDecision::Allow => {
                self.approval = ApprovalState::Allowed;
                Ok(())
            }
            ApprovalDecision::AllowAllFuture => {
                self.shared.security_warning.store(false, Ordering::SeqCst);
                self.approval = ApprovalState::Allowed;
                Ok(())
            }
            ApprovalDecision::Deny => {
                self.approval = ApprovalState::Denied;
                self.stream.write_all(&codec::denial_response()).await?;
                self.stream.flush().await?;
                Err(CommandPortError::ExecutionDenied)
            }
        }
    }

    async fn execute(&self, request: Request) -> Result<Vec<u8>> {
        let shared = Arc::clone(&self.shared);
        log::debug!(
            "[CommandPort] Session {}: executing {} command(s)",
            self.id,
            request.command_count()
        );
        self.shared
            .dispatcher
            .run(move || {
                let source = request.effective_text(&shared.config.prefix, shared.evaluator.as_ref());
                let outcome = shared.evaluator.evaluate(&source);
                if let Err(e) = &outcome {
                    log::debug!("[CommandPort] {}: evaluation failed: {e}", shared.name);
                }
                codec::encode_response(&shared.config, &request, &outcome)
            })
            .await
    }
}

/// Generate a session ID from the port name, a counter and a random suffix.
pub(crate) fn generate_session_id(port_name: &str) -> String {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("{port_name}#{seq:x}{rand:04x}")
}
