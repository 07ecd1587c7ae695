//! First-use approval gate for insecure command ports.
//!
//! A port opened with `security_warning` asks its [`Approver`] before the
//! first command of every session runs. The host supplies the approver (a
//! modal dialog, a terminal prompt, a policy file); the core only awaits
//! its decision.

/// Answer returned by an approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Allow this session only.
    Allow,
    /// Refuse; the session is closed without executing anything.
    Deny,
    /// Allow this session and stop asking for this port.
    AllowAllFuture,
}

/// Per-session approval state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalState {
    /// Not asked yet.
    #[default]
    Unknown,
    /// The approver allowed this session.
    Allowed,
    /// The approver denied this session.
    Denied,
}

/// Asks a human (or policy) whether a client may execute commands.
///
/// Called on the execution context, so implementations may touch host UI
/// that is bound to the main thread.
pub trait Approver: Send + Sync {
    /// Decide for `port_name`, given a preview of the first request.
    fn approve(&self, port_name: &str, preview: &str) -> ApprovalDecision;
}

/// Approver that always returns the same decision.
#[derive(Debug, Clone, Copy)]
pub struct StaticApprover(pub ApprovalDecision);

impl Approver for StaticApprover {
    fn approve(&self, port_name: &str, _preview: &str) -> ApprovalDecision {
        log::debug!("[Approval] {port_name}: static decision {:?}", self.0);
        self.0
    }
}

impl<F> Approver for F
where
    F: Fn(&str, &str) -> ApprovalDecision + Send + Sync,
{
    fn approve(&self, port_name: &str, preview: &str) -> ApprovalDecision {
        self(port_name, preview)
    }
}
