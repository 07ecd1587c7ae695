//! Application-wide constants for command-port.
//!
//! This module centralizes the wire-level magic values and timeouts so
//! that the codec, session loop and server agree on them.
//!
//! # Categories
//!
//! - **Wire**: terminator and framing limits
//! - **Timeouts**: socket read and shutdown timeouts
//! - **Endpoints**: defaults used while resolving port names

use std::time::Duration;

// ============================================================================
// Wire
// ============================================================================

/// Terminator appended to every response and relayed output line.
///
/// Legacy clients split the response stream on this exact two-byte sequence.
pub const RESPONSE_TERMINATOR: &[u8] = b"\n\x00";

/// Byte sent by the shutdown poke to wake a blocked accept loop.
pub const WAKE_SENTINEL: &[u8] = b"\x00";

/// Smallest read chunk a port will use, whatever the caller asked for.
pub const MIN_BUFFER_SIZE: usize = 16;

/// Read chunk size used when a port is opened without an explicit size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Number of request characters shown to the approver before truncation.
pub const APPROVAL_PREVIEW_CHARS: usize = 300;

/// Marker appended to a truncated approval preview.
pub const APPROVAL_PREVIEW_ELLIPSIS: &str = "...";

/// Message written to a client whose session the approver denied.
pub const EXECUTION_DENIED_MESSAGE: &str = "Execution denied by the command port host";

// ============================================================================
// Timeouts
// ============================================================================

/// Idle read timeout for a session.
///
/// A session wakes at least this often to flush relayed output and to
/// notice that its server is stopping.
pub const SESSION_READ_TIMEOUT: Duration = Duration::from_millis(1500);

/// Timeout for each continuation read while reassembling an oversized request.
pub const REASSEMBLY_READ_TIMEOUT: Duration = Duration::from_millis(1500);

/// Backoff after a failed `accept()` before trying again.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on the self-connect used to wake the accept loop on close.
pub const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Endpoints
// ============================================================================

/// Directory that anchors local-domain port names which are not absolute.
pub const LOCAL_SOCKET_ROOT: &str = "/tmp";

/// Environment variable selecting the preferred IP address family.
pub const IP_TYPE_ENV: &str = "COMMAND_PORT_IP_TYPE";

/// Environment variable pointing at the configuration file.
pub const CONFIG_PATH_ENV: &str = "COMMAND_PORT_CONFIG";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_is_newline_nul() {
        assert_eq!(RESPONSE_TERMINATOR, &[0x0A, 0x00]);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(SESSION_READ_TIMEOUT >= Duration::from_millis(500));
        assert!(SESSION_READ_TIMEOUT <= Duration::from_secs(5));
        assert!(ACCEPT_RETRY_DELAY < SESSION_READ_TIMEOUT);
    }

    #[test]
    fn test_default_buffer_respects_minimum() {
        assert!(DEFAULT_BUFFER_SIZE >= MIN_BUFFER_SIZE);
    }
}
