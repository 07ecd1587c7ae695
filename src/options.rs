//! Per-port options and the normalized server configuration.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};

/// Options accepted when opening a command port.
///
/// Deserializable from config files; every field has a default.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PortOptions {
    /// Command prepended to every request line.
    pub prefix: String,
    /// Write evaluation results back to the client.
    pub send_results: bool,
    /// Reply with the number of commands executed instead of their output.
    pub return_command_count: bool,
    /// Relay asynchronous interpreter output to this port's clients.
    pub echo_output: bool,
    /// Socket read chunk size in bytes.
    pub buffer_size: usize,
    /// Ask the approver before the first command of each session runs.
    pub security_warning: bool,
    /// Pickle structured results before sending.
    pub pickle_results: bool,
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            send_results: true,
            return_command_count: false,
            echo_output: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            security_warning: false,
            pickle_results: false,
        }
    }
}

/// Immutable configuration captured when a port is opened.
///
/// Produced from [`PortOptions`] with the interdependent flags resolved:
/// counting and echo only apply while results are being sent, and the read
/// chunk never drops below [`MIN_BUFFER_SIZE`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Command prepended to every request line (empty for none).
    pub prefix: String,
    /// Write evaluation results back to the client.
    pub send_results: bool,
    /// Reply with the command count instead of output.
    pub return_command_count: bool,
    /// Relay asynchronous interpreter output.
    pub echo_output: bool,
    /// Read chunk size in bytes.
    pub buffer_size: usize,
    /// Whether sessions start behind the approval gate.
    pub security_warning: bool,
    /// Pickle structured results.
    pub pickle_results: bool,
}

impl From<PortOptions> for ServerConfig {
    fn from(options: PortOptions) -> Self {
        Self {
            prefix: options.prefix,
            send_results: options.send_results,
            return_command_count: options.return_command_count && options.send_results,
            echo_output: options.echo_output && options.send_results,
            buffer_size: options.buffer_size.max(MIN_BUFFER_SIZE),
            security_warning: options.security_warning,
            pickle_results: options.pickle_results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = PortOptions::default();
        assert!(options.send_results);
        assert!(!options.echo_output);
        assert_eq!(options.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(options.prefix.is_empty());
    }

    #[test]
    fn test_buffer_size_is_clamped() {
        let config = ServerConfig::from(PortOptions {
            buffer_size: 1,
            ..PortOptions::default()
        });
        assert_eq!(config.buffer_size, MIN_BUFFER_SIZE);
    }

    #[test]
    fn test_count_and_echo_require_send_results() {
        let config = ServerConfig::from(PortOptions {
            send_results: false,
            return_command_count: true,
            echo_output: true,
            ..PortOptions::default()
        });
        assert!(!config.return_command_count);
        assert!(!config.echo_output);

        let config = ServerConfig::from(PortOptions {
            return_command_count: true,
            echo_output: true,
            ..PortOptions::default()
        });
        assert!(config.return_command_count);
        assert!(config.echo_output);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: PortOptions =
            serde_json::from_str(r#"{"echo_output": true, "buffer_size": 64}"#).unwrap();
        assert!(options.echo_output);
        assert!(options.send_results);
        assert_eq!(options.buffer_size, 64);
    }
}
