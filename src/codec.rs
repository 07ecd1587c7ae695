//! Wire codec for command-port sessions.
//!
//! The protocol has no length prefix. A request is whatever one read
//! returns, with trailing NUL padding removed:
//!
//! ```text
//! client → server   <utf-8 command text> [NUL padding]
//! server → client   <line> 0x0A 0x00  (one per output line / result)
//! ```
//!
//! A read that fills the whole buffer is treated as the first chunk of an
//! oversized request: reading continues until a short read, EOF, or a
//! [`REASSEMBLY_READ_TIMEOUT`] with no data.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::{
    APPROVAL_PREVIEW_CHARS, APPROVAL_PREVIEW_ELLIPSIS, EXECUTION_DENIED_MESSAGE,
    REASSEMBLY_READ_TIMEOUT, RESPONSE_TERMINATOR,
};
use crate::error::{CommandPortError, Result};
use crate::evaluator::{EvalError, Evaluation, Evaluator};
use crate::options::ServerConfig;
use crate::pickle;

/// One decoded command unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    text: String,
}

impl Request {
    /// Wrap decoded request text.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Request text as received (NULs stripped, whitespace trimmed).
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of newline-delimited statements.
    pub fn command_count(&self) -> usize {
        1 + self.text.matches('\n').count()
    }

    /// Text handed to the evaluator: every line wrapped by `prefix` when set.
    pub fn effective_text(&self, prefix: &str, evaluator: &dyn Evaluator) -> String {
        if prefix.is_empty() {
            return self.text.clone();
        }
        self.text
            .split('\n')
            .map(|line| evaluator.apply_prefix(prefix, line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Text shown to the approver: at most 300 characters, ellipsis if cut.
    pub fn approval_preview(&self) -> String {
        approval_preview(&self.text)
    }
}

/// Result of one attempt to read a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete request.
    Request(Request),
    /// Nothing arrived within the idle timeout.
    Idle,
    /// The client hung up (EOF or a read of only NUL bytes).
    HangUp,
}

/// Reads requests using the legacy chunk-reassembly framing.
#[derive(Debug, Clone)]
pub struct RequestReader {
    buffer_size: usize,
    reassembly_timeout: Duration,
}

impl RequestReader {
    /// Reader using `buffer_size` byte chunks.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            reassembly_timeout: REASSEMBLY_READ_TIMEOUT,
        }
    }

    /// Override the continuation-read timeout.
    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Read one request, waiting at most `idle_timeout` for the first byte.
    ///
    /// # Errors
    ///
    /// `InvalidEncoding` when the assembled bytes are not UTF-8 (the bytes
    /// are consumed and the connection is still usable); `Socket` on I/O
    /// failure.
    pub async fn read<R>(&self, reader: &mut R, idle_timeout: Duration) -> Result<ReadOutcome>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; self.buffer_size];

        let n = match tokio::time::timeout(idle_timeout, reader.read(&mut chunk)).await {
            Err(_elapsed) => return Ok(ReadOutcome::Idle),
            Ok(result) => result?,
        };
        if n == 0 || strip_trailing_nuls(&chunk[..n]).is_empty() {
            return Ok(ReadOutcome::HangUp);
        }

        let mut data = chunk[..n].to_vec();
        let mut last = n;
        while last >= self.buffer_size {
            match tokio::time::timeout(self.reassembly_timeout, reader.read(&mut chunk)).await {
                // No more data, go with what we have
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(m)) => {
                    data.extend_from_slice(&chunk[..m]);
                    last = m;
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        Ok(decode_request(&data)?.map_or(ReadOutcome::HangUp, ReadOutcome::Request))
    }
}

fn strip_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |ix| ix + 1);
    &bytes[..end]
}

/// Decode raw request bytes.
///
/// Returns `None` when nothing but NUL padding arrived.
///
/// # Errors
///
/// `InvalidEncoding` when the bytes are not UTF-8.
pub fn decode_request(bytes: &[u8]) -> Result<Option<Request>> {
    let stripped = strip_trailing_nuls(bytes);
    if stripped.is_empty() {
        return Ok(None);
    }
    let text = std::str::from_utf8(stripped).map_err(|e| {
        log::debug!("[Codec] Undecodable request: {e}");
        CommandPortError::InvalidEncoding
    })?;
    Ok(Some(Request::new(text.trim())))
}

/// Append the terminator to one line of text.
pub fn encode_line(text: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(text.len() + RESPONSE_TERMINATOR.len());
    buf.extend_from_slice(text.as_bytes());
    buf.extend_from_slice(RESPONSE_TERMINATOR);
    buf
}

/// Encode the response to `request` according to the port's configuration.
///
/// - results disabled: terminator only
/// - command counting: `1 + newlines`, whatever the evaluator did
/// - otherwise: each output line, then the value (pickled unless it is
///   text), or the error text
pub fn encode_response(
    config: &ServerConfig,
    request: &Request,
    outcome: &std::result::Result<Evaluation, EvalError>,
) -> Vec<u8> {
    if !config.send_results {
        return RESPONSE_TERMINATOR.to_vec();
    }
    if config.return_command_count {
        return encode_line(&request.command_count().to_string());
    }
    match outcome {
        Err(e) => encode_line(e.0.trim()),
        Ok(evaluation) => {
            let mut buf = Vec::new();
            for line in &evaluation.output {
                buf.extend_from_slice(&encode_line(line));
            }
            let payload = if config.pickle_results && !evaluation.value.is_text() {
                pickle::encode_text(&evaluation.value)
            } else {
                evaluation.value.render().trim().to_string()
            };
            buf.extend_from_slice(&encode_line(&payload));
            buf
        }
    }
}

/// Fixed response sent to a session the approver denied.
pub fn denial_response() -> Vec<u8> {
    encode_line(EXECUTION_DENIED_MESSAGE)
}

/// Truncate `text` to the approval preview length.
pub fn approval_preview(text: &str) -> String {
    match text.char_indices().nth(APPROVAL_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}{APPROVAL_PREVIEW_ELLIPSIS}", &text[..cut]),
        None => text.to_string(),
    }
}

/// Split a byte stream received by a client into terminator-delimited frames.
///
/// Returns the complete frames and leaves any partial tail in `buf`.
pub fn split_frames(buf: &mut Vec<u8>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(ix) = buf
        .windows(RESPONSE_TERMINATOR.len())
        .position(|w| w == RESPONSE_TERMINATOR)
    {
        frames.push(String::from_utf8_lossy(&buf[..ix]).into_owned());
        buf.drain(..ix + RESPONSE_TERMINATOR.len());
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::ResultValue;
    use crate::options::PortOptions;
    use tokio::io::AsyncWriteExt;

    struct Upper;

    impl Evaluator for Upper {
        fn evaluate(&self, source: &str) -> std::result::Result<Evaluation, EvalError> {
            Ok(Evaluation::value(source.to_uppercase()))
        }
    }

    fn config(options: PortOptions) -> ServerConfig {
        ServerConfig::from(options)
    }

    #[test]
    fn test_decode_strips_nul_padding_and_whitespace() {
        let request = decode_request(b"  ls -sl\n\0\0\0").unwrap().unwrap();
        assert_eq!(request.text(), "ls -sl");
    }

    #[test]
    fn test_decode_only_nuls_is_hang_up() {
        assert_eq!(decode_request(b"\0").unwrap(), None);
        assert_eq!(decode_request(b"").unwrap(), None);
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert!(matches!(
            decode_request(b"\xff\xfe"),
            Err(CommandPortError::InvalidEncoding)
        ));
    }

    #[test]
    fn test_command_count() {
        assert_eq!(Request::new("a").command_count(), 1);
        assert_eq!(Request::new("a\nb").command_count(), 2);
        assert_eq!(Request::new("a\nb\nc").command_count(), 3);
    }

    #[test]
    fn test_effective_text_wraps_each_line() {
        let request = Request::new("one\ntwo");
        assert_eq!(request.effective_text("", &Upper), "one\ntwo");
        assert_eq!(
            request.effective_text("echo", &Upper),
            "echo \"one\";\necho \"two\";"
        );
    }

    #[test]
    fn test_response_without_results_is_terminator_only() {
        let cfg = config(PortOptions {
            send_results: false,
            ..PortOptions::default()
        });
        let outcome = Ok(Evaluation::value("ignored").with_output(vec!["noise".into()]));
        assert_eq!(encode_response(&cfg, &Request::new("x"), &outcome), b"\n\0");
        let failed = Err(EvalError::new("boom"));
        assert_eq!(encode_response(&cfg, &Request::new("x"), &failed), b"\n\0");
    }

    #[test]
    fn test_response_command_count_ignores_outcome() {
        let cfg = config(PortOptions {
            return_command_count: true,
            ..PortOptions::default()
        });
        let failed = Err(EvalError::new("syntax error"));
        assert_eq!(encode_response(&cfg, &Request::new("a\nb"), &failed), b"2\n\0");
    }

    #[test]
    fn test_response_output_then_value() {
        let cfg = config(PortOptions::default());
        let outcome = Ok(Evaluation::value(ResultValue::Int(2)).with_output(vec!["hi".into()]));
        assert_eq!(encode_response(&cfg, &Request::new("x"), &outcome), b"hi\n\02\n\0");
    }

    #[test]
    fn test_response_error_is_never_pickled() {
        let cfg = config(PortOptions {
            pickle_results: true,
            ..PortOptions::default()
        });
        let failed = Err(EvalError::new("NameError: x\n"));
        assert_eq!(encode_response(&cfg, &Request::new("x"), &failed), b"NameError: x\n\0");
    }

    #[test]
    fn test_response_pickles_structured_but_not_text() {
        let cfg = config(PortOptions {
            pickle_results: true,
            ..PortOptions::default()
        });
        let text = Ok(Evaluation::value("plain"));
        assert_eq!(encode_response(&cfg, &Request::new("x"), &text), b"plain\n\0");

        let list = ResultValue::from(vec![1_i64, 2]);
        let bytes = encode_response(&cfg, &Request::new("x"), &Ok(Evaluation::value(list.clone())));
        let mut buf = bytes;
        let frames = split_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(pickle::decode_text(&frames[0]).unwrap(), list);
    }

    #[test]
    fn test_approval_preview_truncates_at_300_chars() {
        let short = "x".repeat(300);
        assert_eq!(approval_preview(&short), short);

        let long = "é".repeat(301);
        let preview = approval_preview(&long);
        assert_eq!(preview.chars().count(), 303);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_split_frames_keeps_partial_tail() {
        let mut buf = b"a\n\0b\n\0par".to_vec();
        assert_eq!(split_frames(&mut buf), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(buf, b"par");
    }

    #[tokio::test]
    async fn test_reader_reassembles_oversized_request() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let reader = RequestReader::new(16).with_reassembly_timeout(Duration::from_millis(200));

        let text = "print('abcdefghijklmnopqrstuvwxyz')";
        client.write_all(text.as_bytes()).await.unwrap();

        let outcome = reader.read(&mut server, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Request(Request::new(text)));
    }

    #[tokio::test]
    async fn test_reader_stops_on_quiet_or_closed_stream_after_full_chunk() {
        let reader = RequestReader::new(16).with_reassembly_timeout(Duration::from_millis(100));
        let text = "0123456789abcdef0123456789abcdef";

        // Exact multiple of the chunk size: the continuation read times out
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(text.as_bytes()).await.unwrap();
        let outcome = reader.read(&mut server, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Request(Request::new(text)));

        // Same, but the client hangs up right after sending
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(text.as_bytes()).await.unwrap();
        drop(client);
        let outcome = reader.read(&mut server, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Request(Request::new(text)));
    }

    #[tokio::test]
    async fn test_reader_idle_and_hang_up() {
        let (client, mut server) = tokio::io::duplex(64);
        let reader = RequestReader::new(32);

        let outcome = reader.read(&mut server, Duration::from_millis(50)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Idle);

        drop(client);
        let outcome = reader.read(&mut server, Duration::from_millis(50)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::HangUp);
    }

    #[tokio::test]
    async fn test_reader_sentinel_byte_is_hang_up() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\0").await.unwrap();
        let outcome = RequestReader::new(32)
            .read(&mut server, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::HangUp);
    }

    #[tokio::test]
    async fn test_reader_invalid_utf8_keeps_stream_usable() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let reader = RequestReader::new(32);

        client.write_all(b"\xff\xfe").await.unwrap();
        let err = reader.read(&mut server, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CommandPortError::InvalidEncoding));

        client.write_all(b"ok").await.unwrap();
        let outcome = reader.read(&mut server, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Request(Request::new("ok")));
    }
}
