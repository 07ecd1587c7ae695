//! Versioned binary encoding for structured results.
//!
//! Ports opened with `pickle_results` send non-text results in this form,
//! base64-wrapped so the response stays plain text:
//!
//! ```text
//! "CPK" [u8 version] [value]
//!
//! value := 0x00                          none
//!        | 0x01 | 0x02                   false | true
//!        | 0x03 [i64 LE]                 integer
//!        | 0x04 [f64 LE bits]            float
//!        | 0x05 [u32 LE len] [utf-8]     text
//!        | 0x06 [u32 LE count] value*    list
//! ```

use anyhow::{anyhow, bail, Result};
use base64::Engine as _;

use crate::evaluator::ResultValue;

/// Leading magic bytes of every pickle.
pub const MAGIC: &[u8; 3] = b"CPK";

/// Current format version.
pub const VERSION: u8 = 1;

/// Deepest list nesting accepted by the decoder.
const MAX_DEPTH: usize = 64;

/// Value tag constants.
pub mod tag {
    /// No value.
    pub const NONE: u8 = 0x00;
    /// Boolean false.
    pub const FALSE: u8 = 0x01;
    /// Boolean true.
    pub const TRUE: u8 = 0x02;
    /// Little-endian i64.
    pub const INT: u8 = 0x03;
    /// Little-endian f64 bit pattern.
    pub const FLOAT: u8 = 0x04;
    /// Length-prefixed UTF-8.
    pub const TEXT: u8 = 0x05;
    /// Count-prefixed sequence of values.
    pub const LIST: u8 = 0x06;
}

/// Encode a value into pickle bytes.
pub fn encode(value: &ResultValue) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    encode_value(value, &mut buf);
    buf
}

/// Encode a value and wrap it as base64 text for the wire.
pub fn encode_text(value: &ResultValue) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode(value))
}

fn encode_value(value: &ResultValue, buf: &mut Vec<u8>) {
    match value {
        ResultValue::None => buf.push(tag::NONE),
        ResultValue::Bool(false) => buf.push(tag::FALSE),
        ResultValue::Bool(true) => buf.push(tag::TRUE),
        ResultValue::Int(n) => {
            buf.push(tag::INT);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        ResultValue::Float(x) => {
            buf.push(tag::FLOAT);
            buf.extend_from_slice(&x.to_bits().to_le_bytes());
        }
        ResultValue::Text(s) => {
            buf.push(tag::TEXT);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        ResultValue::List(items) => {
            buf.push(tag::LIST);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_value(item, buf);
            }
        }
    }
}

/// Decode pickle bytes back into a value.
///
/// # Errors
///
/// Returns an error on bad magic, unknown version or tag, truncated input,
/// invalid UTF-8 text or trailing bytes.
pub fn decode(bytes: &[u8]) -> Result<ResultValue> {
    if bytes.len() < 4 || &bytes[..3] != MAGIC {
        bail!("Not a command-port pickle");
    }
    if bytes[3] != VERSION {
        bail!("Unsupported pickle version: {}", bytes[3]);
    }
    let mut reader = Reader { bytes, pos: 4 };
    let value = reader.value(0)?;
    if reader.pos != bytes.len() {
        bail!("Trailing bytes after pickle: {}", bytes.len() - reader.pos);
    }
    Ok(value)
}

/// Decode base64-wrapped pickle text as received on the wire.
pub fn decode_text(text: &str) -> Result<ResultValue> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| anyhow!("Invalid base64 pickle: {e}"))?;
    decode(&bytes)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| anyhow!("Truncated pickle at byte {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn word(&mut self) -> Result<[u8; 8]> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(raw)
    }

    fn value(&mut self, depth: usize) -> Result<ResultValue> {
        if depth > MAX_DEPTH {
            bail!("Pickle nested deeper than {MAX_DEPTH}");
        }
        let kind = self.take(1)?[0];
        match kind {
            tag::NONE => Ok(ResultValue::None),
            tag::FALSE => Ok(ResultValue::Bool(false)),
            tag::TRUE => Ok(ResultValue::Bool(true)),
            tag::INT => Ok(ResultValue::Int(i64::from_le_bytes(self.word()?))),
            tag::FLOAT => Ok(ResultValue::Float(f64::from_bits(u64::from_le_bytes(self.word()?)))),
            tag::TEXT => {
                let len = self.u32()? as usize;
                let raw = self.take(len)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|e| anyhow!("Invalid UTF-8 in pickled text: {e}"))?;
                Ok(ResultValue::Text(text.to_string()))
            }
            tag::LIST => {
                let count = self.u32()? as usize;
                // Every item needs at least one byte; reject absurd counts early.
                if count > self.bytes.len() - self.pos {
                    bail!("Pickled list claims {count} items but input is too short");
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Ok(ResultValue::List(items))
            }
            other => bail!("Unknown pickle tag: 0x{other:02x}"),
        }
    }
}
