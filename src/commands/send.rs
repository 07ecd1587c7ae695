//! One-shot command port client.
//!
//! # Examples
//!
//! ```bash
//! command-port send :7001 'echo hello'
//! command-port send /tmp/cmdport 'ls' --timeout 5
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use crate::codec::split_frames;
use crate::endpoint::{resolve_port_name, Endpoint};
use crate::env::AddressFamily;

/// Sends `text` to the port `name` and returns every response frame.
///
/// Frames are collected until the server closes the connection or sends
/// nothing for `quiet`. A port bound to every interface is reached through
/// loopback.
///
/// # Errors
///
/// Returns an error if the name does not resolve, the connection fails, or
/// the socket errors while reading.
pub async fn send(name: &str, text: &str, quiet: Duration) -> Result<Vec<String>> {
    let endpoint = resolve_port_name(name).with_context(|| format!("Cannot resolve {name}"))?;
    match endpoint {
        Endpoint::Tcp(mut addr) => {
            if addr.ip().is_unspecified() {
                let family = if addr.is_ipv6() { AddressFamily::V6 } else { AddressFamily::V4 };
                addr.set_ip(family.loopback());
            }
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("Failed to connect to {addr}"))?;
            exchange(stream, text, quiet).await
        }
        Endpoint::Local(path) => {
            let stream = UnixStream::connect(&path)
                .await
                .with_context(|| format!("Failed to connect to {}", path.display()))?;
            exchange(stream, text, quiet).await
        }
    }
}

async fn exchange<S>(mut stream: S, text: &str, quiet: Duration) -> Result<Vec<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(text.as_bytes()).await?;
    stream.flush().await?;

    let mut pending = Vec::new();
    let mut frames = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match tokio::time::timeout(quiet, stream.read(&mut buf)).await {
            Ok(read) => read.context("Read from command port failed")?,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
        frames.extend(split_frames(&mut pending));
    }
    if !pending.is_empty() {
        log::debug!("[Send] Discarding {} byte(s) of unterminated output", pending.len());
    }
    Ok(frames)
}
