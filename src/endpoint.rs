//! Port name → endpoint resolution.
//!
//! A command port is named by a single string whose shape decides the
//! transport:
//!
//! ```text
//! "host:7001"      TCP, host resolved in the preferred family
//! ":7001"          TCP, any host
//! "[::1]:7001"     TCP, brackets stripped before splitting
//! "/var/run/cmd"   Unix-domain socket at that absolute path
//! "cmdport"       Unix-domain socket under /tmp
//! ```
//!
//! The last colon splits host from port. Parsing ([`parse_port_name`]) is
//! pure; [`EndpointSpec::resolve`] does the host lookup.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use crate::constants::LOCAL_SOCKET_ROOT;
use crate::env::AddressFamily;
use crate::error::{CommandPortError, Result};

/// Host half of a network port name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// Colon at position 0: listen on every interface.
    Any,
    /// Host name or address literal, as written before the colon.
    Named(String),
}

/// Parsed, not yet resolved, form of a port name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSpec {
    /// TCP endpoint.
    Network {
        /// Host to bind.
        host: Host,
        /// Port number, always within 1-65535.
        port: u16,
    },
    /// Unix-domain socket path.
    Local(PathBuf),
}

/// Bindable endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP socket address.
    Tcp(SocketAddr),
    /// Unix-domain socket path.
    Local(PathBuf),
}

impl Endpoint {
    /// Address family label used in logs.
    pub fn family_label(&self) -> &'static str {
        match self {
            Self::Tcp(addr) if addr.is_ipv6() => "ipv6",
            Self::Tcp(_) => "ipv4",
            Self::Local(_) => "local",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Remove the brackets of an IPv6 literal: `[2001:db8::1]:443` → `2001:db8::1:443`.
fn normalize_brackets(name: &str) -> String {
    if name.starts_with('[') && name.rfind(']').is_some_and(|ix| ix > 0) {
        name[1..].replace(']', "")
    } else {
        name.to_string()
    }
}

/// Parse a port name into its endpoint form without touching the network.
///
/// # Errors
///
/// `InvalidName` for an empty name, a trailing colon or a non-numeric port;
/// `InvalidPort` for a number outside 1-65535.
pub fn parse_port_name(name: &str) -> Result<EndpointSpec> {
    let normal = normalize_brackets(name);
    if normal.is_empty() {
        return Err(CommandPortError::InvalidName(name.to_string()));
    }

    let Some(colon) = normal.rfind(':') else {
        return Ok(EndpointSpec::Local(local_socket_path(&normal)));
    };
    if colon == normal.len() - 1 {
        return Err(CommandPortError::InvalidName(name.to_string()));
    }

    let port = parse_port_number(name, &normal[colon + 1..])?;
    let host = if colon == 0 {
        Host::Any
    } else {
        Host::Named(normal[..colon].to_string())
    };
    Ok(EndpointSpec::Network { host, port })
}

fn parse_port_number(name: &str, text: &str) -> Result<u16> {
    let text = text.trim();
    match text.parse::<i64>() {
        Ok(n) => u16::try_from(n)
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| CommandPortError::InvalidPort(name.to_string())),
        // All digits but too long for i64 is still a number, just out of range
        Err(_) if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) => {
            Err(CommandPortError::InvalidPort(name.to_string()))
        }
        Err(_) => Err(CommandPortError::InvalidName(name.to_string())),
    }
}

/// Unix-domain path for a name without a colon.
pub fn local_socket_path(name: &str) -> PathBuf {
    if name.starts_with('/') {
        PathBuf::from(name)
    } else {
        Path::new(LOCAL_SOCKET_ROOT).join(name)
    }
}

impl EndpointSpec {
    /// Resolve to a bindable endpoint.
    ///
    /// Named hosts are looked up in `family` first and in the other family
    /// if that yields no address.
    ///
    /// # Errors
    ///
    /// `InvalidName` (carrying `name`) when the host resolves in neither family.
    pub fn resolve(&self, name: &str, family: AddressFamily) -> Result<Endpoint> {
        match self {
            Self::Local(path) => Ok(Endpoint::Local(path.clone())),
            Self::Network { host: Host::Any, port } => {
                Ok(Endpoint::Tcp(SocketAddr::new(family.unspecified(), *port)))
            }
            Self::Network { host: Host::Named(host), port } => {
                let candidates: Vec<SocketAddr> = match (host.as_str(), *port).to_socket_addrs() {
                    Ok(addrs) => addrs.collect(),
                    Err(e) => {
                        log::debug!("[CommandPort] Lookup of {host:?} failed: {e}");
                        Vec::new()
                    }
                };
                candidates
                    .iter()
                    .find(|addr| family.matches(addr))
                    .or_else(|| candidates.iter().find(|addr| family.other().matches(addr)))
                    .copied()
                    .map(Endpoint::Tcp)
                    .ok_or_else(|| CommandPortError::InvalidName(name.to_string()))
            }
        }
    }
}

/// Parse and resolve `name` using the family selected by the environment.
pub fn resolve_port_name(name: &str) -> Result<Endpoint> {
    parse_port_name(name)?.resolve(name, AddressFamily::preferred())
}
