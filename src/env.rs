//! Runtime environment detection.
//!
//! Provides a single source of truth for the preferred IP address family,
//! selected by the `COMMAND_PORT_IP_TYPE` environment variable.
//!
//! # Environment Variable
//!
//! Set `COMMAND_PORT_IP_TYPE` to one of:
//! - `ipv6` - Prefer IPv6 (case-insensitive)
//! - `ipv4`, anything else, or unset - Prefer IPv4 (default)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::constants::IP_TYPE_ENV;

/// IP address family used for network command ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4 (default).
    V4,
    /// IPv6, opted into via `COMMAND_PORT_IP_TYPE=ipv6`.
    V6,
}

impl AddressFamily {
    /// Detect the preferred family from `COMMAND_PORT_IP_TYPE`.
    #[must_use]
    pub fn preferred() -> Self {
        Self::from_setting(std::env::var(IP_TYPE_ENV).ok().as_deref())
    }

    /// Interpret a raw setting value; `None` means the variable is unset.
    #[must_use]
    pub fn from_setting(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("ipv6") => Self::V6,
            _ => Self::V4,
        }
    }

    /// The other family, used as a resolution fallback.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::V4 => Self::V6,
            Self::V6 => Self::V4,
        }
    }

    /// Whether `addr` belongs to this family.
    #[must_use]
    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }

    /// Unspecified ("any host") address of this family.
    #[must_use]
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Loopback address of this family.
    #[must_use]
    pub fn loopback(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}
