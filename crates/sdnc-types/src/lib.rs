//! Network primitives shared by the SDN controller core.
//!
//! - [`MacAddress`]: 48-bit Ethernet link addresses
//! - [`IpAddress`]: IPv4 and IPv6 addresses
//! - [`IpPrefix`]: canonical CIDR networks with containment and overlap tests

mod ip;
mod mac;

pub use ip::{IpAddress, IpPrefix, Ipv4Address, Ipv6Address};
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),
}
