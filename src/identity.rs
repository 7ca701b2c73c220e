//! Relay identity: the node's own overlay address.
//!
//! A relay is identified by a 4-octet IP-like quad plus a UDP port. The quad
//! is the "stamp" written into outgoing packets' path records and the value
//! compared against recorded path entries during duplicate detection; the
//! port is the local broadcast port. The identity is immutable after startup.
//!
//! The startup parameter is a fixed-width string `XXX.XXX.XXX.XXX:YYYYY`:
//! a 15-character zero-padded dotted quad, a colon, and a 5-character
//! zero-padded port. Anything else is a fatal startup error.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Default TCP/UDP port when a peer address omits one.
pub const DEFAULT_PORT: u16 = 24779;

/// Width of the zero-padded dotted quad in the startup string.
pub const IP_STR_LEN: usize = 15;

/// Width of the zero-padded port in the startup string.
pub const PORT_STR_LEN: usize = 5;

/// Total width of the startup string: quad + ':' + port.
pub const ADDR_STR_LEN: usize = IP_STR_LEN + 1 + PORT_STR_LEN;

/// Errors from parsing the startup identity string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The string is not exactly [`ADDR_STR_LEN`] characters.
    BadLength { found: usize },
    /// A separator was not where the fixed layout requires it.
    BadSeparator { index: usize },
    /// An octet field was not a number in `0..=255`.
    BadOctet { field: String },
    /// The port field was not a number in `0..=65535`.
    BadPort { field: String },
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::BadLength { found } => write!(
                f,
                "identity must be {} characters (XXX.XXX.XXX.XXX:YYYYY), got {}",
                ADDR_STR_LEN, found
            ),
            AddressError::BadSeparator { index } => {
                write!(f, "expected separator at position {}", index)
            }
            AddressError::BadOctet { field } => {
                write!(f, "invalid address octet {:?}", field)
            }
            AddressError::BadPort { field } => {
                write!(f, "invalid port {:?}", field)
            }
        }
    }
}

impl std::error::Error for AddressError {}

/// The relay's own overlay address: quad + local broadcast port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayIdentity {
    quad: [u8; 4],
    port: u16,
}

impl RelayIdentity {
    pub fn new(quad: [u8; 4], port: u16) -> Self {
        Self { quad, port }
    }

    /// The 4-byte path identifier stamped into packets.
    pub fn quad(&self) -> [u8; 4] {
        self.quad
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The quad as an IPv4 address (the local broadcast/multicast group).
    pub fn group_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.quad)
    }

    /// The dotted-quad identity string sent in the peer handshake.
    pub fn quad_string(&self) -> String {
        self.group_addr().to_string()
    }

    /// Parse the fixed-width startup string `XXX.XXX.XXX.XXX:YYYYY`.
    ///
    /// Each octet field is exactly three zero-padded digits parsed as an
    /// unsigned byte; the port is five zero-padded digits.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let bytes = s.as_bytes();
        if bytes.len() != ADDR_STR_LEN {
            return Err(AddressError::BadLength { found: bytes.len() });
        }
        for &index in &[3, 7, 11] {
            if bytes[index] != b'.' {
                return Err(AddressError::BadSeparator { index });
            }
        }
        if bytes[IP_STR_LEN] != b':' {
            return Err(AddressError::BadSeparator { index: IP_STR_LEN });
        }

        let mut quad = [0u8; 4];
        for (i, octet) in quad.iter_mut().enumerate() {
            let field = &s[i * 4..i * 4 + 3];
            *octet = parse_padded(field)
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| AddressError::BadOctet {
                    field: field.to_string(),
                })?;
        }

        let port_field = &s[IP_STR_LEN + 1..];
        let port = parse_padded(port_field)
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| AddressError::BadPort {
                field: port_field.to_string(),
            })?;

        Ok(Self { quad, port })
    }
}

/// Parse a zero-padded all-digit field.
fn parse_padded(field: &str) -> Option<u32> {
    if !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

impl FromStr for RelayIdentity {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, AddressError> {
        Self::parse(s)
    }
}

impl fmt::Display for RelayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_addr(), self.port)
    }
}
