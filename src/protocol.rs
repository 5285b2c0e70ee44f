//! Handshake wire format.
//!
//! The first binary frame of every session carries a fixed header followed by
//! a variable-length destination address and, optionally, the first bytes of
//! payload for the destination:
//!
//! ```text
//! +-----+------------+-----+------+------+----------+---------+
//! | VER | CREDENTIAL | CMD | PORT | ATYP |   ADDR   | PAYLOAD |
//! +-----+------------+-----+------+------+----------+---------+
//! |  1  |     16     |  1  |  2   |  1   | Variable |  rest   |
//! +-----+------------+-----+------+------+----------+---------+
//! ```
//!
//! All multi-byte integers are big-endian. Decoding never reads past the end
//! of the frame; a short frame is reported as [`DecodeError::Truncated`].

use bytes::Bytes;
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};
use thiserror::Error;

pub const VERSION: u8 = 0;
pub const CREDENTIAL_LEN: usize = 16;

pub const CMD_CONNECT: u8 = 1;
pub const CMD_UDP_ASSOCIATE: u8 = 2;

pub const ADDR_TYPE_IPV4: u8 = 1;
pub const ADDR_TYPE_DOMAIN: u8 = 2;
pub const ADDR_TYPE_IPV6: u8 = 3;

/// Size of the acknowledgement frame sent back after a successful connect.
pub const RESPONSE_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    #[error("unknown address type: {0}")]
    UnknownAddressType(u8),

    #[error("empty domain name")]
    EmptyDomain,

    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("domain name must be 1 to 255 bytes, got {0}")]
    DomainLength(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

impl Command {
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            CMD_CONNECT => Some(Self::Connect),
            CMD_UDP_ASSOCIATE => Some(Self::UdpAssociate),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Connect => CMD_CONNECT,
            Self::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::UdpAssociate => f.write_str("udp-associate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4,
    Domain,
    Ipv6,
}

/// Destination address as carried in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl Address {
    #[must_use]
    pub const fn address_type(&self) -> AddressType {
        match self {
            Self::Ipv4(_) => AddressType::Ipv4,
            Self::Domain(_) => AddressType::Domain,
            Self::Ipv6(_) => AddressType::Ipv6,
        }
    }

    /// Appends the ATYP byte and the address field to `buf`.
    ///
    /// A domain must fit the one-byte length prefix and be non-empty, the
    /// same bounds `decode` enforces. `buf` is untouched on error.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        match self {
            Self::Ipv4(ip) => {
                buf.push(ADDR_TYPE_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Self::Domain(domain) => {
                let len = u8::try_from(domain.len())
                    .ok()
                    .filter(|&len| len > 0)
                    .ok_or(EncodeError::DomainLength(domain.len()))?;
                buf.push(ADDR_TYPE_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(domain.as_bytes());
            }
            Self::Ipv6(ip) => {
                buf.push(ADDR_TYPE_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(ip) => write!(f, "{ip}"),
            Self::Domain(domain) => f.write_str(domain),
            // Eight full groups, no `::` compression.
            Self::Ipv6(ip) => {
                let groups: Vec<String> = ip.segments().iter().map(|g| format!("{g:x}")).collect();
                f.write_str(&groups.join(":"))
            }
        }
    }
}

/// A decoded handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: u8,
    pub credential: [u8; CREDENTIAL_LEN],
    pub command: Command,
    pub port: u16,
    pub address: Address,
    /// Bytes following the header in the first frame. They belong to the
    /// destination and must be its first write.
    pub payload: Bytes,
}

impl HandshakeRequest {
    /// Serializes the request the way a client puts it on the wire.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::with_capacity(22 + CREDENTIAL_LEN + self.payload.len());
        buf.push(self.version);
        buf.extend_from_slice(&self.credential);
        buf.push(self.command.as_byte());
        buf.extend_from_slice(&self.port.to_be_bytes());
        self.address.encode_into(&mut buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Bounds-checked cursor over the first frame.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if len > remaining {
            return Err(DecodeError::Truncated {
                field,
                needed: len,
                remaining,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16_be(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    const fn position(&self) -> usize {
        self.pos
    }
}

/// Decodes the first inbound frame into a [`HandshakeRequest`].
pub fn decode(frame: Bytes) -> Result<HandshakeRequest, DecodeError> {
    let mut reader = FieldReader::new(&frame);

    let version = reader.u8("version")?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let credential = reader.array::<CREDENTIAL_LEN>("credential")?;

    let cmd_byte = reader.u8("command")?;
    let command = Command::from_byte(cmd_byte).ok_or(DecodeError::UnknownCommand(cmd_byte))?;

    let port = reader.u16_be("port")?;
    let address = decode_address(&mut reader)?;

    let header_len = reader.position();
    let payload = frame.slice(header_len..);

    Ok(HandshakeRequest {
        version,
        credential,
        command,
        port,
        address,
        payload,
    })
}

fn decode_address(reader: &mut FieldReader<'_>) -> Result<Address, DecodeError> {
    match reader.u8("address type")? {
        ADDR_TYPE_IPV4 => Ok(Address::Ipv4(Ipv4Addr::from(
            reader.array::<4>("ipv4 address")?,
        ))),
        ADDR_TYPE_DOMAIN => {
            let len = usize::from(reader.u8("domain length")?);
            if len == 0 {
                return Err(DecodeError::EmptyDomain);
            }
            let raw = reader.take(len, "domain")?;
            let domain = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidDomain)?;
            Ok(Address::Domain(domain.to_string()))
        }
        ADDR_TYPE_IPV6 => Ok(Address::Ipv6(Ipv6Addr::from(
            reader.array::<16>("ipv6 address")?,
        ))),
        other => Err(DecodeError::UnknownAddressType(other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Head = 0,
    Ok = 1,
}

/// The fixed-size acknowledgement sent before any relayed data.
///
/// ```text
/// | VER | STATUS | RSV (12) | TIMESTAMP (4, BE seconds) | RSV (2) |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: ResponseStatus,
    pub timestamp: u32,
}

impl HandshakeResponse {
    /// Acknowledgement for a TCP connect, stamped with the current time.
    #[must_use]
    pub fn connected() -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs() as u32);
        Self {
            status: ResponseStatus::Head,
            timestamp,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let mut out = [0u8; RESPONSE_LEN];
        out[0] = VERSION;
        out[1] = self.status as u8;
        out[14..18].copy_from_slice(&self.timestamp.to_be_bytes());
        out
    }
}
