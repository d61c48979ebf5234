use std::net::{Ipv4Addr, Ipv6Addr};

use crate::address::{Address, NetLocation};
use crate::uuid_util::uuid_matches;

use super::{COMMAND_TCP, COMMAND_UDP};

// version + uuid + addon length + command + port + address type + the
// shortest possible address (one-byte domain with its length prefix).
const MIN_HEADER_LEN: usize = 24;

const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessRequest {
    pub version: u8,
    pub command: Command,
    pub destination: NetLocation,
    /// Offset of the first byte after the address: everything from here on
    /// is client payload and belongs to the upstream write side.
    pub payload_offset: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HeaderError {
    InvalidUser,
    UnsupportedCommand(u8),
    InvalidAddressType(u8),
    EmptyAddress,
    InvalidAddressEncoding,
    UdpNotPermitted(u16),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::InvalidUser => write!(f, "unknown user id"),
            HeaderError::UnsupportedCommand(c) => write!(f, "unsupported command: {c}"),
            HeaderError::InvalidAddressType(t) => write!(f, "invalid address type: {t}"),
            HeaderError::EmptyAddress => write!(f, "empty destination address"),
            HeaderError::InvalidAddressEncoding => write!(f, "destination address is not utf8"),
            HeaderError::UdpNotPermitted(port) => {
                write!(f, "udp only permitted to port 53, requested {port}")
            }
        }
    }
}

/// Re-entrant parser for the VLESS request header. The caller accumulates
/// inbound bytes into one buffer and re-invokes `parse` as it grows;
/// `Ok(None)` means the header is not complete yet. The client UUID is
/// checked as soon as it is fully buffered, before the rest of the header
/// arrives, so an unauthenticated peer learns nothing past that point.
///
/// No byte of the buffer is retained; the request is returned by value.
pub struct HeaderParser {
    user_uuid: [u8; 16],
    auth_ok: bool,
}

impl HeaderParser {
    pub fn new(user_uuid: [u8; 16]) -> Self {
        Self {
            user_uuid,
            auth_ok: false,
        }
    }

    pub fn parse(&mut self, buf: &[u8]) -> Result<Option<VlessRequest>, HeaderError> {
        if !self.auth_ok {
            if buf.len() < 17 {
                return Ok(None);
            }
            if !uuid_matches(&self.user_uuid, &buf[1..17]) {
                return Err(HeaderError::InvalidUser);
            }
            self.auth_ok = true;
        }

        if buf.len() < MIN_HEADER_LEN {
            return Ok(None);
        }

        let version = buf[0];
        let addon_len = buf[17] as usize;

        // addons are skipped, not interpreted
        let mut offset = 18 + addon_len;
        if buf.len() < offset + 4 {
            return Ok(None);
        }

        let command_byte = buf[offset];
        let command = match command_byte {
            COMMAND_TCP => Command::Tcp,
            COMMAND_UDP => Command::Udp,
            other => return Err(HeaderError::UnsupportedCommand(other)),
        };
        offset += 1;

        let port = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        offset += 2;

        let address_type = buf[offset];
        offset += 1;

        let address = match address_type {
            1 => {
                if buf.len() < offset + 4 {
                    return Ok(None);
                }
                let addr = Ipv4Addr::new(
                    buf[offset],
                    buf[offset + 1],
                    buf[offset + 2],
                    buf[offset + 3],
                );
                offset += 4;
                Address::Ipv4(addr)
            }
            2 => {
                let domain_len = buf[offset] as usize;
                if domain_len == 0 {
                    return Err(HeaderError::EmptyAddress);
                }
                offset += 1;
                if buf.len() < offset + domain_len {
                    return Ok(None);
                }
                let domain = std::str::from_utf8(&buf[offset..offset + domain_len])
                    .map_err(|_| HeaderError::InvalidAddressEncoding)?;
                offset += domain_len;
                Address::Hostname(domain.to_string())
            }
            3 => {
                if buf.len() < offset + 16 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[offset..offset + 16]);
                offset += 16;
                Address::Ipv6(Ipv6Addr::from(octets))
            }
            invalid_type => return Err(HeaderError::InvalidAddressType(invalid_type)),
        };

        if command == Command::Udp && port != DNS_PORT {
            return Err(HeaderError::UdpNotPermitted(port));
        }

        Ok(Some(VlessRequest {
            version,
            command,
            destination: NetLocation::new(address, port),
            payload_offset: offset,
        }))
    }
}
