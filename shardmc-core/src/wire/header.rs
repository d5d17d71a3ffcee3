use std::convert::TryInto;

use crate::error::ProtocolError;

use super::{HEADER_LEN, MAGIC_REQUEST, MAGIC_RESPONSE};

/// The fixed 24-byte header present on every request and response frame
/// (spec invariant I8: `body_len == extras_len + key_len + value_len`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub fn request(opcode: u8, key_len: u16, extras_len: u8, body_len: u32, opaque: u32, cas: u64) -> Self {
        Header {
            magic: MAGIC_REQUEST,
            opcode,
            key_len,
            extras_len,
            data_type: 0,
            status: 0,
            body_len,
            opaque,
            cas,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.magic;
        out[1] = self.opcode;
        out[2..4].copy_from_slice(&self.key_len.to_be_bytes());
        out[4] = self.extras_len;
        out[5] = self.data_type;
        out[6..8].copy_from_slice(&self.status.to_be_bytes());
        out[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        out[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        out[16..24].copy_from_slice(&self.cas.to_be_bytes());
        out
    }

    /// Parse a response header. Logs (does not fail on) a magic mismatch,
    /// per spec §4.3: "a response magic != 0x81 is a protocol violation
    /// logged at critical level; the caller may still proceed with the
    /// best-effort decode."
    pub fn parse_response(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::PacketTooSmall);
        }
        let magic = bytes[0];
        if magic != MAGIC_RESPONSE {
            log::error!(
                "magic mismatch in memcached response: expected {:#x}, got {:#x}",
                MAGIC_RESPONSE,
                magic
            );
        }
        Ok(Header {
            magic,
            opcode: bytes[1],
            key_len: u16::from_be_bytes(bytes[2..4].try_into().unwrap()),
            extras_len: bytes[4],
            data_type: bytes[5],
            status: u16::from_be_bytes(bytes[6..8].try_into().unwrap()),
            body_len: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            opaque: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            cas: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_request_header() {
        let header = Header::request(0x01, 5, 8, 18, 42, 7);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[0], MAGIC_REQUEST);
        assert_eq!(&bytes[2..4], &5u16.to_be_bytes());
        assert_eq!(&bytes[12..16], &42u32.to_be_bytes());
    }

    #[test]
    fn rejects_a_short_buffer() {
        assert_eq!(Header::parse_response(&[0; 10]), Err(ProtocolError::PacketTooSmall));
    }
}
