use crate::error::{ProtocolError, Status};

use super::{Header, Opcode};

/// The extras block that precedes the key in some request bodies. The
/// layout is fixed per spec §4.3; mixing the wrong one with the wrong
/// opcode would desync the body length the server expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extras {
    None,
    Store { flags: u32, expire: u32 },
    IncrDecr { delta: u64, initial: u64, expire: u32 },
    Flush { expire: u32 },
    /// Raw bytes, used when reconstructing a `Packet` from a wire response
    /// whose extras do not need further typed interpretation.
    Raw(Vec<u8>),
}

impl Extras {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Extras::None => Vec::new(),
            Extras::Store { flags, expire } => {
                let mut buf = Vec::with_capacity(8);
                buf.extend_from_slice(&flags.to_be_bytes());
                buf.extend_from_slice(&expire.to_be_bytes());
                buf
            }
            Extras::IncrDecr { delta, initial, expire } => {
                let mut buf = Vec::with_capacity(20);
                buf.extend_from_slice(&delta.to_be_bytes());
                buf.extend_from_slice(&initial.to_be_bytes());
                buf.extend_from_slice(&expire.to_be_bytes());
                buf
            }
            Extras::Flush { expire } => expire.to_be_bytes().to_vec(),
            Extras::Raw(bytes) => bytes.clone(),
        }
    }

    pub fn len(&self) -> u8 {
        match self {
            Extras::None => 0,
            Extras::Store { .. } => 8,
            Extras::IncrDecr { .. } => 20,
            Extras::Flush { .. } => 4,
            Extras::Raw(bytes) => bytes.len() as u8,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the `flags` field out of a `Store`-shaped extras block returned
    /// on a GET response.
    pub fn store_flags(bytes: &[u8]) -> u32 {
        let mut arr = [0u8; 4];
        let n = bytes.len().min(4);
        arr[..n].copy_from_slice(&bytes[..n]);
        u32::from_be_bytes(arr)
    }
}

/// A fully decoded request or response frame: header plus its three body
/// segments (`body = extras ++ key ++ value`, spec invariant I8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Packet {
    pub fn request(opcode: Opcode, key: &[u8], extras: Extras, value: &[u8], opaque: u32, cas: u64) -> Self {
        let extras_bytes = extras.to_bytes();
        let body_len = (extras_bytes.len() + key.len() + value.len()) as u32;
        let header = Header::request(
            opcode.code(),
            key.len() as u16,
            extras_bytes.len() as u8,
            body_len,
            opaque,
            cas,
        );
        Packet {
            header,
            extras: extras_bytes,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    /// Split a response body (read separately from the header by the
    /// transport layer) according to the header's declared segment
    /// lengths.
    pub fn from_response(header: Header, body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() != header.body_len as usize {
            return Err(ProtocolError::BodySizeMismatch);
        }
        let (extras, rest) = body.split_at(header.extras_len as usize);
        let (key, value) = rest.split_at(header.key_len as usize);
        Ok(Packet {
            header,
            extras: extras.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.extras.len() + self.key.len() + self.value.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        out
    }

    /// Maps the header's status field to `Ok(())`/`Err(Status)` (spec
    /// §4.3's "status codes surfaced by the client").
    pub fn error_for_status(&self) -> Result<(), Status> {
        match self.header.status {
            0 => Ok(()),
            code => Err(Status::from(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_and_unpacks_a_set_request() {
        let extras = Extras::Store { flags: 0xdeadbeef, expire: 0x1c20 };
        let packet = Packet::request(Opcode::Add, b"Hello", extras, b"World", 0, 0);
        let bytes = packet.to_bytes();
        let expect = vec![
            0x80, 0x02, 0x00, 0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
            0x00, 0x00, 0x1c, 0x20, 0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x57, 0x6f, 0x72, 0x6c, 0x64,
        ];
        assert_eq!(expect, bytes);

        let header = packet.header;
        let body = &bytes[24..];
        let roundtrip = Packet::from_response(header, body).unwrap();
        assert_eq!(packet, roundtrip);
    }

    #[test]
    fn rejects_a_body_length_mismatch() {
        let header = Header::request(0x00, 3, 0, 3, 0, 0);
        assert_eq!(
            Packet::from_response(header, b"ab"),
            Err(ProtocolError::BodySizeMismatch)
        );
    }

    #[test]
    fn store_flags_reads_the_first_four_extras_bytes() {
        let extras = Extras::Store { flags: 7, expire: 0 }.to_bytes();
        assert_eq!(Extras::store_flags(&extras), 7);
    }
}
