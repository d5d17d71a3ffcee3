//! Grouping, chunking and pipelining primitives for the multi-op engine
//! (spec §4.5, §2 component E). Orchestration — acquiring a pooled
//! connection per group and fanning chunks out across the worker pool —
//! lives on [`crate::client::Client`], which is the only thing that knows
//! about pools and the worker pool; this module only knows about the ring
//! and the wire format.

use std::collections::HashMap;

use crate::connection::Connection;
use crate::error::Error;
use crate::ring::{Endpoint, Ring};
use crate::wire::{Extras, Header, Opcode, Packet, HEADER_LEN};

/// Each per-server pipeline is split into chunks of at most this many
/// requests, bounding the unread bytes outstanding on one socket so a
/// `write` cannot block forever against an unread `read` on a half-duplex
/// kernel buffer (spec §4.5 "Chunking").
pub const CHUNK_SIZE: usize = 1000;

/// Partition `keys` by the server each resolves to. When `hashkey` is
/// given every key lands in a single group addressed by
/// `ring.lookup(hashkey)`, letting a caller force colocation.
pub fn group_by_ring<'a>(
    ring: &Ring,
    keys: &[&'a [u8]],
    hashkey: Option<&[u8]>,
) -> Result<Vec<(Endpoint, Vec<&'a [u8]>)>, Error> {
    if let Some(hashkey) = hashkey {
        let endpoint = ring.lookup(hashkey).ok_or(Error::ConnectionClosed)?;
        return Ok(vec![(endpoint, keys.to_vec())]);
    }

    let mut order: Vec<Endpoint> = Vec::new();
    let mut groups: HashMap<Endpoint, Vec<&'a [u8]>> = HashMap::new();
    for &key in keys {
        let endpoint = ring
            .lookup(key)
            .unwrap_or_else(|| unreachable!("ring is non-empty once any node is registered"));
        groups.entry(endpoint.clone()).or_insert_with(|| {
            order.push(endpoint.clone());
            Vec::new()
        });
        groups.get_mut(&endpoint).unwrap().push(key);
    }
    Ok(order
        .into_iter()
        .map(|endpoint| {
            let keys = groups.remove(&endpoint).unwrap();
            (endpoint, keys)
        })
        .collect())
}

/// Build a pipeline of requests for one per-server chunk: every request
/// but the last uses `quiet`, the last uses `loud`, guaranteeing the
/// server responds at least once (spec's "terminator").
pub fn build_pipeline(
    quiet: Opcode,
    loud: Opcode,
    items: &[(Vec<u8>, Extras, Vec<u8>)],
) -> Vec<Packet> {
    let last = items.len().saturating_sub(1);
    items
        .iter()
        .enumerate()
        .map(|(i, (key, extras, value))| {
            let opcode = if i == last { loud } else { quiet };
            Packet::request(opcode, key, extras.clone(), value, i as u32, 0)
        })
        .collect()
}

/// Write every packet of a pipeline to `conn`, in order.
pub async fn write_pipeline<C: Connection>(conn: &mut C, packets: &[Packet]) -> Result<(), Error> {
    for packet in packets {
        conn.write_all(&packet.to_bytes()).await?;
    }
    Ok(())
}

/// Read one response frame off the wire: the 24-byte header, then exactly
/// `body_len` bytes of body (spec §4.3 "read loop").
pub async fn read_frame<C: Connection>(conn: &mut C) -> Result<Packet, Error> {
    let mut header_bytes = [0u8; HEADER_LEN];
    conn.read_exact(&mut header_bytes).await?;
    let header = Header::parse_response(&header_bytes).map_err(Error::Protocol)?;
    let mut body = vec![0u8; header.body_len as usize];
    if !body.is_empty() {
        conn.read_exact(&mut body).await?;
    }
    Packet::from_response(header, &body).map_err(Error::Protocol)
}

/// Read response frames until one arrives whose opaque tag equals
/// `last_opaque` — the pipeline's terminator (spec §4.5). Requests whose
/// quiet variant succeeded never generate a response; their success is
/// inferred by the caller from their absence in the returned list.
pub async fn read_until_opaque<C: Connection>(
    conn: &mut C,
    last_opaque: u32,
) -> Result<Vec<Packet>, Error> {
    let mut responses = Vec::new();
    loop {
        let packet = read_frame(conn).await?;
        let done = packet.header.opaque == last_opaque;
        responses.push(packet);
        if done {
            break;
        }
    }
    Ok(responses)
}

/// Split `keys` into chunks of at most [`CHUNK_SIZE`] (spec §4.5
/// "implementers MAY tune [the size] but MUST chunk").
pub fn chunk_keys<'a>(keys: &[&'a [u8]], size: usize) -> Vec<Vec<&'a [u8]>> {
    if keys.is_empty() {
        return Vec::new();
    }
    keys.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(endpoints: &[&str]) -> Ring {
        let mut ring = Ring::new(10);
        for e in endpoints {
            ring.add(*e);
        }
        ring
    }

    #[test]
    fn hashkey_forces_a_single_group() {
        let ring = ring_of(&["a:1", "b:1", "c:1"]);
        let keys: Vec<&[u8]> = vec![b"x", b"y", b"z"];
        let groups = group_by_ring(&ring, &keys, Some(b"shard1")).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 3);
    }

    #[test]
    fn without_hashkey_groups_follow_ring_lookup() {
        let ring = ring_of(&["a:1", "b:1", "c:1"]);
        let keys: Vec<&[u8]> = (0..200u32).map(|_| &b"k"[..]).collect();
        // Same literal key every time resolves to one server, so every
        // key should land in exactly one group.
        let groups = group_by_ring(&ring, &keys, None).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 200);
    }

    #[test]
    fn chunking_bounds_group_size() {
        let keys: Vec<&[u8]> = (0..2500u32).map(|_| &b"k"[..]).collect();
        let chunks = chunk_keys(&keys, CHUNK_SIZE);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 500);
    }

    #[test]
    fn build_pipeline_uses_loud_only_for_the_last_request() {
        let items = vec![
            (b"a".to_vec(), Extras::None, vec![]),
            (b"b".to_vec(), Extras::None, vec![]),
            (b"c".to_vec(), Extras::None, vec![]),
        ];
        let packets = build_pipeline(Opcode::GetQ, Opcode::Get, &items);
        assert_eq!(packets[0].header.opcode, Opcode::GetQ.code());
        assert_eq!(packets[1].header.opcode, Opcode::GetQ.code());
        assert_eq!(packets[2].header.opcode, Opcode::Get.code());
        assert_eq!(packets[2].header.opaque, 2);
    }
}
