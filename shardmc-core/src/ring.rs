//! Consistent-hash ring mapping key bytes to a registered server endpoint
//! (spec §3 "Hash ring", §4.1). Stable under membership changes and
//! balanced under replication: each server gets `replicas` virtual points
//! derived from `md5("<endpoint>:<i>")`.

use std::collections::BTreeMap;
use std::sync::Arc;

use md5::{Digest, Md5};

/// A `(host, port)` pair, identified by its `"host:port"` string form.
pub type Endpoint = Arc<str>;

pub const DEFAULT_REPLICAS: usize = 100;

fn hash_point(bytes: &[u8]) -> u128 {
    let digest = Md5::digest(bytes);
    let arr: [u8; 16] = digest.into();
    u128::from_be_bytes(arr)
}

/// The ring itself. Read-only after construction: safe for concurrent
/// readers without locks (spec §5).
#[derive(Debug, Clone)]
pub struct Ring {
    replicas: usize,
    points: BTreeMap<u128, Endpoint>,
    nodes: Vec<Endpoint>,
}

impl Ring {
    pub fn new(replicas: usize) -> Self {
        Ring {
            replicas,
            points: BTreeMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Register `endpoint`, inserting `replicas` virtual points. Idempotent:
    /// adding the same endpoint twice does not duplicate it in `all()`, and
    /// a later `add` of a colliding hash point overwrites the earlier
    /// mapping entry (spec §4.1 tie-break rule).
    pub fn add(&mut self, endpoint: impl Into<String>) {
        let endpoint: Endpoint = Arc::from(endpoint.into());
        for i in 0..self.replicas {
            let point = hash_point(format!("{}:{}", endpoint, i).as_bytes());
            self.points.insert(point, endpoint.clone());
        }
        if !self.nodes.iter().any(|n| n == &endpoint) {
            self.nodes.push(endpoint);
        }
    }

    /// Map `key` to its owning endpoint: the endpoint of the least
    /// hash-point >= hash(key), wrapping around to the smallest hash-point
    /// if `key`'s hash exceeds the maximum (invariant I3).
    ///
    /// Fast path (I4): with exactly one registered server, every key maps
    /// to it without computing a hash.
    pub fn lookup(&self, key: &[u8]) -> Option<Endpoint> {
        if self.nodes.len() == 1 {
            return Some(self.nodes[0].clone());
        }
        if self.points.is_empty() {
            return None;
        }
        let target = hash_point(key);
        match self.points.range(target..).next() {
            Some((_, endpoint)) => Some(endpoint.clone()),
            None => self.points.values().next().cloned(),
        }
    }

    /// All distinct registered endpoints, in registration order.
    pub fn all(&self) -> &[Endpoint] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
