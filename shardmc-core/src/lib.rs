//! Runtime-agnostic core of a consistent-hash sharding memcached client:
//! the hash ring, the binary wire codec, the connection pool, the value
//! flags codec, the worker pool, the multi-op pipelining primitives and
//! the [`client::Client`] facade that ties them together.
//!
//! A concrete [`connection::Connection`] implementation — `shardmc-tokio`
//! provides one over Tokio's `TcpStream` — is the only piece this crate
//! does not supply itself.

pub mod client;
pub mod connection;
pub mod error;
pub mod flags;
pub mod multi;
pub mod pool;
pub mod ring;
pub mod wire;
pub mod worker;

#[cfg(feature = "zlib")]
pub mod zlib;

/// The binary protocol's key length limit (spec §3 invariant I1): a key
/// longer than this is rejected client-side before any I/O.
pub const MAX_KEY_SIZE: usize = 250;

/// The default memcached TCP port, used when a `host_list` entry omits
/// `:port`.
pub const DEFAULT_PORT: u16 = 11211;

pub use client::{Client, ClientConfig};
pub use error::{Error, ProtocolError, Status};
pub use flags::{Compressor, LoadValue, NoCompressor, Pickled, StoreValue};
pub use ring::{Endpoint, Ring};
