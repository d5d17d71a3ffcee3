//! The transport abstraction a runtime-specific crate (e.g. `shardmc-tokio`)
//! implements so the rest of this crate stays runtime-agnostic.

use async_trait::async_trait;

use crate::error::Error;

/// A single connection to one memcached server. Implementations connect
/// over TCP with `TCP_NODELAY` set (spec §3 "Connection pool").
#[async_trait]
pub trait Connection: Send + Sized + 'static {
    async fn connect(endpoint: &str) -> Result<Self, Error>;

    /// Read into `buf`, returning the number of bytes read. Returning `0`
    /// before `buf` is filled signals a closed connection to callers.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Read exactly `buf.len()` bytes, surfacing [`Error::ConnectionClosed`]
    /// on a short read (spec §4.3 "short reads must be detected and
    /// surfaced as a connection-closed error").
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            filled += n;
        }
        Ok(())
    }
}
