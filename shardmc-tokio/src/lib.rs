//! Tokio transport for `shardmc-core`: a TCP [`Connection`] with
//! `TCP_NODELAY` set (spec §3 "Connection pool").

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use shardmc_core::connection::Connection;
use shardmc_core::error::Error;

pub use shardmc_core::{
    client::{Client, ClientConfig},
    error::{ProtocolError, Status},
    flags::{Compressor, LoadValue, NoCompressor, Pickled, StoreValue},
    ring::Endpoint,
};
#[cfg(feature = "zlib")]
pub use shardmc_core::zlib::ZlibCompressor;

/// A sharded memcached client bound to the Tokio runtime.
pub type TokioClient = Client<TokioConnection>;

/// A single TCP connection to one memcached server, driven by Tokio.
pub struct TokioConnection {
    stream: TcpStream,
}

#[async_trait]
impl Connection for TokioConnection {
    async fn connect(endpoint: &str) -> Result<Self, Error> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(TokioConnection { stream })
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.stream.read(buf).await?)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        Ok(self.stream.write_all(buf).await?)
    }
}
