//! A [`Compressor`] implementation backed by zlib. Adapted from the
//! teacher crate's packet-level compressor to the byte-level
//! [`Compressor`] trait used by the value flags codec.

use std::io::Write;

use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};

use crate::error::Error;
use crate::flags::Compressor;

/// Values smaller than this are not worth compressing: about 5 times the
/// size of a packet header.
pub const DEFAULT_MIN_BYTES: usize = 128;

/// Compresses/decompresses values with zlib, skipping values smaller than
/// `min_bytes`.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    compression: Compression,
    min_bytes: usize,
}

impl ZlibCompressor {
    pub fn new(compression: Compression, min_bytes: usize) -> Self {
        ZlibCompressor { compression, min_bytes }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        ZlibCompressor::new(Compression::default(), DEFAULT_MIN_BYTES)
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, bytes: Vec<u8>) -> Result<(bool, Vec<u8>), Error> {
        if bytes.len() < self.min_bytes {
            return Ok((false, bytes));
        }
        let mut out = vec![];
        let mut enc = ZlibEncoder::new(&mut out, self.compression);
        enc.write_all(&bytes)?;
        enc.finish()?;
        Ok((true, out))
    }

    fn decompress(&self, bytes: Vec<u8>) -> Result<Vec<u8>, Error> {
        let mut out = vec![];
        let mut dec = ZlibDecoder::new(&mut out);
        dec.write_all(&bytes)?;
        dec.finish()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_values_at_or_above_the_threshold() {
        let compressor = ZlibCompressor::new(Compression::new(9), 1);
        let value = b"0000000000000000000000000000000000000000000000".to_vec();

        let (compressed, out) = compressor.compress(value.clone()).unwrap();
        assert!(compressed);
        assert!(out.len() < value.len());

        let decompressed = compressor.decompress(out).unwrap();
        assert_eq!(decompressed, value);
    }

    #[test]
    fn skips_values_below_the_threshold() {
        let compressor = ZlibCompressor::new(Compression::new(9), 128);
        let value = b"short".to_vec();
        let (compressed, out) = compressor.compress(value.clone()).unwrap();
        assert!(!compressed);
        assert_eq!(out, value);
    }
}
