use std::io::{self, Read, Write};

use flate2::read::{GzDecoder, GzEncoder};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::config::CompressionAlgorithm;

/// How much plaintext to feed the LZ4 frame encoder per refill.
const LZ4_READ_CHUNK: usize = 64 * 1024;

/// Wrap `inner` in a lazily compressing reader.
pub fn deflate_stream(
    algorithm: CompressionAlgorithm,
    inner: Box<dyn Read + Send>,
) -> Box<dyn Read + Send> {
    match algorithm {
        CompressionAlgorithm::Gzip => {
            Box::new(GzEncoder::new(inner, flate2::Compression::default()))
        }
        CompressionAlgorithm::Lz4 => Box::new(Lz4EncodeReader::new(inner)),
    }
}

/// Wrap `inner` in a lazily decompressing reader.
pub fn inflate_stream(
    algorithm: CompressionAlgorithm,
    inner: Box<dyn Read + Send>,
) -> Box<dyn Read + Send> {
    match algorithm {
        CompressionAlgorithm::Gzip => Box::new(GzDecoder::new(inner)),
        CompressionAlgorithm::Lz4 => Box::new(FrameDecoder::new(inner)),
    }
}

/// Read adapter driving a write-based LZ4 frame encoder.
///
/// `lz4_flex` only ships a `Write`-side encoder, so compressed output is
/// staged in the encoder's backing buffer and drained on demand.
struct Lz4EncodeReader<R> {
    inner: R,
    encoder: Option<FrameEncoder<Vec<u8>>>,
    out: Vec<u8>,
    pos: usize,
}

impl<R: Read> Lz4EncodeReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            encoder: Some(FrameEncoder::new(Vec::new())),
            out: Vec::new(),
            pos: 0,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(()); // finished
        };

        let mut plain = [0u8; LZ4_READ_CHUNK];
        loop {
            match self.inner.read(&mut plain) {
                Ok(0) => {
                    let encoder = self.encoder.take().expect("encoder present");
                    self.out = encoder
                        .finish()
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                    self.pos = 0;
                    return Ok(());
                }
                Ok(n) => {
                    encoder.write_all(&plain[..n])?;
                    let staged = encoder.get_mut();
                    if !staged.is_empty() {
                        self.out = std::mem::take(staged);
                        self.pos = 0;
                        return Ok(());
                    }
                    // Encoder is still buffering a block; keep feeding it.
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Read for Lz4EncodeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.out.len() {
            if self.encoder.is_none() {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = std::cmp::min(buf.len(), self.out.len() - self.pos);
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
