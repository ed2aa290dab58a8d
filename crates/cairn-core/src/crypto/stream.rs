use std::io::{self, Read};
use std::sync::Arc;

use super::CipherEngine;

/// Plaintext bytes sealed per frame.
const FRAME_SIZE: usize = 64 * 1024;

/// High bit of the length prefix marks the final frame of a stream.
const FINAL_FLAG: u32 = 1 << 31;

/// Stream layout: a sequence of `[u32 LE sealed_len][sealed_frame]` records.
/// Each frame is an independent AEAD seal whose AAD binds the frame counter
/// and the final-frame flag, so frames cannot be reordered, duplicated, or
/// dropped, and a stream truncated at a record boundary is still detected.
fn frame_aad(counter: u64, is_final: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&counter.to_le_bytes());
    aad[8] = is_final as u8;
    aad
}

/// Lazily encrypts an inner reader, frame by frame.
pub struct EncryptReader<R> {
    inner: R,
    engine: Arc<dyn CipherEngine>,
    counter: u64,
    out: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> EncryptReader<R> {
    pub fn new(inner: R, engine: Arc<dyn CipherEngine>) -> Self {
        Self {
            inner,
            engine,
            counter: 0,
            out: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut plain = vec![0u8; FRAME_SIZE];
        let mut filled = 0;
        let mut eof = false;
        while filled < plain.len() {
            match self.inner.read(&mut plain[filled..]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        plain.truncate(filled);

        let is_final = eof;
        let sealed = self
            .engine
            .seal(&plain, &frame_aad(self.counter, is_final))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.counter += 1;

        let mut len = sealed.len() as u32;
        if is_final {
            len |= FINAL_FLAG;
            self.done = true;
        }
        self.out.clear();
        self.out.extend_from_slice(&len.to_le_bytes());
        self.out.extend_from_slice(&sealed);
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for EncryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.out.len() {
            if self.done {
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

/// Lazily decrypts a stream produced by `EncryptReader`.
pub struct DecryptReader<R> {
    inner: R,
    engine: Arc<dyn CipherEngine>,
    counter: u64,
    out: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(inner: R, engine: Arc<dyn CipherEngine>) -> Self {
        Self {
            inner,
            engine,
            counter: 0,
            out: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut len_bytes = [0u8; 4];
        self.inner.read_exact(&mut len_bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::InvalidData, "cipher stream truncated")
            } else {
                e
            }
        })?;
        let raw_len = u32::from_le_bytes(len_bytes);
        let is_final = raw_len & FINAL_FLAG != 0;
        let sealed_len = (raw_len & !FINAL_FLAG) as usize;

        let mut sealed = vec![0u8; sealed_len];
        self.inner.read_exact(&mut sealed)?;

        let plain = self
            .engine
            .open(&sealed, &frame_aad(self.counter, is_final))
            .map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "cipher frame authentication failed")
            })?;
        self.counter += 1;
        if is_final {
            self.finished = true;
        }

        self.out = plain;
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.out.len() {
            if self.finished {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionAlgorithm;
    use crate::crypto::engine_for;
    use std::io::Cursor;

    fn engine() -> Arc<dyn CipherEngine> {
        Arc::from(engine_for(EncryptionAlgorithm::Aes256GcmSiv, &[7u8; 32]))
    }

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let engine = engine();
        let mut enc = EncryptReader::new(Cursor::new(data.to_vec()), Arc::clone(&engine));
        let mut sealed = Vec::new();
        enc.read_to_end(&mut sealed).unwrap();
        assert_ne!(sealed, data);

        let mut dec = DecryptReader::new(Cursor::new(sealed), engine);
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn roundtrip_empty() {
        assert_eq!(roundtrip(b""), b"");
    }

    #[test]
    fn roundtrip_small() {
        assert_eq!(roundtrip(b"hello world"), b"hello world");
    }

    #[test]
    fn roundtrip_multi_frame() {
        let data: Vec<u8> = (0..FRAME_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn roundtrip_exact_frame_boundary() {
        let data = vec![0xEE; FRAME_SIZE * 2];
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn wrong_key_fails() {
        let mut enc = EncryptReader::new(Cursor::new(b"secret".to_vec()), engine());
        let mut sealed = Vec::new();
        enc.read_to_end(&mut sealed).unwrap();

        let other: Arc<dyn CipherEngine> =
            Arc::from(engine_for(EncryptionAlgorithm::Aes256GcmSiv, &[8u8; 32]));
        let mut dec = DecryptReader::new(Cursor::new(sealed), other);
        let mut out = Vec::new();
        assert!(dec.read_to_end(&mut out).is_err());
    }

    #[test]
    fn truncated_stream_fails() {
        let mut enc = EncryptReader::new(Cursor::new(vec![1u8; 1000]), engine());
        let mut sealed = Vec::new();
        enc.read_to_end(&mut sealed).unwrap();
        sealed.truncate(sealed.len() / 2);

        let mut dec = DecryptReader::new(Cursor::new(sealed), engine());
        let mut out = Vec::new();
        assert!(dec.read_to_end(&mut out).is_err());
    }

    #[test]
    fn bitflip_fails() {
        let mut enc = EncryptReader::new(Cursor::new(vec![2u8; 100]), engine());
        let mut sealed = Vec::new();
        enc.read_to_end(&mut sealed).unwrap();
        sealed[10] ^= 0x01;

        let mut dec = DecryptReader::new(Cursor::new(sealed), engine());
        let mut out = Vec::new();
        assert!(dec.read_to_end(&mut out).is_err());
    }
}
