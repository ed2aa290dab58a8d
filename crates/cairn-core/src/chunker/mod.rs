use std::io::Read;

use fastcdc::v2020::StreamCDC;

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;

use crate::config::ChunkingConfig;

/// One content-defined chunk: its bytes and their keyed MAC.
pub struct Chunk {
    pub data: Vec<u8>,
    pub mac: Mac,
}

/// Lazy, finite, non-restartable stream of content-defined chunks.
///
/// Boundaries depend only on content, never on position in the outer
/// stream, which is what makes dedup work across files and snapshots. A
/// chunk is cut when the rolling hash finds a boundary past `min_size`, or
/// unconditionally at `max_size`.
pub struct Chunker {
    inner: StreamCDC<Box<dyn Read + Send>>,
    mac_key: Vec<u8>,
}

impl Chunker {
    pub fn new(
        reader: Box<dyn Read + Send>,
        config: &ChunkingConfig,
        mac_key: &[u8],
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: StreamCDC::new(reader, config.min_size, config.normal_size, config.max_size),
            mac_key: mac_key.to_vec(),
        })
    }
}

impl Iterator for Chunker {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(chunk) => {
                let mac = Mac::compute(&self.mac_key, &chunk.data);
                Some(Ok(Chunk {
                    data: chunk.data,
                    mac,
                }))
            }
            Err(fastcdc::v2020::Error::IoError(e)) => Some(Err(CairnError::Io(e))),
            Err(e) => Some(Err(CairnError::Other(format!("chunker: {e}")))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const KEY: &[u8] = b"chunker test key";

    fn small_config() -> ChunkingConfig {
        ChunkingConfig {
            algorithm: "fastcdc".into(),
            min_size: 256,
            normal_size: 1024,
            max_size: 4096,
        }
    }

    fn chunk_all(data: &[u8], config: &ChunkingConfig) -> Vec<Chunk> {
        Chunker::new(Box::new(Cursor::new(data.to_vec())), config, KEY)
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
    }

    fn pseudo_random(len: usize) -> Vec<u8> {
        // xorshift so the test corpus is stable across runs
        let mut state = 0x12345678u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[test]
    fn chunks_reassemble_to_input() {
        let data = pseudo_random(64 * 1024);
        let chunks = chunk_all(&data, &small_config());
        assert!(chunks.len() > 1);
        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn chunk_sizes_respect_bounds() {
        let data = pseudo_random(128 * 1024);
        let config = small_config();
        let chunks = chunk_all(&data, &config);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.data.len() <= config.max_size as usize);
            if i + 1 < chunks.len() {
                assert!(chunk.data.len() >= config.min_size as usize);
            }
        }
    }

    #[test]
    fn boundaries_are_content_defined() {
        // The same tail content shifted by a prefix must produce the same
        // trailing chunks once the cut points resynchronize.
        let tail = pseudo_random(64 * 1024);
        let mut shifted = pseudo_random(1024);
        shifted.extend_from_slice(&tail);

        let config = small_config();
        let a: Vec<Mac> = chunk_all(&tail, &config).iter().map(|c| c.mac).collect();
        let b: Vec<Mac> = chunk_all(&shifted, &config).iter().map(|c| c.mac).collect();

        let shared: Vec<&Mac> = a.iter().filter(|m| b.contains(m)).collect();
        assert!(
            shared.len() >= a.len() / 2,
            "expected most chunks shared, got {}/{}",
            shared.len(),
            a.len()
        );
    }

    #[test]
    fn identical_content_identical_macs() {
        let data = pseudo_random(32 * 1024);
        let config = small_config();
        let a: Vec<Mac> = chunk_all(&data, &config).iter().map(|c| c.mac).collect();
        let b: Vec<Mac> = chunk_all(&data, &config).iter().map(|c| c.mac).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunks = chunk_all(b"", &small_config());
        assert!(chunks.is_empty());
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = small_config();
        config.min_size = 0;
        assert!(Chunker::new(Box::new(Cursor::new(vec![])), &config, KEY).is_err());
    }
}
