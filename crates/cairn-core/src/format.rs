use std::io::{self, Read};

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::{Mac, MacHasher};
use cairn_types::resource::ResourceType;

/// Magic bytes at the start of every framed object.
pub const MAGIC: &[u8; 8] = b"_PLAKAR_";
/// `MAGIC[8] || VERSION[4 LE] || RESOURCE_TYPE[4 LE]`
pub const HEADER_SIZE: usize = 16;
/// Trailing MAC over header and payload.
pub const FOOTER_SIZE: usize = 32;

fn header_bytes(resource: ResourceType, version: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..8].copy_from_slice(MAGIC);
    header[8..12].copy_from_slice(&version.to_le_bytes());
    header[12..16].copy_from_slice(&resource.as_u32().to_le_bytes());
    header
}

/// Wrap an already-encoded stream with the framing header and trailing MAC.
/// Lazy: the payload is pulled through on demand and MAC'd as it passes.
pub fn serialize(
    mac_key: &[u8],
    resource: ResourceType,
    version: u32,
    inner: Box<dyn Read + Send>,
) -> SerializeReader {
    let header = header_bytes(resource, version);
    let mut hasher = Mac::hasher(mac_key);
    hasher.update(&header);
    SerializeReader {
        inner,
        hasher: Some(hasher),
        stage: Stage::Header(header, 0),
    }
}

enum Stage {
    Header([u8; HEADER_SIZE], usize),
    Payload,
    Footer([u8; FOOTER_SIZE], usize),
    Done,
}

pub struct SerializeReader {
    inner: Box<dyn Read + Send>,
    hasher: Option<MacHasher>,
    stage: Stage,
}

impl Read for SerializeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.stage {
                Stage::Header(header, pos) => {
                    let n = std::cmp::min(buf.len(), HEADER_SIZE - *pos);
                    buf[..n].copy_from_slice(&header[*pos..*pos + n]);
                    *pos += n;
                    if *pos == HEADER_SIZE {
                        self.stage = Stage::Payload;
                    }
                    return Ok(n);
                }
                Stage::Payload => {
                    let n = self.inner.read(buf)?;
                    if n == 0 {
                        let hasher = self.hasher.take().expect("hasher consumed once");
                        let mac = hasher.finalize();
                        self.stage = Stage::Footer(mac.0, 0);
                        continue;
                    }
                    self.hasher
                        .as_mut()
                        .expect("hasher present during payload")
                        .update(&buf[..n]);
                    return Ok(n);
                }
                Stage::Footer(mac, pos) => {
                    let n = std::cmp::min(buf.len(), FOOTER_SIZE - *pos);
                    buf[..n].copy_from_slice(&mac[*pos..*pos + n]);
                    *pos += n;
                    if *pos == FOOTER_SIZE {
                        self.stage = Stage::Done;
                    }
                    return Ok(n);
                }
                Stage::Done => return Ok(0),
            }
        }
    }
}

/// Read a complete framed object, verify its MAC and resource type, and
/// return `(version, payload)`. The footer is validated before any payload
/// byte is handed to the caller.
pub fn deserialize(
    mac_key: &[u8],
    expected: ResourceType,
    mut inner: impl Read,
) -> Result<(u32, Vec<u8>)> {
    let mut data = Vec::new();
    inner.read_to_end(&mut data)?;
    let (version, payload) = deserialize_bytes(mac_key, expected, &data)?;
    Ok((version, payload.to_vec()))
}

/// Verify and unwrap a framed object held in memory.
pub fn deserialize_bytes<'a>(
    mac_key: &[u8],
    expected: ResourceType,
    data: &'a [u8],
) -> Result<(u32, &'a [u8])> {
    if data.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(CairnError::CorruptFrame("frame too short".into()));
    }
    if &data[..8] != MAGIC {
        return Err(CairnError::CorruptFrame("bad magic".into()));
    }
    let version = u32::from_le_bytes(data[8..12].try_into().expect("4 bytes"));
    let type_tag = u32::from_le_bytes(data[12..16].try_into().expect("4 bytes"));
    let resource = ResourceType::from_u32(type_tag)
        .map_err(|_| CairnError::CorruptFrame(format!("unknown resource type {type_tag}")))?;
    if resource != expected {
        return Err(CairnError::CorruptFrame(format!(
            "resource type mismatch: expected {expected}, found {resource}"
        )));
    }

    let footer_start = data.len() - FOOTER_SIZE;
    let expected_mac =
        Mac::from_bytes(&data[footer_start..]).expect("footer is exactly 32 bytes");
    let computed = Mac::compute(mac_key, &data[..footer_start]);
    if computed != expected_mac {
        return Err(CairnError::CorruptFrame("MAC mismatch".into()));
    }

    Ok((version, &data[HEADER_SIZE..footer_start]))
}

/// Strip the framing from configuration bytes without verifying the MAC.
///
/// Used only to bootstrap opening: the MAC key is derived from material
/// inside the configuration (KDF parameters or repository UUID), so the
/// config has to be parsed before it can be verified. Callers re-verify the
/// frame once the key is known.
pub fn config_from_wrapped_bytes(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(CairnError::CorruptFrame("config frame too short".into()));
    }
    if &data[..8] != MAGIC {
        return Err(CairnError::CorruptFrame("bad magic".into()));
    }
    let version = u32::from_le_bytes(data[8..12].try_into().expect("4 bytes"));
    Ok((version, &data[HEADER_SIZE..data.len() - FOOTER_SIZE]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const KEY: &[u8] = b"test mac key";

    fn frame(resource: ResourceType, payload: &[u8]) -> Vec<u8> {
        let mut reader = serialize(
            KEY,
            resource,
            1,
            Box::new(Cursor::new(payload.to_vec())),
        );
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn roundtrip() {
        let framed = frame(ResourceType::State, b"payload bytes");
        assert_eq!(framed.len(), HEADER_SIZE + 13 + FOOTER_SIZE);
        let (version, payload) =
            deserialize(KEY, ResourceType::State, Cursor::new(framed)).unwrap();
        assert_eq!(version, 1);
        assert_eq!(payload, b"payload bytes");
    }

    #[test]
    fn empty_payload_roundtrip() {
        let framed = frame(ResourceType::Config, b"");
        let (_, payload) = deserialize(KEY, ResourceType::Config, Cursor::new(framed)).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn every_single_byte_flip_is_detected() {
        let framed = frame(ResourceType::Chunk, b"sensitive");
        for i in 0..framed.len() {
            let mut mutated = framed.clone();
            mutated[i] ^= 0x01;
            let result = deserialize_bytes(KEY, ResourceType::Chunk, &mutated);
            assert!(
                matches!(result, Err(CairnError::CorruptFrame(_))),
                "flip at byte {i} went undetected"
            );
        }
    }

    #[test]
    fn resource_type_mismatch_rejected() {
        let framed = frame(ResourceType::State, b"x");
        let result = deserialize_bytes(KEY, ResourceType::Packfile, &framed);
        assert!(matches!(result, Err(CairnError::CorruptFrame(_))));
    }

    #[test]
    fn wrong_key_rejected() {
        let framed = frame(ResourceType::State, b"x");
        let result = deserialize_bytes(b"other key", ResourceType::State, &framed);
        assert!(matches!(result, Err(CairnError::CorruptFrame(_))));
    }

    #[test]
    fn truncated_frame_rejected() {
        let framed = frame(ResourceType::State, b"x");
        let result = deserialize_bytes(KEY, ResourceType::State, &framed[..HEADER_SIZE + 1]);
        assert!(matches!(result, Err(CairnError::CorruptFrame(_))));
    }

    #[test]
    fn wrapped_config_parse_skips_mac() {
        let framed = frame(ResourceType::Config, b"config body");
        let (version, payload) = config_from_wrapped_bytes(&framed).unwrap();
        assert_eq!(version, 1);
        assert_eq!(payload, b"config body");
    }

    #[test]
    fn header_size_constants_hold() {
        let framed = frame(ResourceType::Snapshot, b"abc");
        assert_eq!(&framed[..8], MAGIC);
        assert_eq!(framed.len() - 3, HEADER_SIZE + FOOTER_SIZE);
    }
}
