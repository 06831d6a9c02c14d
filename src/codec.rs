//! Block record framing: compression and checksum around a packed payload
//!
//! On disk a record is `frame(1B) | crc32(4B LE, when enabled) | body` where
//! the frame byte packs `(compression << 4) | checksum` and the checksum
//! covers the compressed body. The body is written last so deserialization
//! never needs a length prefix.

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};

/// Compression applied to a block payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Snappy = 1,
}

impl Compression {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Snappy),
            _ => None,
        }
    }
}

/// Checksum guarding a block payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Checksum {
    None = 0,
    Crc32 = 1,
}

impl Checksum {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Checksum::None),
            1 => Some(Checksum::Crc32),
            _ => None,
        }
    }
}

fn encode_frame(compression: Compression, checksum: Checksum) -> u8 {
    ((compression as u8 & 0x0f) << 4) | (checksum as u8 & 0x0f)
}

fn decode_frame(frame: u8) -> Result<(Compression, Checksum)> {
    let compression = Compression::from_u8(frame >> 4).ok_or_else(|| {
        VaultError::UnsupportedFormat(format!("unknown compression nibble {:#x}", frame >> 4))
    })?;
    let checksum = Checksum::from_u8(frame & 0x0f).ok_or_else(|| {
        VaultError::UnsupportedFormat(format!("unknown checksum nibble {:#x}", frame & 0x0f))
    })?;
    Ok((compression, checksum))
}

/// Serialize a payload with the requested compression and checksum framing
pub fn serialize_record(
    payload: &[u8],
    compression: Compression,
    checksum: Checksum,
) -> Result<Vec<u8>> {
    let body = match compression {
        Compression::None => payload.to_vec(),
        Compression::Snappy => snap::raw::Encoder::new().compress_vec(payload)?,
    };

    let mut record = Vec::with_capacity(1 + 4 + body.len());
    record.push(encode_frame(compression, checksum));
    match checksum {
        Checksum::None => {}
        Checksum::Crc32 => record.extend_from_slice(&crc32fast::hash(&body).to_le_bytes()),
    }
    record.extend_from_slice(&body);
    Ok(record)
}

/// Deserialize a record, verifying its checksum.
///
/// When `uncompress` is false the returned payload is left in its stored
/// compression and the caller inspects the returned [`Compression`].
pub fn deserialize_record(record: &[u8], uncompress: bool) -> Result<(Vec<u8>, Compression)> {
    if record.is_empty() {
        return Err(VaultError::Corrupt("empty block record".to_string()));
    }
    let (compression, checksum) = decode_frame(record[0])?;

    let mut body_start = 1;
    let stored_crc = match checksum {
        Checksum::None => None,
        Checksum::Crc32 => {
            if record.len() < 5 {
                return Err(VaultError::Corrupt(
                    "record truncated before checksum".to_string(),
                ));
            }
            body_start = 5;
            Some(u32::from_le_bytes(record[1..5].try_into().unwrap()))
        }
    };

    let body = &record[body_start..];
    if let Some(expected) = stored_crc {
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(VaultError::Corrupt(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                expected, actual
            )));
        }
    }

    if !uncompress {
        return Ok((body.to_vec(), compression));
    }
    let payload = match compression {
        Compression::None => body.to_vec(),
        Compression::Snappy => snap::raw::Decoder::new().decompress_vec(body)?,
    };
    Ok((payload, compression))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Vec<u8> {
        (0..4096u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_all_framings() {
        let payload = sample_payload();
        for compression in [Compression::None, Compression::Snappy] {
            for checksum in [Checksum::None, Checksum::Crc32] {
                let record = serialize_record(&payload, compression, checksum).unwrap();
                let (out, used) = deserialize_record(&record, true).unwrap();
                assert_eq!(out, payload);
                assert_eq!(used, compression);
            }
        }
    }

    #[test]
    fn test_frame_layout() {
        let record = serialize_record(b"abc", Compression::None, Checksum::Crc32).unwrap();
        assert_eq!(record[0], 0x01);
        assert_eq!(&record[5..], b"abc");
        assert_eq!(
            u32::from_le_bytes(record[1..5].try_into().unwrap()),
            crc32fast::hash(b"abc")
        );

        let record = serialize_record(b"abc", Compression::Snappy, Checksum::None).unwrap();
        assert_eq!(record[0], 0x10);
    }

    #[test]
    fn test_corruption_detected() {
        let mut record =
            serialize_record(&sample_payload(), Compression::Snappy, Checksum::Crc32).unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xff;
        assert!(matches!(
            deserialize_record(&record, true),
            Err(VaultError::Corrupt(_))
        ));
    }

    #[test]
    fn test_unknown_frame_rejected() {
        let record = [0xf0u8, 1, 2, 3];
        assert!(matches!(
            deserialize_record(&record, true),
            Err(VaultError::UnsupportedFormat(_))
        ));
        let record = [0x0fu8, 1, 2, 3];
        assert!(matches!(
            deserialize_record(&record, true),
            Err(VaultError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_skip_uncompress_keeps_body() {
        let payload = vec![7u8; 1024];
        let record = serialize_record(&payload, Compression::Snappy, Checksum::Crc32).unwrap();
        let (body, compression) = deserialize_record(&record, false).unwrap();
        assert_eq!(compression, Compression::Snappy);
        assert!(body.len() < payload.len());
        let round =
            snap::raw::Decoder::new().decompress_vec(&body).unwrap();
        assert_eq!(round, payload);
    }

    #[test]
    fn test_truncated_record() {
        assert!(matches!(
            deserialize_record(&[], true),
            Err(VaultError::Corrupt(_))
        ));
        assert!(matches!(
            deserialize_record(&[0x01, 0xaa], true),
            Err(VaultError::Corrupt(_))
        ));
    }
}
