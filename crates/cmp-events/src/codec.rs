//! Frame codec with adaptive compression.
//!
//! Events are JSON-serialized and, above a size threshold, compressed with
//! the process-wide algorithm. The decoder never consults configuration: it
//! sniffs gzip and framed-snappy headers from the frame itself and falls
//! back to plain JSON, so producers and consumers can run with different
//! settings during a rollout.

use std::io::{Read, Write};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cmp_types::Event;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::CodecError;

/// Gzip member header.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Stream identifier embedded in the snappy frame format header.
const SNAPPY_MAGIC: &[u8] = b"sNaP";
/// The identifier chunk places the magic at offset 4.
const SNAPPY_SNIFF_WINDOW: usize = 8;

/// Process-wide compression algorithm for bus frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
        }
    }
}

impl FromStr for Compression {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            other => Err(CodecError::UnknownCompression(other.to_string())),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder/decoder for bus frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression: Compression,
    threshold: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            threshold: 1024,
        }
    }
}

impl FrameCodec {
    pub fn new(compression: Compression, threshold: usize) -> Self {
        Self {
            compression,
            threshold,
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Serialize an event, compressing payloads strictly above the
    /// threshold. If compression does not shrink the frame, the plain JSON
    /// is emitted instead.
    pub fn encode(&self, event: &Event) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(event).map_err(CodecError::Serialize)?;

        if self.compression == Compression::None || json.len() <= self.threshold {
            return Ok(json);
        }

        let compressed = match self.compression {
            Compression::Gzip => gzip_compress(&json)?,
            Compression::Snappy => snappy_compress(&json)?,
            Compression::None => unreachable!(),
        };

        if compressed.len() < json.len() {
            Ok(compressed)
        } else {
            Ok(json)
        }
    }

    /// Decode a frame, sniffing compression from its leading bytes.
    pub fn decode(&self, bytes: &[u8]) -> Result<Event, CodecError> {
        let json = if is_gzip(bytes) {
            gzip_decompress(bytes)?
        } else if is_snappy(bytes) {
            snappy_decompress(bytes)?
        } else {
            bytes.to_vec()
        };

        serde_json::from_slice(&json).map_err(CodecError::Deserialize)
    }
}

/// Whether a frame carries a compressed payload.
pub fn is_compressed(bytes: &[u8]) -> bool {
    is_gzip(bytes) || is_snappy(bytes)
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

fn is_snappy(bytes: &[u8]) -> bool {
    bytes
        .get(..SNAPPY_SNIFF_WINDOW.min(bytes.len()))
        .map(|head| {
            head.windows(SNAPPY_MAGIC.len())
                .any(|window| window == SNAPPY_MAGIC)
        })
        .unwrap_or(false)
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|source| CodecError::Compress {
            algorithm: "gzip",
            source,
        })
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|source| CodecError::Decompress {
            algorithm: "gzip",
            source,
        })?;
    Ok(out)
}

fn snappy_compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = snap::write::FrameEncoder::new(Vec::new());
    encoder
        .write_all(data)
        .map_err(|source| CodecError::Compress {
            algorithm: "snappy",
            source,
        })?;
    encoder
        .into_inner()
        .map_err(|e| CodecError::Compress {
            algorithm: "snappy",
            source: e.into_error(),
        })
}

fn snappy_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = snap::read::FrameDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|source| CodecError::Decompress {
            algorithm: "snappy",
            source,
        })?;
    Ok(out)
}

/// Codec for the SSE `data:` line.
///
/// Large payloads are gzipped and base64-encoded, and the frame grows a
/// `compressed: true` line. Browsers ignore the extra line; custom clients
/// opt in to decoding it.
#[derive(Debug, Clone)]
pub struct SseFrameCodec {
    threshold: usize,
}

impl Default for SseFrameCodec {
    fn default() -> Self {
        Self { threshold: 1024 }
    }
}

impl SseFrameCodec {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Encode a JSON payload for the `data:` line. Returns the payload and
    /// whether the `compressed: true` line must be emitted.
    pub fn encode_payload(&self, json: &str) -> Result<(String, bool), CodecError> {
        if json.len() <= self.threshold {
            return Ok((json.to_string(), false));
        }
        let compressed = gzip_compress(json.as_bytes())?;
        Ok((BASE64.encode(compressed), true))
    }

    /// Decode a `data:` payload produced by [`Self::encode_payload`].
    pub fn decode_payload(&self, payload: &str, compressed: bool) -> Result<String, CodecError> {
        if !compressed {
            return Ok(payload.to_string());
        }
        let raw = BASE64
            .decode(payload)
            .map_err(|e| CodecError::Decompress {
                algorithm: "base64",
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;
        let json = gzip_decompress(&raw)?;
        String::from_utf8(json).map_err(|e| CodecError::Decompress {
            algorithm: "gzip",
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmp_types::EventData;
    use serde_json::json;

    fn large_event() -> Event {
        // Repetitive payload well above the 1 KiB threshold; compresses hard.
        let blob = "all work and no play makes jack a dull boy ".repeat(100);
        Event::from_json("system.notification", json!({ "message": blob }))
    }

    fn small_event() -> Event {
        Event::from_json("system.alert", json!({ "message": "disk almost full" }))
    }

    #[test]
    fn test_round_trip_all_modes() {
        for compression in [Compression::None, Compression::Gzip, Compression::Snappy] {
            let codec = FrameCodec::new(compression, 1024);
            for event in [small_event(), large_event()] {
                let bytes = codec.encode(&event).unwrap();
                let decoded = codec.decode(&bytes).unwrap();
                assert_eq!(decoded, event, "round trip failed for {compression}");
            }
        }
    }

    #[test]
    fn test_gzip_magic_prefix() {
        let codec = FrameCodec::new(Compression::Gzip, 1024);
        let bytes = codec.encode(&large_event()).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert!(is_compressed(&bytes));
    }

    #[test]
    fn test_snappy_frame_header() {
        let codec = FrameCodec::new(Compression::Snappy, 1024);
        let bytes = codec.encode(&large_event()).unwrap();
        // The frame format leads with the stream identifier chunk.
        assert!(bytes[..8].windows(4).any(|w| w == b"sNaP"));
        assert!(is_compressed(&bytes));
    }

    #[test]
    fn test_small_payload_stays_plain() {
        let codec = FrameCodec::new(Compression::Gzip, 1024);
        let bytes = codec.encode(&small_event()).unwrap();
        assert!(!is_compressed(&bytes));
        assert_eq!(bytes[0], b'{');
    }

    #[test]
    fn test_payload_exactly_at_threshold_stays_plain() {
        let event = small_event();
        let json_len = serde_json::to_vec(&event).unwrap().len();
        let codec = FrameCodec::new(Compression::Gzip, json_len);
        let bytes = codec.encode(&event).unwrap();
        assert!(!is_compressed(&bytes));
    }

    #[test]
    fn test_high_entropy_payload_round_trip() {
        let noise: String = (0..4096u32)
            .map(|i| char::from_u32(33 + (i.wrapping_mul(2654435761) % 90)).unwrap())
            .collect();
        let event = Event::from_json("system.notification", json!({ "blob": noise }));
        let codec = FrameCodec::new(Compression::Gzip, 16);
        let bytes = codec.encode(&event).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_cross_mode_decode() {
        // A consumer configured for snappy still decodes gzip frames.
        let gzip = FrameCodec::new(Compression::Gzip, 64);
        let snappy = FrameCodec::new(Compression::Snappy, 64);
        let event = large_event();
        let bytes = gzip.encode(&event).unwrap();
        assert_eq!(snappy.decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let codec = FrameCodec::default();
        assert!(codec.decode(b"not json at all").is_err());
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("SNAPPY".parse::<Compression>().unwrap(), Compression::Snappy);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!("lz4".parse::<Compression>().is_err());
    }

    #[test]
    fn test_sse_payload_round_trip() {
        let codec = SseFrameCodec::new(64);
        let small = json!({"a": 1}).to_string();
        let (payload, compressed) = codec.encode_payload(&small).unwrap();
        assert!(!compressed);
        assert_eq!(payload, small);

        let big = serde_json::to_string(&json!({"blob": "x".repeat(500)})).unwrap();
        let (payload, compressed) = codec.encode_payload(&big).unwrap();
        assert!(compressed);
        assert_ne!(payload, big);
        assert_eq!(codec.decode_payload(&payload, true).unwrap(), big);
    }

    #[test]
    fn test_empty_data_round_trip() {
        let event = Event::new("workspace.ws-1.deleted", EventData::new());
        let codec = FrameCodec::new(Compression::Snappy, 0);
        let decoded = codec.decode(&codec.encode(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
