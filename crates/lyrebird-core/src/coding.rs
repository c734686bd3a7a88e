//! Content-encoding codec.
//!
//! Uniform `encode`/`decode` over the six wire compression formats the
//! proxy preserves: gzip (RFC 1952), raw deflate (RFC 1951), Brotli,
//! Zstandard, classic Unix LZW (`compress`, MSB, 8-bit literals) and
//! identity. Bodies are stored decoded; playback re-encodes with the
//! recorded format so the wire stays faithful.

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use weezl::{decode::Decoder as LzwDecoder, encode::Encoder as LzwEncoder, BitOrder};

use crate::error::{Error, Result};
use crate::types::ContentEncoding;

/// Default compression level used when re-encoding for playback.
pub const DEFAULT_LEVEL: i32 = 6;

/// Compresses `data` with the given format.
///
/// Levels outside a format's valid range fall back to its default; formats
/// without levels ignore the argument.
pub fn encode(data: &[u8], encoding: ContentEncoding, level: i32) -> Result<Vec<u8>> {
    match encoding {
        ContentEncoding::Gzip => encode_gzip(data, level),
        ContentEncoding::Deflate => encode_deflate(data, level),
        ContentEncoding::Br => encode_brotli(data, level),
        ContentEncoding::Zstd => encode_zstd(data, level),
        ContentEncoding::Compress => encode_lzw(data),
        ContentEncoding::Identity => Ok(data.to_vec()),
    }
}

/// Decompresses `data` with the given format.
pub fn decode(data: &[u8], encoding: ContentEncoding) -> Result<Vec<u8>> {
    match encoding {
        ContentEncoding::Gzip => decode_gzip(data),
        ContentEncoding::Deflate => decode_deflate(data),
        ContentEncoding::Br => decode_brotli(data),
        ContentEncoding::Zstd => decode_zstd(data),
        ContentEncoding::Compress => decode_lzw(data),
        ContentEncoding::Identity => Ok(data.to_vec()),
    }
}

fn flate_level(level: i32) -> Compression {
    if (1..=9).contains(&level) {
        Compression::new(level as u32)
    } else {
        Compression::new(DEFAULT_LEVEL as u32)
    }
}

fn encode_gzip(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate_level(level));
    encoder
        .write_all(data)
        .map_err(|e| Error::encoding("gzip", e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| Error::encoding("gzip", e.to_string()))
}

fn decode_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::encoding("gzip", e.to_string()))?;
    Ok(out)
}

fn encode_deflate(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), flate_level(level));
    encoder
        .write_all(data)
        .map_err(|e| Error::encoding("deflate", e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| Error::encoding("deflate", e.to_string()))
}

fn decode_deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::encoding("deflate", e.to_string()))?;
    Ok(out)
}

fn encode_brotli(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let quality = if (0..=11).contains(&level) {
        level as u32
    } else {
        DEFAULT_LEVEL as u32
    };
    let mut out = Vec::new();
    {
        let mut writer = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
        writer
            .write_all(data)
            .map_err(|e| Error::encoding("br", e.to_string()))?;
        writer
            .flush()
            .map_err(|e| Error::encoding("br", e.to_string()))?;
    }
    Ok(out)
}

fn decode_brotli(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    brotli::Decompressor::new(data, 4096)
        .read_to_end(&mut out)
        .map_err(|e| Error::encoding("br", e.to_string()))?;
    Ok(out)
}

fn encode_zstd(data: &[u8], level: i32) -> Result<Vec<u8>> {
    // Level 0 selects zstd's own default; out-of-range levels map there too.
    let level = if (1..=21).contains(&level) { level } else { 0 };
    zstd::stream::encode_all(data, level).map_err(|e| Error::encoding("zstd", e.to_string()))
}

fn decode_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(data).map_err(|e| Error::encoding("zstd", e.to_string()))
}

fn encode_lzw(data: &[u8]) -> Result<Vec<u8>> {
    LzwEncoder::new(BitOrder::Msb, 8)
        .encode(data)
        .map_err(|e| Error::encoding("compress", e.to_string()))
}

fn decode_lzw(data: &[u8]) -> Result<Vec<u8>> {
    LzwDecoder::new(BitOrder::Msb, 8)
        .decode(data)
        .map_err(|e| Error::encoding("compress", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] =
        b"The quick brown fox jumps over the lazy dog. The quick brown fox again.";

    #[test]
    fn every_codec_round_trips() {
        for encoding in [
            ContentEncoding::Gzip,
            ContentEncoding::Deflate,
            ContentEncoding::Br,
            ContentEncoding::Zstd,
            ContentEncoding::Compress,
            ContentEncoding::Identity,
        ] {
            let encoded = encode(SAMPLE, encoding, DEFAULT_LEVEL).unwrap();
            let decoded = decode(&encoded, encoding).unwrap();
            assert_eq!(decoded, SAMPLE, "{encoding} did not round-trip");
        }
    }

    #[test]
    fn empty_input_round_trips() {
        for encoding in [
            ContentEncoding::Gzip,
            ContentEncoding::Deflate,
            ContentEncoding::Br,
            ContentEncoding::Zstd,
            ContentEncoding::Identity,
        ] {
            let encoded = encode(b"", encoding, DEFAULT_LEVEL).unwrap();
            let decoded = decode(&encoded, encoding).unwrap();
            assert!(decoded.is_empty(), "{encoding} mangled empty input");
        }
    }

    #[test]
    fn binary_input_round_trips() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        for encoding in [
            ContentEncoding::Gzip,
            ContentEncoding::Deflate,
            ContentEncoding::Br,
            ContentEncoding::Zstd,
            ContentEncoding::Compress,
        ] {
            let encoded = encode(&data, encoding, DEFAULT_LEVEL).unwrap();
            assert_eq!(decode(&encoded, encoding).unwrap(), data);
        }
    }

    #[test]
    fn invalid_levels_fall_back_to_defaults() {
        for level in [-3, 0, 99] {
            assert!(encode(SAMPLE, ContentEncoding::Gzip, level).is_ok());
            assert!(encode(SAMPLE, ContentEncoding::Br, level).is_ok());
            assert!(encode(SAMPLE, ContentEncoding::Zstd, level).is_ok());
        }
    }

    #[test]
    fn gzip_output_has_magic_bytes() {
        let encoded = encode(SAMPLE, ContentEncoding::Gzip, DEFAULT_LEVEL).unwrap();
        assert_eq!(&encoded[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn identity_copies_input() {
        assert_eq!(encode(SAMPLE, ContentEncoding::Identity, 0).unwrap(), SAMPLE);
        assert_eq!(decode(SAMPLE, ContentEncoding::Identity).unwrap(), SAMPLE);
    }

    #[test]
    fn garbage_input_surfaces_tagged_errors() {
        let garbage = b"definitely not compressed";
        for encoding in [
            ContentEncoding::Gzip,
            ContentEncoding::Zstd,
        ] {
            let err = decode(garbage, encoding).unwrap_err();
            match err {
                Error::Encoding { tag, .. } => assert_eq!(tag, encoding.as_str()),
                other => panic!("expected encoding error, got {other}"),
            }
        }
    }
}
