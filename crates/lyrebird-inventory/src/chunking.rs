//! Body chunking with emission deadlines.
//!
//! A replayed body is cut into fixed-size slices, each tagged with the
//! offset from request receipt by which its last byte must be on the wire.
//! The total transfer time derives from the recorded rate; the Mbps unit is
//! the binary megabit (1024*1024 bits) for compatibility with existing
//! inventories.

use std::time::Duration;

use bytes::Bytes;

use lyrebird_core::types::BodyChunk;

/// Default slice size.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Transfer duration assumed when no usable rate was recorded.
pub const FALLBACK_TRANSFER: Duration = Duration::from_millis(100);

/// Splits `body` into timed chunks.
///
/// With a positive finite `mbps` the body takes
/// `8 * len / (mbps * 1024 * 1024)` seconds in total; otherwise
/// [`FALLBACK_TRANSFER`]. The offset of a slice ending at byte `end` is
/// `ttfb + total * end / len`, so offsets increase strictly and the final
/// one lands exactly on `ttfb + total`.
pub fn plan_chunks(
    body: &[u8],
    mbps: Option<f64>,
    ttfb: Duration,
    chunk_size: usize,
) -> Vec<BodyChunk> {
    if body.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let total_size = body.len();

    let total_transfer = match mbps {
        Some(rate) if rate > 0.0 && rate.is_finite() => {
            let total_bits = (total_size * 8) as f64;
            Duration::from_secs_f64(total_bits / (rate * 1024.0 * 1024.0))
        }
        _ => FALLBACK_TRANSFER,
    };

    let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size));
    let mut start = 0;
    while start < total_size {
        let end = (start + chunk_size).min(total_size);
        let progress = end as f64 / total_size as f64;
        let target_offset = ttfb + total_transfer.mul_f64(progress);
        chunks.push(BodyChunk {
            bytes: Bytes::copy_from_slice(&body[start..end]),
            target_offset,
        });
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_yields_no_chunks() {
        assert!(plan_chunks(&[], Some(1.0), Duration::ZERO, DEFAULT_CHUNK_SIZE).is_empty());
    }

    #[test]
    fn chunks_cover_the_body_in_order() {
        let body: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
        let chunks = plan_chunks(&body, Some(10.0), Duration::ZERO, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), body.len().div_ceil(DEFAULT_CHUNK_SIZE));

        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.bytes.to_vec()).collect();
        assert_eq!(reassembled, body);
    }

    #[test]
    fn offsets_increase_strictly() {
        let body = vec![0u8; 64 * 1024];
        let chunks = plan_chunks(&body, Some(1.0), Duration::from_millis(500), 16 * 1024);
        for pair in chunks.windows(2) {
            assert!(pair[0].target_offset < pair[1].target_offset);
        }
    }

    #[test]
    fn final_offset_is_ttfb_plus_transfer_time() {
        // 10 KiB at 1.0 binary Mbps: 8*10240 / (1024*1024) s = 78.125 ms.
        let body = vec![0u8; 10 * 1024];
        let ttfb = Duration::from_millis(500);
        let chunks = plan_chunks(&body, Some(1.0), ttfb, DEFAULT_CHUNK_SIZE);

        let expected = ttfb + Duration::from_secs_f64(8.0 * 10240.0 / (1024.0 * 1024.0));
        let last = chunks.last().unwrap().target_offset;
        let diff = last.abs_diff(expected);
        assert!(diff < Duration::from_micros(10), "off by {diff:?}");
    }

    #[test]
    fn first_chunk_lands_after_ttfb() {
        let body = vec![0u8; 1024];
        let ttfb = Duration::from_millis(200);
        let chunks = plan_chunks(&body, Some(1.0), ttfb, DEFAULT_CHUNK_SIZE);
        assert!(chunks[0].target_offset > ttfb);
    }

    #[test]
    fn missing_rate_falls_back_to_100ms_total() {
        let body = vec![0u8; 32 * 1024];
        for rate in [None, Some(0.0), Some(-2.5), Some(f64::NAN)] {
            let chunks = plan_chunks(&body, rate, Duration::ZERO, 16 * 1024);
            assert_eq!(chunks.last().unwrap().target_offset, FALLBACK_TRANSFER);
        }
    }

    #[test]
    fn single_chunk_body_gets_full_transfer_offset() {
        let body = vec![0u8; 100];
        let chunks = plan_chunks(&body, None, Duration::from_millis(50), DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].target_offset,
            Duration::from_millis(50) + FALLBACK_TRANSFER
        );
    }
}
