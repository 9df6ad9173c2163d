//! Outbound bucket payload codec.
//!
//! Serializes a merged per-second bucket for the conveyor and wraps it in
//! the compression frame: 4 bytes little-endian uncompressed length followed
//! by the codec blob. The transport treats the payload as opaque.

use std::collections::HashMap;
use std::io::Write;

use anyhow::{bail, Context, Result};

use crate::data_model::digest::{Centroid, CentroidDigest};
use crate::data_model::unique::UniqueSketch;
use crate::data_model::{
    ItemValue, Key, MetricsBucket, MultiItem, MultiValue, DEFAULT_STRING_TOP_CAPACITY,
};
use crate::format::MAX_TAGS;
use crate::rowbinary::{self, ReadError, Reader};

const FLAG_VALUE_SET: u8 = 1;
const FLAG_PERCENTILES: u8 = 2;
const FLAG_UNIQUES: u8 = 4;

/// Serializes a bucket. Takes the bucket mutably to flush digest buffers
/// into their centroid form.
pub fn encode_bucket(bucket: &mut MetricsBucket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + bucket.multi_items.len() * 128);
    buf.extend_from_slice(&bucket.time.to_le_bytes());
    rowbinary::append_varint(&mut buf, bucket.multi_items.len() as u64);
    for (key, item) in bucket.multi_items.iter_mut() {
        buf.extend_from_slice(&key.metric.to_le_bytes());
        buf.extend_from_slice(&key.timestamp.to_le_bytes());
        for tag in key.tags {
            buf.extend_from_slice(&tag.to_le_bytes());
        }
        encode_multi_value(&mut buf, &mut item.tail);
        rowbinary::append_varint(&mut buf, item.top.len() as u64);
        for (skey, value) in item.top.iter_mut() {
            rowbinary::append_string(&mut buf, skey);
            encode_multi_value(&mut buf, value);
        }
    }
    buf
}

pub fn decode_bucket(data: &[u8]) -> Result<MetricsBucket, ReadError> {
    let mut r = Reader::new(data);
    let time = r.read_u32()?;
    let mut bucket = MetricsBucket::new(time);
    let item_count = r.read_varint()?;
    for _ in 0..item_count {
        let metric = r.read_i32()?;
        let timestamp = r.read_u32()?;
        let mut tags = [0i32; MAX_TAGS];
        for tag in &mut tags {
            *tag = r.read_i32()?;
        }
        let key = Key::at(timestamp, metric, tags);
        let mut item = MultiItem::new(DEFAULT_STRING_TOP_CAPACITY);
        item.tail = decode_multi_value(&mut r)?;
        let top_count = r.read_varint()?;
        let mut top = HashMap::with_capacity(top_count as usize);
        for _ in 0..top_count {
            let skey = r.read_string()?;
            top.insert(skey, decode_multi_value(&mut r)?);
        }
        item.top = top;
        bucket.multi_items.insert(key, item);
    }
    Ok(bucket)
}

fn encode_multi_value(buf: &mut Vec<u8>, value: &mut MultiValue) {
    let mut flags = 0u8;
    if value.value.value_set {
        flags |= FLAG_VALUE_SET;
    }
    if value.percentiles.is_some() {
        flags |= FLAG_PERCENTILES;
    }
    if !value.uniques.is_empty() {
        flags |= FLAG_UNIQUES;
    }
    buf.push(flags);
    buf.extend_from_slice(&value.value.counter.to_le_bytes());
    if value.value.value_set {
        for v in [
            value.value.value_min,
            value.value.value_max,
            value.value.value_sum,
            value.value.value_sum_square,
        ] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&value.value.min_host_tag.to_le_bytes());
        buf.extend_from_slice(&value.value.max_host_tag.to_le_bytes());
    }
    buf.extend_from_slice(&value.value.max_counter_host_tag.to_le_bytes());
    if let Some(digest) = &mut value.percentiles {
        buf.extend_from_slice(&digest.compression().to_le_bytes());
        let centroids = digest.centroids();
        rowbinary::append_varint(buf, centroids.len() as u64);
        for c in centroids {
            buf.extend_from_slice(&c.mean.to_le_bytes());
            buf.extend_from_slice(&c.weight.to_le_bytes());
        }
    }
    if !value.uniques.is_empty() {
        buf.push(value.uniques.skip_degree());
        let hashes = value.uniques.sorted_hashes();
        rowbinary::append_varint(buf, hashes.len() as u64);
        for h in hashes {
            buf.extend_from_slice(&h.to_le_bytes());
        }
    }
}

fn decode_multi_value(r: &mut Reader<'_>) -> Result<MultiValue, ReadError> {
    let flags = r.read_u8()?;
    let mut value = ItemValue {
        counter: r.read_f64()?,
        ..Default::default()
    };
    if flags & FLAG_VALUE_SET != 0 {
        value.value_set = true;
        value.value_min = r.read_f64()?;
        value.value_max = r.read_f64()?;
        value.value_sum = r.read_f64()?;
        value.value_sum_square = r.read_f64()?;
        value.min_host_tag = r.read_i32()?;
        value.max_host_tag = r.read_i32()?;
    }
    value.max_counter_host_tag = r.read_i32()?;

    let mut out = MultiValue {
        value,
        percentiles: None,
        uniques: UniqueSketch::new(),
    };
    if flags & FLAG_PERCENTILES != 0 {
        let compression = r.read_f64()?;
        let count = r.read_varint()?;
        let mut centroids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            centroids.push(Centroid {
                mean: r.read_f64()?,
                weight: r.read_f64()?,
            });
        }
        out.percentiles = Some(Box::new(CentroidDigest::from_parts(compression, centroids)));
    }
    if flags & FLAG_UNIQUES != 0 {
        // Hashes are re-inserted under the recorded skip degree rather than
        // trusted wholesale.
        let skip_degree = r.read_u8()?;
        let count = r.read_varint()?;
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            hashes.push(r.read_i64()?);
        }
        out.uniques = UniqueSketch::from_parts(skip_degree, hashes);
    }
    Ok(out)
}

// --- Compression frame ---

/// Wraps a payload: 4-byte little-endian uncompressed length, then the
/// codec blob.
pub fn compress_frame(payload: &[u8], codec: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(4 + payload.len() / 2);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    match codec {
        "" | "none" => out.extend_from_slice(payload),
        "zstd" => {
            let compressed = zstd::encode_all(payload, 0).context("zstd encode")?;
            out.extend_from_slice(&compressed);
        }
        "gzip" => {
            let mut encoder =
                flate2::write::GzEncoder::new(&mut out, flate2::Compression::default());
            encoder.write_all(payload).context("gzip encode")?;
            encoder.finish().context("gzip finish")?;
        }
        other => bail!("unsupported compression codec: {other}"),
    }
    Ok(out)
}

pub fn decompress_frame(data: &[u8], codec: &str) -> Result<Vec<u8>> {
    if data.len() < 4 {
        bail!("frame shorter than the length prefix");
    }
    let expected = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let body = &data[4..];
    let payload = match codec {
        "" | "none" => body.to_vec(),
        "zstd" => zstd::decode_all(body).context("zstd decode")?,
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(body);
            let mut out = Vec::with_capacity(expected);
            std::io::Read::read_to_end(&mut decoder, &mut out).context("gzip decode")?;
            out
        }
        other => bail!("unsupported compression codec: {other}"),
    };
    if payload.len() != expected {
        bail!(
            "frame length mismatch: header {expected}, payload {}",
            payload.len()
        );
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bucket() -> MetricsBucket {
        let mut bucket = MetricsBucket::new(1_000);
        let mut tags = [0i32; MAX_TAGS];
        tags[0] = 1;
        tags[1] = 2;

        let item = bucket.map_key_item(Key::at(1_000, 42, tags), 8);
        item.tail.add_counter_host(3.0, 5);
        item.map_string_top("status=200", 2.0)
            .add_value_counter_host(7.5, 2.0, 6);

        let item = bucket.map_key_item(Key::at(1_000, 43, tags), 8);
        item.tail
            .add_value_counter_host_percentile(1.5, 2.0, 0, 40.0);
        item.tail.apply_unique(&[10, 20, 30], 0.0, 0);
        bucket
    }

    #[test]
    fn test_bucket_round_trip() {
        let mut bucket = sample_bucket();
        let payload = encode_bucket(&mut bucket);
        let decoded = decode_bucket(&payload).expect("decodes");

        assert_eq!(decoded.time, 1_000);
        assert_eq!(decoded.multi_items.len(), 2);
        for (key, item) in &bucket.multi_items {
            let got = decoded.multi_items.get(key).expect("item survives");
            assert_eq!(got.tail.value, item.tail.value, "metric {}", key.metric);
            assert_eq!(got.top.len(), item.top.len());
            for (skey, v) in &item.top {
                assert_eq!(got.top.get(skey).expect("top entry").value, v.value);
            }
        }

        // Sketches survive by content.
        let key43 = *bucket
            .multi_items
            .keys()
            .find(|k| k.metric == 43)
            .expect("exists");
        let original = bucket.multi_items.get_mut(&key43).expect("item");
        let got = decoded.multi_items.get(&key43).expect("item");
        assert_eq!(
            got.tail
                .percentiles
                .clone()
                .expect("digest survives")
                .centroids(),
            original.tail.percentiles.as_mut().expect("digest").centroids()
        );
        assert_eq!(got.tail.uniques.estimate(), 3.0);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let mut bucket = sample_bucket();
        let payload = encode_bucket(&mut bucket);
        assert!(decode_bucket(&payload[..payload.len() - 3]).is_err());
    }

    #[test]
    fn test_frame_round_trip_all_codecs() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        for codec in ["none", "zstd", "gzip"] {
            let frame = compress_frame(&payload, codec).expect("compress");
            let header = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            assert_eq!(header as usize, payload.len(), "codec {codec}");
            let back = decompress_frame(&frame, codec).expect("decompress");
            assert_eq!(back, payload, "codec {codec}");
        }
    }

    #[test]
    fn test_frame_compresses_repetitive_payload() {
        let payload = vec![7u8; 100_000];
        let frame = compress_frame(&payload, "zstd").expect("compress");
        assert!(frame.len() < payload.len() / 10);
    }

    #[test]
    fn test_unknown_codec_rejected() {
        assert!(compress_frame(b"x", "lz77").is_err());
    }
}
