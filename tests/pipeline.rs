//! Black-box pipeline tests: ingest through a shard, ship through the
//! bucket codec, aggregate, and decode the resulting RowBinary insert body.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use tallyd::agent::codec;
use tallyd::agent::shard::Shard;
use tallyd::aggregator::{Aggregator, AggregatorBucket};
use tallyd::config::AggregatorConfig;
use tallyd::data_model::{Key, MetricsBucket, MultiItem};
use tallyd::format::{
    StaticMetaProvider, BUILTIN_METRIC_ID_BADGES, BUILTIN_METRIC_ID_CONTRIBUTORS_LOG,
    BUILTIN_METRIC_ID_INGESTION_STATUS, MAX_TAGS, TAG_VALUE_ID_BADGE_INGESTION_ERRORS,
    TAG_VALUE_ID_BADGE_INGESTION_WARNINGS, TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_DEPRECATED_T,
};
use tallyd::rowbinary::Reader;

#[derive(Debug)]
struct Row {
    metric: i32,
    prekey: i32,
    prekey_set: u8,
    time: u32,
    tags: [i32; MAX_TAGS],
    count: f64,
    min: f64,
    max: f64,
    sum: f64,
    sum_square: f64,
    centroids: Vec<(f32, f32)>,
    skip_degree: u8,
    unique_hashes: Vec<i64>,
    skey: String,
    min_host: Option<(i32, f32)>,
    max_host: Option<(i32, f32)>,
}

fn read_arg_min_max(r: &mut Reader<'_>) -> Option<(i32, f32)> {
    let has_arg = r.read_u8().expect("arg flag");
    if has_arg == 0 {
        assert_eq!(r.read_u8().expect("value flag"), 0);
        return None;
    }
    let arg = r.read_i32().expect("arg");
    assert_eq!(r.read_u8().expect("value flag"), 1);
    let value = r.read_f32().expect("value");
    Some((arg, value))
}

fn decode_rows(body: &[u8]) -> Vec<Row> {
    let mut r = Reader::new(body);
    let mut rows = Vec::new();
    while !r.is_empty() {
        let metric = r.read_i32().expect("metric");
        let prekey = r.read_i32().expect("prekey");
        let prekey_set = r.read_u8().expect("prekey_set");
        let time = r.read_u32().expect("time");
        let mut tags = [0i32; MAX_TAGS];
        for tag in &mut tags {
            *tag = r.read_i32().expect("tag");
        }
        let count = r.read_f64().expect("count");
        let min = r.read_f64().expect("min");
        let max = r.read_f64().expect("max");
        let sum = r.read_f64().expect("sum");
        let sum_square = r.read_f64().expect("sum_square");
        let centroid_count = r.read_varint().expect("centroid count");
        let mut centroids = Vec::with_capacity(centroid_count as usize);
        for _ in 0..centroid_count {
            let mean = r.read_f32().expect("centroid mean");
            let weight = r.read_f32().expect("centroid weight");
            centroids.push((mean, weight));
        }
        let skip_degree = r.read_u8().expect("skip degree");
        let hash_count = r.read_varint().expect("hash count");
        let mut unique_hashes = Vec::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            unique_hashes.push(r.read_i64().expect("hash"));
        }
        let skey = r.read_string().expect("skey");
        let min_host = read_arg_min_max(&mut r);
        let max_host = read_arg_min_max(&mut r);
        rows.push(Row {
            metric,
            prekey,
            prekey_set,
            time,
            tags,
            count,
            min,
            max,
            sum,
            sum_square,
            centroids,
            skip_degree,
            unique_hashes,
            skey,
            min_host,
            max_host,
        });
    }
    rows
}

fn test_shard(start_time: u32) -> Shard {
    Shard::new(
        0,
        1,
        start_time,
        100,
        Arc::new(AtomicU32::new(60)),
        Duration::ZERO,
        None,
    )
}

/// Ships everything a shard has preprocessed through the conveyor codec and
/// back, the way the transport would.
fn ship_through_conveyor(shard: &Shard, codec_name: &str) -> Vec<MetricsBucket> {
    let mut out = Vec::new();
    while let Some((time, buckets)) = shard.take_preprocessing() {
        let mut merged = MetricsBucket::new(time);
        for bucket in &buckets {
            for (key, item) in &bucket.multi_items {
                merged.map_key_item(*key, 100).merge_from(item);
            }
        }
        let payload = codec::encode_bucket(&mut merged);
        let frame = codec::compress_frame(&payload, codec_name).expect("compress");
        let payload = codec::decompress_frame(&frame, codec_name).expect("decompress");
        out.push(codec::decode_bucket(&payload).expect("decode"));
    }
    out
}

fn marshal(buckets: &mut [AggregatorBucket], config: AggregatorConfig) -> Vec<u8> {
    let aggregator =
        Aggregator::with_seed(config, Arc::new(StaticMetaProvider::new()), 9, 1);
    aggregator.marshal_insert(buckets)
}

#[test]
fn test_single_counter_end_to_end() {
    let shard = test_shard(100);
    let mut tags = [0i32; MAX_TAGS];
    tags[0] = 1;
    tags[1] = 2;
    let key = Key::at(100, 42, tags);
    shard.add_counter_host(key, key.hash64(), 3.0, 0, None);
    shard.advance_time(101);

    let shipped = ship_through_conveyor(&shard, "zstd");
    assert_eq!(shipped.len(), 1);
    let mut agg_bucket = AggregatorBucket::new(100);
    agg_bucket.merge_contributor(&shipped[0], false);

    let body = marshal(&mut [agg_bucket], AggregatorConfig::default());
    let rows = decode_rows(&body);

    let user_rows: Vec<&Row> = rows.iter().filter(|r| r.metric == 42).collect();
    assert_eq!(user_rows.len(), 1);
    let row = user_rows[0];
    assert_eq!(row.prekey, 0);
    assert_eq!(row.prekey_set, 0);
    assert_eq!(row.time, 100);
    assert_eq!(row.tags[0], 1);
    assert_eq!(row.tags[1], 2);
    assert_eq!(row.count, 3.0);
    assert_eq!(row.min, 0.0);
    assert_eq!(row.max, 3.0);
    assert_eq!(row.sum, 0.0);
    assert_eq!(row.sum_square, 0.0);
    assert!(row.centroids.is_empty());
    assert!(row.unique_hashes.is_empty());
    assert_eq!(row.skey, "");
    assert_eq!(row.min_host, None);
    assert_eq!(row.max_host, Some((0, 3.0)));

    // The insert also logs end-to-end delay for the touched second.
    let log_row = rows
        .iter()
        .find(|r| r.metric == BUILTIN_METRIC_ID_CONTRIBUTORS_LOG)
        .expect("contributors log row");
    assert_eq!(log_row.tags[1], 100);
}

#[test]
fn test_resolution_five_rounds_and_ships_through_pipeline() {
    let mut slow = tallyd::format::MetricMeta::new(42, "slow_metric");
    slow.effective_resolution = 5;

    let shard = test_shard(100);
    let key = Key::at(103, 42, [0; MAX_TAGS]);
    shard.add_counter_host(key, 0x4000_0000, 2.0, 0, Some(&slow));

    let mut shipped = Vec::new();
    for t in 101..=110 {
        shard.advance_time(t);
        shipped.extend(ship_through_conveyor(&shard, "none"));
    }
    let item_key = shipped
        .iter()
        .flat_map(|b| b.multi_items.keys())
        .find(|k| k.metric == 42)
        .expect("routed item shipped");
    // Timestamp rounded onto the 5-second grid.
    assert_eq!(item_key.timestamp, 100);
}

#[test]
fn test_string_top_overflow_folds_into_tail() {
    let shard = test_shard(100);
    let key = Key::at(100, 42, [0; MAX_TAGS]);
    for (skey, count) in [("a", 10.0), ("b", 9.0), ("c", 8.0), ("d", 7.0), ("e", 6.0)] {
        shard.apply_counter(key, key.hash64(), skey, count, 0, None);
    }
    shard.advance_time(101);

    let shipped = ship_through_conveyor(&shard, "zstd");
    let mut agg_bucket = AggregatorBucket::new(100);
    agg_bucket.merge_contributor(&shipped[0], false);

    let config = AggregatorConfig {
        string_top_count_insert: 3,
        ..AggregatorConfig::default()
    };
    let body = marshal(&mut [agg_bucket], config);
    let rows = decode_rows(&body);

    let user_rows: Vec<&Row> = rows.iter().filter(|r| r.metric == 42).collect();
    assert_eq!(user_rows.len(), 4, "3 surviving tops plus the folded tail");

    let mut top_counts: Vec<(String, f64)> = user_rows
        .iter()
        .filter(|r| !r.skey.is_empty())
        .map(|r| (r.skey.clone(), r.count))
        .collect();
    top_counts.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("finite"));
    assert_eq!(
        top_counts,
        vec![
            ("a".to_string(), 10.0),
            ("b".to_string(), 9.0),
            ("c".to_string(), 8.0)
        ]
    );

    let tail_row = user_rows
        .iter()
        .find(|r| r.skey.is_empty())
        .expect("tail row");
    assert_eq!(tail_row.count, 13.0);

    let total: f64 = user_rows.iter().map(|r| r.count).sum();
    assert_eq!(total, 40.0);
}

#[test]
fn test_ingestion_status_badge_translation() {
    let mut bucket = AggregatorBucket::new(103);
    let mut tags = [0i32; MAX_TAGS];
    tags[1] = 7;
    tags[2] = TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_DEPRECATED_T;
    let key = Key::at(103, BUILTIN_METRIC_ID_INGESTION_STATUS, tags);
    bucket
        .multi_items
        .entry(key)
        .or_insert_with(|| MultiItem::new(4))
        .tail
        .add_counter_host(5.0, 0);
    bucket.contributors_original.add_counter_host(1.0, 0);

    let body = marshal(&mut [bucket], AggregatorConfig::default());
    let rows = decode_rows(&body);

    let badge = rows
        .iter()
        .find(|r| r.metric == BUILTIN_METRIC_ID_BADGES)
        .expect("badge row");
    assert_eq!(badge.tags[1], TAG_VALUE_ID_BADGE_INGESTION_WARNINGS);
    assert_eq!(badge.tags[2], 7);
    assert_eq!(badge.time, 100, "badge timestamps align to the 5s grid");
    assert_eq!(badge.count, 5.0);

    // The status row itself still ships, charged to metric 7's budget.
    assert!(rows
        .iter()
        .any(|r| r.metric == BUILTIN_METRIC_ID_INGESTION_STATUS));
}

#[test]
fn test_error_status_becomes_error_badge() {
    let mut bucket = AggregatorBucket::new(100);
    let mut tags = [0i32; MAX_TAGS];
    tags[1] = 9;
    tags[2] = 999; // unknown status tag: an error, not a warning
    let key = Key::at(100, BUILTIN_METRIC_ID_INGESTION_STATUS, tags);
    bucket
        .multi_items
        .entry(key)
        .or_insert_with(|| MultiItem::new(4))
        .tail
        .add_counter_host(2.0, 0);

    let body = marshal(&mut [bucket], AggregatorConfig::default());
    let rows = decode_rows(&body);
    let badge = rows
        .iter()
        .find(|r| r.metric == BUILTIN_METRIC_ID_BADGES)
        .expect("badge row");
    assert_eq!(badge.tags[1], TAG_VALUE_ID_BADGE_INGESTION_ERRORS);
    assert_eq!(badge.tags[2], 9);
}

#[test]
fn test_percentiles_and_uniques_survive_the_pipeline() {
    let mut timed = tallyd::format::MetricMeta::new(50, "request_time");
    timed.has_percentiles = true;

    let shard = test_shard(100);
    let value_key = Key::at(100, 50, [0; MAX_TAGS]);
    shard.add_value_counter_host(value_key, value_key.hash64(), 2.5, 4.0, 3, Some(&timed));
    let unique_key = Key::at(100, 51, [0; MAX_TAGS]);
    shard.apply_unique(
        unique_key,
        unique_key.hash64(),
        "",
        &[111, 222, 333],
        0.0,
        0,
        None,
    );
    shard.advance_time(101);

    let shipped = ship_through_conveyor(&shard, "zstd");
    let mut agg_bucket = AggregatorBucket::new(100);
    agg_bucket.merge_contributor(&shipped[0], false);
    let body = marshal(&mut [agg_bucket], AggregatorConfig::default());
    let rows = decode_rows(&body);

    let value_row = rows.iter().find(|r| r.metric == 50).expect("value row");
    assert_eq!(value_row.count, 4.0);
    assert_eq!(value_row.min, 2.5);
    assert_eq!(value_row.max, 2.5);
    assert_eq!(value_row.sum, 10.0);
    assert_eq!(value_row.centroids, vec![(2.5, 4.0)]);
    assert_eq!(value_row.min_host, Some((3, 2.5)));
    assert_eq!(value_row.max_host, Some((3, 2.5)));

    let unique_row = rows.iter().find(|r| r.metric == 51).expect("unique row");
    assert_eq!(unique_row.count, 3.0);
    assert_eq!(unique_row.skip_degree, 0);
    let mut hashes = unique_row.unique_hashes.clone();
    hashes.sort_unstable();
    assert_eq!(hashes, vec![111, 222, 333]);
}

#[test]
fn test_zero_counter_items_are_omitted() {
    let mut bucket = AggregatorBucket::new(100);
    let key = Key::at(100, 42, [0; MAX_TAGS]);
    // An item that exists but never accumulated anything.
    bucket.multi_items.insert(key, MultiItem::new(4));

    let body = marshal(&mut [bucket], AggregatorConfig::default());
    let rows = decode_rows(&body);
    assert!(rows.iter().all(|r| r.metric != 42));
    // The self-metric rows themselves all carry positive counters.
    assert!(rows.iter().all(|r| r.count > 0.0));
}

#[test]
fn test_historic_buckets_tagged_and_sized_separately() {
    let make_bucket = |time: u32, metric: i32| {
        let mut bucket = AggregatorBucket::new(time);
        let key = Key::at(time, metric, [0; MAX_TAGS]);
        bucket
            .multi_items
            .entry(key)
            .or_insert_with(|| MultiItem::new(4))
            .tail
            .add_counter_host(1.0, 0);
        bucket.contributors_original.add_counter_host(1.0, 0);
        bucket
    };
    let mut batch = [make_bucket(200, 42), make_bucket(140, 43)];
    let body = marshal(&mut batch, AggregatorConfig::default());
    let rows = decode_rows(&body);

    // Both buckets' user rows are present with their own timestamps.
    assert!(rows.iter().any(|r| r.metric == 42 && r.time == 200));
    assert!(rows.iter().any(|r| r.metric == 43 && r.time == 140));

    // Insert-size self metrics exist for the recent and the historic bucket.
    let size_rows: Vec<&Row> = rows
        .iter()
        .filter(|r| r.metric == tallyd::format::BUILTIN_METRIC_ID_AGG_INSERT_SIZE)
        .collect();
    assert!(size_rows.iter().any(|r| r.time == 200));
    assert!(size_rows.iter().any(|r| r.time == 140));
}
