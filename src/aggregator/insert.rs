//! Row encoder: turns sampled bucket contents into the column store's
//! RowBinary layout, augmented with badge, insert-size, sampling and
//! contributor-log self metrics.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use rand::Rng;

use crate::config::AggregatorConfig;
use crate::data_model::sampler::{Sampler, SamplerConfig, SamplerStatistics, SamplingPair};
use crate::data_model::{
    ItemValue, Key, MultiItem, MultiValue, INSERT_BUDGET_FIXED,
};
use crate::format::{self, hardware_metric, MetaProvider, MAX_TAGS};
use crate::rowbinary;

use super::AggregatorBucket;

/// Column list of the insert statement, in row order.
pub fn table_desc(table: &str) -> String {
    let keys: Vec<String> = (0..MAX_TAGS).map(|i| format!("key{i}")).collect();
    format!(
        "{table}(metric,prekey,prekey_set,time,{},count,min,max,sum,sumsquare,percentiles,uniq_state,skey,min_host,max_host)",
        keys.join(",")
    )
}

#[derive(Debug, Clone, Copy, Default)]
struct CachedMeta {
    prekey: i32,
    prekey_only: bool,
    skip_min_host: bool,
    skip_max_host: bool,
    skip_sum_square: bool,
}

impl CachedMeta {
    fn unset() -> Self {
        Self {
            prekey: -1,
            ..Default::default()
        }
    }

    fn from_meta(meta: &format::MetricMeta) -> Self {
        Self {
            prekey: meta.pre_key_index,
            prekey_only: meta.pre_key_only,
            skip_min_host: meta.skip_min_host,
            skip_max_host: meta.skip_max_host,
            skip_sum_square: meta.skip_sum_square,
        }
    }
}

/// Per-metric skip/prekey flags with a one-slot cache. The item stream is
/// mostly sorted by metric, except ingestion statuses are interleaved
/// because they are credited to the metric they describe, so that one is
/// cached separately.
struct MetricCache<'a> {
    meta: Option<&'a dyn MetaProvider>,
    ingestion_status: CachedMeta,
    last_metric_id: i32,
    last: CachedMeta,
}

impl<'a> MetricCache<'a> {
    fn new(meta: Option<&'a dyn MetaProvider>) -> Self {
        let ingestion_status = meta
            .and_then(|m| m.meta_for(format::BUILTIN_METRIC_ID_INGESTION_STATUS))
            .map(|m| CachedMeta::from_meta(&m))
            .unwrap_or_else(CachedMeta::unset);
        Self {
            meta,
            ingestion_status,
            last_metric_id: 0,
            last: CachedMeta::unset(),
        }
    }

    fn lookup(&mut self, metric_id: i32) -> CachedMeta {
        if metric_id == format::BUILTIN_METRIC_ID_INGESTION_STATUS {
            return self.ingestion_status;
        }
        if metric_id != self.last_metric_id {
            self.last_metric_id = metric_id;
            self.last = self
                .meta
                .and_then(|m| m.meta_for(metric_id))
                .map(|m| CachedMeta::from_meta(&m))
                .unwrap_or_else(CachedMeta::unset);
        }
        self.last
    }
}

/// Encoded bytes per row class, tracked per bucket timestamp.
#[derive(Debug, Clone, Copy, Default)]
struct InsertSize {
    counters: usize,
    values: usize,
    percentiles: usize,
    uniques: usize,
    string_tops: usize,
    builtin: usize,
}

impl InsertSize {
    fn add(&mut self, other: InsertSize) {
        self.counters += other.counters;
        self.values += other.values;
        self.percentiles += other.percentiles;
        self.uniques += other.uniques;
        self.string_tops += other.string_tops;
        self.builtin += other.builtin;
    }
}

struct Encoder<'a> {
    res: Vec<u8>,
    cache: MetricCache<'a>,
    used_timestamps: HashSet<u32>,
    insert_sizes: HashMap<u32, InsertSize>,
    aggregator_host: i32,
}

impl Encoder<'_> {
    fn append_keys(&mut self, key: &Key, track_timestamp: bool) {
        let meta = self.cache.lookup(key.metric);
        self.res.extend_from_slice(&key.metric.to_le_bytes());
        if meta.prekey >= 0 && (meta.prekey as usize) < MAX_TAGS {
            self.res
                .extend_from_slice(&key.tags[meta.prekey as usize].to_le_bytes());
            self.res.push(if meta.prekey_only { 2 } else { 1 });
        } else {
            self.res.extend_from_slice(&0i32.to_le_bytes());
            self.res.push(0);
        }
        self.res.extend_from_slice(&key.timestamp.to_le_bytes());
        if track_timestamp {
            self.used_timestamps.insert(key.timestamp);
        }
        for tag in key.tags {
            self.res.extend_from_slice(&tag.to_le_bytes());
        }
    }

    fn multi_value_marshal(&mut self, metric_id: i32, value: &mut MultiValue, skey: &str, sf: f64) {
        let meta = self.cache.lookup(metric_id);
        let counter = value.value.counter * sf;
        if value.value.value_set {
            rowbinary::append_aggregates(
                &mut self.res,
                counter,
                value.value.value_min,
                value.value.value_max,
                value.value.value_sum * sf,
                zero_if(value.value.value_sum_square * sf, meta.skip_sum_square),
            );
        } else {
            // Max carries the aggregated counter so shard-merged rows keep
            // per-shard rate spikes visible through max().
            rowbinary::append_aggregates(&mut self.res, counter, 0.0, counter, 0.0, 0.0);
        }
        match &mut value.percentiles {
            Some(digest) => rowbinary::append_centroids(&mut self.res, digest.centroids(), sf),
            None => rowbinary::append_empty_centroids(&mut self.res),
        }
        if value.uniques.is_empty() {
            rowbinary::append_empty_unique(&mut self.res);
        } else {
            rowbinary::append_unique(&mut self.res, &value.uniques);
        }
        rowbinary::append_string(&mut self.res, skey);
        if value.value.value_set {
            if meta.skip_min_host {
                rowbinary::append_arg_min_max_empty(&mut self.res);
            } else {
                rowbinary::append_arg_min_max_int32_float32(
                    &mut self.res,
                    value.value.min_host_tag,
                    value.value.value_min as f32,
                );
            }
            if meta.skip_max_host {
                rowbinary::append_arg_min_max_empty(&mut self.res);
            } else {
                rowbinary::append_arg_min_max_int32_float32(
                    &mut self.res,
                    value.value.max_host_tag,
                    value.value.value_max as f32,
                );
            }
        } else {
            // Counters have no min host; the max slot credits the heaviest
            // contributing host, which is close enough in practice.
            rowbinary::append_arg_min_max_empty(&mut self.res);
            if meta.skip_max_host {
                rowbinary::append_arg_min_max_empty(&mut self.res);
            } else {
                rowbinary::append_arg_min_max_int32_float32(
                    &mut self.res,
                    value.value.max_counter_host_tag,
                    counter as f32,
                );
            }
        }
    }

    /// One row per non-empty tail and top entry, size-accounted per class.
    fn insert_item(&mut self, key: Key, item: &mut MultiItem, sf: f64, bucket_ts: u32) {
        let mut is = InsertSize::default();
        let mut pos = self.res.len();
        if !item.tail.is_empty() {
            self.append_keys(&key, true);
            self.multi_value_marshal(key.metric, &mut item.tail, "", sf);
            let grew = self.res.len() - pos;
            if key.metric < 0 {
                is.builtin += grew;
            } else if item.tail.percentiles.is_some() {
                is.percentiles += grew;
            } else if !item.tail.uniques.is_empty() {
                is.uniques += grew;
            } else if item.tail.value.value_set {
                is.values += grew;
            } else {
                is.counters += grew;
            }
        }
        pos = self.res.len();
        for (skey, value) in item.top.iter_mut() {
            if value.is_empty() {
                continue;
            }
            // No badges for string tops.
            self.append_keys(&key, true);
            self.multi_value_marshal(key.metric, value, skey, sf);
        }
        let grew = self.res.len() - pos;
        if key.metric < 0 {
            is.builtin += grew;
        } else {
            is.string_tops += grew;
        }
        self.insert_sizes.entry(bucket_ts).or_default().add(is);
    }

    fn append_multi_badge(&mut self, key: &Key, item: &MultiItem) {
        if key.metric >= 0 {
            return;
        }
        for value in item.top.values() {
            self.append_badge(key, value.value);
        }
        self.append_badge(key, item.tail.value);
    }

    /// Translates built-in error/warning rows into badge rows on the
    /// 5-second grid.
    fn append_badge(&mut self, key: &Key, value: ItemValue) {
        if key.metric >= 0 {
            return;
        }
        let ts = key.timestamp / 5 * 5;
        let badge = |badge_tag: i32, arg: i32| {
            let mut tags = [0i32; MAX_TAGS];
            tags[1] = badge_tag;
            tags[2] = arg;
            Key::at(ts, format::BUILTIN_METRIC_ID_BADGES, tags)
        };
        match key.metric {
            format::BUILTIN_METRIC_ID_INGESTION_STATUS => {
                if key.tags[1] == 0 {
                    return;
                }
                match key.tags[2] {
                    format::TAG_VALUE_ID_SRC_INGESTION_STATUS_OK_CACHED
                    | format::TAG_VALUE_ID_SRC_INGESTION_STATUS_OK_UNCACHED => {}
                    format::TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_DEPRECATED_KEY_NAME
                    | format::TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_DEPRECATED_T
                    | format::TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_DEPRECATED_STOP
                    | format::TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_MAP_TAG_SET_TWICE
                    | format::TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_OLD_COUNTER_SEMANTIC
                    | format::TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_MAP_INVALID_RAW_TAG_VALUE => {
                        self.append_value_stat(
                            badge(format::TAG_VALUE_ID_BADGE_INGESTION_WARNINGS, key.tags[1]),
                            "",
                            value,
                        );
                    }
                    _ => {
                        self.append_value_stat(
                            badge(format::TAG_VALUE_ID_BADGE_INGESTION_ERRORS, key.tags[1]),
                            "",
                            value,
                        );
                    }
                }
            }
            format::BUILTIN_METRIC_ID_AGENT_SAMPLING_FACTOR => {
                self.append_value_stat(
                    badge(format::TAG_VALUE_ID_BADGE_AGENT_SAMPLING_FACTOR, key.tags[1]),
                    "",
                    value,
                );
            }
            format::BUILTIN_METRIC_ID_AGG_SAMPLING_FACTOR => {
                self.append_value_stat(
                    badge(format::TAG_VALUE_ID_BADGE_AGG_SAMPLING_FACTOR, key.tags[4]),
                    "",
                    value,
                );
            }
            format::BUILTIN_METRIC_ID_AGG_MAPPING_CREATED => {
                if key.tags[5] == format::TAG_VALUE_ID_AGG_MAPPING_CREATED_STATUS_OK
                    || key.tags[5] == format::TAG_VALUE_ID_AGG_MAPPING_CREATED_STATUS_CREATED
                {
                    return;
                }
                self.append_value_stat(
                    badge(format::TAG_VALUE_ID_BADGE_AGG_MAPPING_ERRORS, key.tags[4]),
                    "",
                    value,
                );
            }
            format::BUILTIN_METRIC_ID_AGG_BUCKET_RECEIVE_DELAY_SEC => {
                self.append_value_stat(
                    badge(format::TAG_VALUE_ID_BADGE_CONTRIBUTORS, 0),
                    "",
                    value,
                );
            }
            _ => {}
        }
    }

    /// One plain row from an ItemValue; rows with a non-positive counter
    /// are omitted (built-in counters are normally zero).
    fn append_value_stat(&mut self, key: Key, skey: &str, value: ItemValue) {
        if value.counter <= 0.0 {
            return;
        }
        self.append_keys(&key, true);
        let meta = self.cache.lookup(key.metric);
        if value.value_set {
            rowbinary::append_aggregates(
                &mut self.res,
                value.counter,
                value.value_min,
                value.value_max,
                value.value_sum,
                zero_if(value.value_sum_square, meta.skip_sum_square),
            );
        } else {
            rowbinary::append_aggregates(&mut self.res, value.counter, 0.0, value.counter, 0.0, 0.0);
        }
        rowbinary::append_empty_centroids(&mut self.res);
        rowbinary::append_empty_unique(&mut self.res);
        rowbinary::append_string(&mut self.res, skey);
        if value.value_set {
            if meta.skip_min_host {
                rowbinary::append_arg_min_max_empty(&mut self.res);
            } else {
                rowbinary::append_arg_min_max_int32_float32(
                    &mut self.res,
                    value.min_host_tag,
                    value.value_min as f32,
                );
            }
            if meta.skip_max_host {
                rowbinary::append_arg_min_max_empty(&mut self.res);
            } else {
                rowbinary::append_arg_min_max_int32_float32(
                    &mut self.res,
                    value.max_host_tag,
                    value.value_max as f32,
                );
            }
        } else {
            rowbinary::append_arg_min_max_empty(&mut self.res);
            if meta.skip_max_host {
                rowbinary::append_arg_min_max_empty(&mut self.res);
            } else {
                rowbinary::append_arg_min_max_int32_float32(
                    &mut self.res,
                    value.max_counter_host_tag,
                    value.counter as f32,
                );
            }
        }
    }

    fn append_simple_value_stat(&mut self, key: Key, value: f64, count: f64) {
        let host = self.aggregator_host;
        self.append_value_stat(key, "", ItemValue::simple(value, count, host));
    }

    /// Five per-class size rows; returns the byte cost of the last one,
    /// used as the estimate for the builtin-size row itself.
    fn append_insert_size_stats(&mut self, time: u32, is: InsertSize, conveyor_tag: i32) -> usize {
        let classes = [
            (format::TAG_VALUE_ID_SIZE_COUNTER, is.counters),
            (format::TAG_VALUE_ID_SIZE_VALUE, is.values),
            (format::TAG_VALUE_ID_SIZE_PERCENTILES, is.percentiles),
            (format::TAG_VALUE_ID_SIZE_UNIQUE, is.uniques),
        ];
        for (class_tag, size) in classes {
            self.append_simple_value_stat(
                agg_insert_size_key(time, conveyor_tag, class_tag),
                size as f64,
                1.0,
            );
        }
        let before = self.res.len();
        self.append_simple_value_stat(
            agg_insert_size_key(time, conveyor_tag, format::TAG_VALUE_ID_SIZE_STRING_TOP),
            is.string_tops as f64,
            1.0,
        );
        self.res.len() - before
    }
}

fn agg_insert_size_key(time: u32, conveyor_tag: i32, class_tag: i32) -> Key {
    let mut tags = [0i32; MAX_TAGS];
    tags[4] = conveyor_tag;
    tags[5] = class_tag;
    Key::at(time, format::BUILTIN_METRIC_ID_AGG_INSERT_SIZE, tags)
}

fn zero_if(value: f64, cond: bool) -> f64 {
    if cond {
        0.0
    } else {
        value
    }
}

/// Samples and encodes a conveyor batch into the insert body. By
/// convention the first bucket is recent, the rest are historic resends.
pub fn row_data_marshal<R: Rng>(
    buckets: &mut [AggregatorBucket],
    config: &AggregatorConfig,
    meta: Option<&dyn MetaProvider>,
    aggregator_host: i32,
    rng: &mut R,
    insert_time_unix: u32,
) -> Vec<u8> {
    let start = Instant::now();
    if buckets.is_empty() {
        return Vec::new();
    }

    let mut encoder = Encoder {
        res: Vec::new(),
        cache: MetricCache::new(meta),
        used_timestamps: HashSet::new(),
        insert_sizes: HashMap::with_capacity(buckets.len()),
        aggregator_host,
    };

    let item_count: usize = buckets.iter().map(|b| b.multi_items.len()).sum();
    let mut sampler = Sampler::new(
        item_count,
        SamplerConfig {
            meta,
            sample_namespaces: &config.sample_namespaces,
            sample_groups: &config.sample_groups,
            sample_keys: &config.sample_keys,
        },
    );
    let mut stat = SamplerStatistics::default();

    for bucket in buckets.iter_mut() {
        let mut is = InsertSize::default();
        let mut items: Vec<(Key, MultiItem)> = bucket.multi_items.drain().collect();
        // Stable candidate order keeps the keep-set reproducible per seed.
        items.sort_by(|a, b| {
            (a.0.metric, a.0.timestamp, a.0.tags).cmp(&(b.0.metric, b.0.timestamp, b.0.tags))
        });
        for (key, mut item) in items {
            // Excess top entries fold into the tail before anything ships.
            let whale_weight = item.finish_string_top(config.string_top_count_insert);

            let pos = encoder.res.len();
            encoder.append_multi_badge(&key, &item);
            is.builtin += encoder.res.len() - pos;

            let mut account_metric = key.metric;
            if key.metric < 0 {
                let ingestion_status =
                    key.metric == format::BUILTIN_METRIC_ID_INGESTION_STATUS;
                let hardware = hardware_metric(key.metric);
                if !ingestion_status && !hardware {
                    // Self metrics are never sampled away.
                    let size = item.row_binary_size_estimate();
                    encoder.insert_item(key, &mut item, 1.0, bucket.time);
                    sampler.keep_unsampled(&mut stat, key.metric, size);
                    continue;
                }
                if ingestion_status && key.tags[1] != 0 {
                    // Charge the described metric so budgets isolate
                    // faulty producers.
                    account_metric = key.tags[1];
                }
            }
            let size = item.row_binary_size_estimate();
            sampler.add(SamplingPair {
                key,
                item,
                whale_weight,
                size,
                account_metric,
                bucket_ts: bucket.time,
            });
        }
        encoder.insert_sizes.entry(bucket.time).or_default().add(is);
    }

    // Same contributor counted per bucket on purpose: a historic resend
    // arrives alongside the recent bucket and brings its own budget.
    let num_contributors: f64 = buckets
        .iter()
        .map(|b| b.contributors_original.counter + b.contributors_spare.counter)
        .sum();
    let budget = INSERT_BUDGET_FIXED + (config.insert_budget as f64 * num_contributors) as i64;
    sampler.run(budget, rng, &mut stat, |key, item, sf, bucket_ts| {
        encoder.insert_item(key, item, sf, bucket_ts);
    });

    let res_pos = encoder.res.len();
    let recent_time = buckets[0].time;
    let historic_tag = if buckets.len() > 1 {
        format::TAG_VALUE_ID_CONVEYOR_HISTORIC
    } else {
        format::TAG_VALUE_ID_CONVEYOR_RECENT
    };

    for (&(ns, group, metric), sizes) in &stat.items {
        let mut tags = [0i32; MAX_TAGS];
        tags[1] = historic_tag;
        tags[2] = format::TAG_VALUE_ID_SAMPLING_DECISION_KEEP;
        tags[3] = ns;
        tags[4] = group;
        tags[5] = metric;
        let key = Key::at(
            recent_time,
            format::BUILTIN_METRIC_ID_AGG_SAMPLING_SIZE_BYTES,
            tags,
        );
        let mut item = MultiItem::new(1);
        item.tail.value = sizes.sum_size_keep;
        encoder.insert_item(key, &mut item, 1.0, recent_time);

        let mut tags = tags;
        tags[2] = format::TAG_VALUE_ID_SAMPLING_DECISION_DISCARD;
        let key = Key::at(
            recent_time,
            format::BUILTIN_METRIC_ID_AGG_SAMPLING_SIZE_BYTES,
            tags,
        );
        let mut item = MultiItem::new(1);
        item.tail.value = sizes.sum_size_discard;
        encoder.insert_item(key, &mut item, 1.0, recent_time);
    }

    for (metric, sf) in stat.sample_factors() {
        if !sf.is_finite() {
            continue;
        }
        let mut tags = [0i32; MAX_TAGS];
        tags[4] = metric;
        tags[5] = format::TAG_VALUE_ID_AGG_SAMPLING_FACTOR_REASON_INSERT_SIZE;
        let key = Key::at(
            recent_time,
            format::BUILTIN_METRIC_ID_AGG_SAMPLING_FACTOR,
            tags,
        );
        encoder.append_badge(&key, ItemValue::simple(sf, 1.0, aggregator_host));
        encoder.append_simple_value_stat(key, sf, 1.0);
    }

    let mut tags = [0i32; MAX_TAGS];
    tags[1] = historic_tag;
    let budget_key = Key::at(
        recent_time,
        format::BUILTIN_METRIC_ID_AGG_SAMPLING_BUDGET,
        tags,
    );
    let mut budget_item = MultiItem::new(1);
    budget_item.tail.value.add_value(budget as f64);
    encoder.insert_item(budget_key, &mut budget_item, 1.0, recent_time);

    for (&(ns, group), &allocated) in &stat.budget {
        let mut tags = [0i32; MAX_TAGS];
        tags[1] = historic_tag;
        tags[2] = ns;
        tags[3] = group;
        let key = Key::at(
            recent_time,
            format::BUILTIN_METRIC_ID_AGG_SAMPLING_GROUP_BUDGET,
            tags,
        );
        let mut item = MultiItem::new(1);
        item.tail.value.add_value(allocated);
        encoder.insert_item(key, &mut item, 1.0, recent_time);
    }

    let mut tags = [0i32; MAX_TAGS];
    tags[1] = historic_tag;
    encoder.append_simple_value_stat(
        Key::at(
            recent_time,
            format::BUILTIN_METRIC_ID_AGG_SAMPLING_METRIC_COUNT,
            tags,
        ),
        stat.metrics.len() as f64,
        1.0,
    );

    // The builtin-size row is assumed to cost as much as the string-top row.
    let recent_sizes = encoder
        .insert_sizes
        .get(&recent_time)
        .copied()
        .unwrap_or_default();
    let estimated_size = encoder.append_insert_size_stats(
        recent_time,
        recent_sizes,
        format::TAG_VALUE_ID_CONVEYOR_RECENT,
    );

    encoder.append_simple_value_stat(
        Key::at(
            recent_time,
            format::BUILTIN_METRIC_ID_AGG_CONTRIBUTORS,
            [0i32; MAX_TAGS],
        ),
        num_contributors,
        1.0,
    );

    // End-to-end delay from both indexing directions, for every distinct
    // bucket second touched by this insert.
    let mut used: Vec<u32> = encoder.used_timestamps.iter().copied().collect();
    used.sort_unstable();
    for t in used {
        let mut tags = [0i32; MAX_TAGS];
        tags[1] = t as i32;
        let key = Key::at(
            insert_time_unix,
            format::BUILTIN_METRIC_ID_CONTRIBUTORS_LOG,
            tags,
        );
        let delay = f64::from(insert_time_unix) - f64::from(t);
        let host = encoder.aggregator_host;
        encoder.append_value_stat(key, "", ItemValue::simple(delay, 1.0, host));
        let mut tags = [0i32; MAX_TAGS];
        tags[1] = insert_time_unix as i32;
        let key = Key::at(t, format::BUILTIN_METRIC_ID_CONTRIBUTORS_LOG_REV, tags);
        encoder.append_value_stat(key, "", ItemValue::simple(delay, 1.0, host));
    }

    let mut tags = [0i32; MAX_TAGS];
    tags[4] = historic_tag;
    encoder.append_simple_value_stat(
        Key::at(recent_time, format::BUILTIN_METRIC_ID_AGG_SAMPLING_TIME, tags),
        start.elapsed().as_secs_f64(),
        1.0,
    );

    let recent_builtin_size = encoder
        .insert_sizes
        .get(&recent_time)
        .map(|is| is.builtin)
        .unwrap_or(0)
        + (encoder.res.len() - res_pos)
        + estimated_size;
    encoder.append_simple_value_stat(
        agg_insert_size_key(
            recent_time,
            format::TAG_VALUE_ID_CONVEYOR_RECENT,
            format::TAG_VALUE_ID_SIZE_BUILTIN,
        ),
        recent_builtin_size as f64,
        1.0,
    );

    let historic_times: Vec<u32> = buckets[1..].iter().map(|b| b.time).collect();
    for time in historic_times {
        let pos = encoder.res.len();
        let sizes = encoder
            .insert_sizes
            .get(&time)
            .copied()
            .unwrap_or_default();
        encoder.append_insert_size_stats(time, sizes, format::TAG_VALUE_ID_CONVEYOR_HISTORIC);
        let historic_builtin_size =
            sizes.builtin + (encoder.res.len() - pos) + estimated_size;
        encoder.append_simple_value_stat(
            agg_insert_size_key(
                time,
                format::TAG_VALUE_ID_CONVEYOR_HISTORIC,
                format::TAG_VALUE_ID_SIZE_BUILTIN,
            ),
            historic_builtin_size as f64,
            1.0,
        );
    }

    encoder.res
}
