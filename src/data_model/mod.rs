//! Aggregate state for one `(key, time)` cell and the bucket that holds them.
//!
//! A `MultiItem` is the unit of aggregation: an unlabeled `tail` plus a
//! bounded string-top of labeled sub-aggregates. Excess top entries fold into
//! the tail when the item is finalized for encoding.

pub mod digest;
pub mod sampler;
pub mod unique;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::format::MAX_TAGS;

use self::digest::CentroidDigest;
use self::unique::UniqueSketch;

/// How far behind the shard clock a client timestamp is believed before it
/// is clamped. Multiple of 60 so clamped timestamps stay aligned for every
/// resolution.
pub const BELIEVE_TIMESTAMP_WINDOW: u32 = 60;

/// Compression parameter for percentile digests built on the agent.
pub const AGENT_PERCENTILE_COMPRESSION: f64 = 40.0;

/// Flat part of the aggregator insert budget, independent of contributors.
pub const INSERT_BUDGET_FIXED: i64 = 50_000;

/// Buckets older than this never leave the historic conveyor; they are
/// dropped and counted instead.
pub const MAX_HISTORIC_WINDOW: u32 = 86_400;

/// Default per-contributor insert budget in bytes.
pub const DEFAULT_INSERT_BUDGET: i64 = 350;

/// Default bound on labeled string-top entries per item during collection.
pub const DEFAULT_STRING_TOP_CAPACITY: usize = 100;

/// Default string-top entries surviving finalization into the insert.
pub const DEFAULT_STRING_TOP_COUNT_INSERT: usize = 20;

/// Fixed-width metric key: metric id, per-second timestamp, 16 tag slots.
/// Negative metric ids denote built-in self metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Key {
    pub metric: i32,
    pub timestamp: u32,
    pub tags: [i32; MAX_TAGS],
}

impl Key {
    pub fn new(metric: i32, tags: [i32; MAX_TAGS]) -> Self {
        Self {
            metric,
            timestamp: 0,
            tags,
        }
    }

    pub fn at(timestamp: u32, metric: i32, tags: [i32; MAX_TAGS]) -> Self {
        Self {
            metric,
            timestamp,
            tags,
        }
    }

    /// Identity hash over metric and tags, excluding the timestamp, so one
    /// series lands on one shard regardless of bucket time.
    pub fn hash64(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.metric.hash(&mut h);
        self.tags.hash(&mut h);
        h.finish()
    }
}

/// Scalar aggregate cell. Counter-only cells keep `value_set == false`;
/// synthetic aggregates are produced at encode time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ItemValue {
    pub counter: f64,
    pub value_set: bool,
    pub value_min: f64,
    pub value_max: f64,
    pub value_sum: f64,
    pub value_sum_square: f64,
    /// Host that produced the current min / max / heaviest counter share.
    pub min_host_tag: i32,
    pub max_host_tag: i32,
    pub max_counter_host_tag: i32,
}

impl ItemValue {
    /// Single-observation cell: `count` events of `value` from one host.
    pub fn simple(value: f64, count: f64, host_tag: i32) -> Self {
        let mut v = Self::default();
        v.add_value_counter_host(value, count, host_tag);
        v
    }

    pub fn add_value(&mut self, value: f64) {
        self.add_value_counter_host(value, 1.0, 0);
    }

    pub fn add_counter_host(&mut self, count: f64, host_tag: i32) {
        self.counter += count;
        if count > self.counter / 2.0 {
            self.max_counter_host_tag = host_tag;
        }
    }

    pub fn add_value_counter_host(&mut self, value: f64, count: f64, host_tag: i32) {
        self.counter += count;
        if !self.value_set || value < self.value_min {
            self.value_min = value;
            self.min_host_tag = host_tag;
        }
        if !self.value_set || value > self.value_max {
            self.value_max = value;
            self.max_host_tag = host_tag;
        }
        self.value_sum += value * count;
        self.value_sum_square += value * value * count;
        if count > self.counter / 2.0 {
            self.max_counter_host_tag = host_tag;
        }
        self.value_set = true;
    }

    pub fn add_value_array_host(&mut self, values: &[f64], mult: f64, host_tag: i32) {
        for &v in values {
            self.add_value_counter_host(v, mult, host_tag);
        }
    }

    pub fn merge(&mut self, other: &ItemValue) {
        self.counter += other.counter;
        if other.counter > self.counter / 2.0 {
            self.max_counter_host_tag = other.max_counter_host_tag;
        }
        if !other.value_set {
            return;
        }
        if !self.value_set || other.value_min < self.value_min {
            self.value_min = other.value_min;
            self.min_host_tag = other.min_host_tag;
        }
        if !self.value_set || other.value_max > self.value_max {
            self.value_max = other.value_max;
            self.max_host_tag = other.max_host_tag;
        }
        self.value_sum += other.value_sum;
        self.value_sum_square += other.value_sum_square;
        self.value_set = true;
    }
}

/// Aggregate cell plus the optional sketches a metric may declare: a
/// centroid digest for percentile metrics, a unique-hash sketch for
/// unique-value metrics.
#[derive(Debug, Clone, Default)]
pub struct MultiValue {
    pub value: ItemValue,
    pub percentiles: Option<Box<CentroidDigest>>,
    pub uniques: UniqueSketch,
}

impl MultiValue {
    pub fn is_empty(&self) -> bool {
        self.value.counter <= 0.0
    }

    pub fn add_counter_host(&mut self, count: f64, host_tag: i32) {
        self.value.add_counter_host(count, host_tag);
    }

    pub fn add_value_counter_host(&mut self, value: f64, count: f64, host_tag: i32) {
        self.value.add_value_counter_host(value, count, host_tag);
    }

    pub fn add_value_counter_host_percentile(
        &mut self,
        value: f64,
        count: f64,
        host_tag: i32,
        compression: f64,
    ) {
        self.value.add_value_counter_host(value, count, host_tag);
        self.digest(compression).add(value, count);
    }

    pub fn add_value_array_host(&mut self, values: &[f64], mult: f64, host_tag: i32) {
        self.value.add_value_array_host(values, mult, host_tag);
    }

    pub fn add_value_array_host_percentile(
        &mut self,
        values: &[f64],
        mult: f64,
        host_tag: i32,
        compression: f64,
    ) {
        self.value.add_value_array_host(values, mult, host_tag);
        let digest = self.digest(compression);
        for &v in values {
            digest.add(v, mult);
        }
    }

    /// Client value batch: `count` is the client-side total (0 means the
    /// array length), spread evenly over the supplied values.
    pub fn apply_values(
        &mut self,
        values: &[f64],
        count: f64,
        host_tag: i32,
        compression: f64,
        has_percentiles: bool,
    ) {
        if values.is_empty() {
            return;
        }
        let total = if count != 0.0 {
            count
        } else {
            values.len() as f64
        };
        let mult = total / values.len() as f64;
        if has_percentiles {
            self.add_value_array_host_percentile(values, mult, host_tag, compression);
        } else {
            self.add_value_array_host(values, mult, host_tag);
        }
    }

    /// Unique-value batch: hashes feed the sketch, `count` (0 means the
    /// array length) feeds the counter.
    pub fn apply_unique(&mut self, hashes: &[i64], count: f64, host_tag: i32) {
        let total = if count != 0.0 {
            count
        } else {
            hashes.len() as f64
        };
        self.value.add_counter_host(total, host_tag);
        self.uniques.insert_all(hashes);
    }

    pub fn merge(&mut self, other: &MultiValue) {
        self.value.merge(&other.value);
        if let Some(other_digest) = &other.percentiles {
            self.digest(AGENT_PERCENTILE_COMPRESSION).merge(other_digest);
        }
        self.uniques.merge(&other.uniques);
    }

    fn digest(&mut self, compression: f64) -> &mut CentroidDigest {
        self.percentiles
            .get_or_insert_with(|| Box::new(CentroidDigest::new(compression)))
    }
}

/// One `(key, time)` cell: the unlabeled tail plus labeled string-top
/// sub-aggregates, bounded by the collection capacity.
#[derive(Debug, Clone)]
pub struct MultiItem {
    pub tail: MultiValue,
    pub top: HashMap<String, MultiValue>,
    capacity: usize,
}

impl MultiItem {
    pub fn new(capacity: usize) -> Self {
        Self {
            tail: MultiValue::default(),
            top: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Selects the sub-aggregate for a string label.
    ///
    /// Empty labels go to the tail. A new label is admitted while capacity
    /// remains; once full, it must outweigh the weakest member's counter to
    /// dislodge it (the evicted member folds into the tail), otherwise the
    /// write lands in the tail.
    pub fn map_string_top(&mut self, s: &str, weight: f64) -> &mut MultiValue {
        if s.is_empty() {
            return &mut self.tail;
        }
        if !self.top.contains_key(s) {
            if self.top.len() >= self.capacity {
                let weakest = self
                    .top
                    .iter()
                    .min_by(|a, b| {
                        a.1.value
                            .counter
                            .partial_cmp(&b.1.value.counter)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(k, v)| (k.clone(), v.value.counter));
                match weakest {
                    Some((weak_key, weak_counter)) if weight > weak_counter => {
                        if let Some(evicted) = self.top.remove(&weak_key) {
                            self.tail.merge(&evicted);
                        }
                    }
                    _ => return &mut self.tail,
                }
            }
            self.top.insert(s.to_string(), MultiValue::default());
        }
        self.top.get_mut(s).expect("entry just ensured")
    }

    /// Finalizes the string-top down to the `keep` heaviest entries by
    /// counter, folding every discarded entry (value, digest, sketch) into
    /// the tail. Returns the whale weight: the largest top counter before
    /// folding, 0 when the top is empty.
    pub fn finish_string_top(&mut self, keep: usize) -> f64 {
        let whale_weight = self
            .top
            .values()
            .map(|v| v.value.counter)
            .fold(0.0, f64::max);
        if self.top.len() > keep {
            let mut entries: Vec<(String, MultiValue)> = self.top.drain().collect();
            entries.sort_by(|a, b| {
                b.1.value
                    .counter
                    .partial_cmp(&a.1.value.counter)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for (_, folded) in entries.split_off(keep) {
                self.tail.merge(&folded);
            }
            self.top = entries.into_iter().collect();
        }
        whale_weight
    }

    /// Folds another item into this one: tails merge, top entries go
    /// through normal string-top admission.
    pub fn merge_from(&mut self, other: &MultiItem) {
        self.tail.merge(&other.tail);
        for (skey, value) in &other.top {
            self.map_string_top(skey, value.value.counter).merge(value);
        }
    }

    /// Byte estimate of this item's encoded rows, used by the sampler.
    pub fn row_binary_size_estimate(&self) -> usize {
        let mut size = 0;
        if !self.tail.is_empty() {
            size += Self::value_size_estimate(&self.tail, 0);
        }
        for (skey, v) in &self.top {
            size += Self::value_size_estimate(v, skey.len());
        }
        size
    }

    fn value_size_estimate(v: &MultiValue, skey_len: usize) -> usize {
        // keys block + five aggregates + skey + sketch payloads + arg states.
        let keys = 4 + 4 + 1 + 4 + 4 * MAX_TAGS;
        let mut size = keys + 5 * 8 + 1 + skey_len + 2 * 10;
        if let Some(digest) = &v.percentiles {
            size += 8 * digest.point_count();
        }
        size += 8 * v.uniques.stored_count();
        size
    }
}

/// One second (or one resolution interval) of aggregated state.
#[derive(Debug, Clone)]
pub struct MetricsBucket {
    pub time: u32,
    pub multi_items: HashMap<Key, MultiItem>,
}

impl MetricsBucket {
    pub fn new(time: u32) -> Self {
        Self {
            time,
            multi_items: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.multi_items.is_empty()
    }

    /// Looks up or inserts the item for `key` with the given string-top
    /// collection capacity.
    pub fn map_key_item(&mut self, key: Key, string_top_capacity: usize) -> &mut MultiItem {
        self.multi_items
            .entry(key)
            .or_insert_with(|| MultiItem::new(string_top_capacity))
    }

    /// Recycles the bucket in place for a new interval.
    pub fn reset(&mut self, time: u32) {
        self.time = time;
        self.multi_items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_only_cell() {
        let mut v = ItemValue::default();
        v.add_counter_host(3.0, 7);
        assert_eq!(v.counter, 3.0);
        assert!(!v.value_set);
        assert_eq!(v.max_counter_host_tag, 7);
        assert_eq!(v.value_min, 0.0);
        assert_eq!(v.value_max, 0.0);
    }

    #[test]
    fn test_value_cell_min_max_hosts() {
        let mut v = ItemValue::default();
        v.add_value_counter_host(5.0, 1.0, 10);
        v.add_value_counter_host(2.0, 1.0, 11);
        v.add_value_counter_host(9.0, 1.0, 12);
        assert!(v.value_set);
        assert_eq!(v.value_min, 2.0);
        assert_eq!(v.min_host_tag, 11);
        assert_eq!(v.value_max, 9.0);
        assert_eq!(v.max_host_tag, 12);
        assert_eq!(v.counter, 3.0);
        assert_eq!(v.value_sum, 16.0);
        assert_eq!(v.value_sum_square, 25.0 + 4.0 + 81.0);
        assert!(v.value_min <= v.value_max);
    }

    #[test]
    fn test_value_weighting() {
        let mut v = ItemValue::default();
        v.add_value_counter_host(4.0, 3.0, 0);
        assert_eq!(v.counter, 3.0);
        assert_eq!(v.value_sum, 12.0);
        assert_eq!(v.value_sum_square, 48.0);
    }

    #[test]
    fn test_merge_counter_into_values() {
        let mut a = ItemValue::simple(10.0, 2.0, 1);
        let b = ItemValue {
            counter: 5.0,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.counter, 7.0);
        assert!(a.value_set);
        assert_eq!(a.value_min, 10.0);

        let mut c = ItemValue::default();
        c.merge(&a);
        assert_eq!(c.counter, 7.0);
        assert_eq!(c.value_min, 10.0);
        assert_eq!(c.value_max, 10.0);
    }

    #[test]
    fn test_apply_values_spreads_count() {
        let mut mv = MultiValue::default();
        mv.apply_values(&[1.0, 2.0, 3.0], 6.0, 0, AGENT_PERCENTILE_COMPRESSION, false);
        assert_eq!(mv.value.counter, 6.0);
        assert_eq!(mv.value.value_sum, 2.0 * (1.0 + 2.0 + 3.0));
        assert!(mv.percentiles.is_none());

        let mut mp = MultiValue::default();
        mp.apply_values(&[1.0, 2.0], 0.0, 0, AGENT_PERCENTILE_COMPRESSION, true);
        assert_eq!(mp.value.counter, 2.0);
        let digest = mp.percentiles.as_mut().expect("digest created");
        assert_eq!(digest.count(), 2.0);
    }

    #[test]
    fn test_apply_unique() {
        let mut mv = MultiValue::default();
        mv.apply_unique(&[1, 2, 3, 3], 0.0, 5);
        assert_eq!(mv.value.counter, 4.0);
        assert_eq!(mv.uniques.estimate(), 3.0);
        assert!(!mv.value.value_set);
    }

    #[test]
    fn test_string_top_admission_and_dislodge() {
        let mut item = MultiItem::new(2);
        item.map_string_top("a", 1.0).add_counter_host(1.0, 0);
        item.map_string_top("b", 5.0).add_counter_host(5.0, 0);
        assert_eq!(item.top.len(), 2);

        // Not heavy enough to dislodge: lands in tail.
        item.map_string_top("c", 0.5).add_counter_host(0.5, 0);
        assert_eq!(item.top.len(), 2);
        assert_eq!(item.tail.value.counter, 0.5);
        assert!(!item.top.contains_key("c"));

        // Heavy enough: evicts "a" (counter 1.0) into the tail.
        item.map_string_top("d", 3.0).add_counter_host(3.0, 0);
        assert_eq!(item.top.len(), 2);
        assert!(item.top.contains_key("d"));
        assert!(!item.top.contains_key("a"));
        assert_eq!(item.tail.value.counter, 1.5);
    }

    #[test]
    fn test_finish_string_top_folds_and_preserves_sum() {
        let mut item = MultiItem::new(10);
        for (s, c) in [("a", 10.0), ("b", 9.0), ("c", 8.0), ("d", 7.0), ("e", 6.0)] {
            item.map_string_top(s, c).add_counter_host(c, 0);
        }
        let whale = item.finish_string_top(3);
        assert_eq!(whale, 10.0);
        assert_eq!(item.top.len(), 3);
        let mut kept: Vec<f64> = item.top.values().map(|v| v.value.counter).collect();
        kept.sort_by(|a, b| b.partial_cmp(a).expect("finite"));
        assert_eq!(kept, vec![10.0, 9.0, 8.0]);
        assert_eq!(item.tail.value.counter, 13.0);

        let total: f64 =
            item.tail.value.counter + item.top.values().map(|v| v.value.counter).sum::<f64>();
        assert_eq!(total, 40.0);
    }

    #[test]
    fn test_finish_string_top_empty_returns_zero() {
        let mut item = MultiItem::new(4);
        item.tail.add_counter_host(2.0, 0);
        assert_eq!(item.finish_string_top(2), 0.0);
    }

    #[test]
    fn test_key_hash_ignores_timestamp() {
        let mut tags = [0i32; MAX_TAGS];
        tags[0] = 1;
        let a = Key::at(100, 42, tags);
        let b = Key::at(900, 42, tags);
        assert_eq!(a.hash64(), b.hash64());
        let c = Key::at(100, 43, tags);
        assert_ne!(a.hash64(), c.hash64());
    }

    #[test]
    fn test_bucket_reset_recycles() {
        let mut bucket = MetricsBucket::new(100);
        bucket
            .map_key_item(Key::new(1, [0; MAX_TAGS]), 4)
            .tail
            .add_counter_host(1.0, 0);
        assert!(!bucket.is_empty());
        bucket.reset(105);
        assert_eq!(bucket.time, 105);
        assert!(bucket.is_empty());
    }
}
