//! Per-shard time-window lattice and the fan-in ingest API.
//!
//! A shard owns a `{resolution × resolution-shard}` lattice of currently
//! filling buckets plus the following interval, a 60-slot future queue of
//! closed buckets, and the preprocessing hand-off consumed by the shard's
//! compression thread. One mutex serializes the whole ingest path; per-key
//! program order is preserved by construction.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::data_model::{
    ItemValue, Key, MetricsBucket, AGENT_PERCENTILE_COMPRESSION, BELIEVE_TIMESTAMP_WINDOW,
};
use crate::format::{hardware_metric, MetricMeta, ALLOWED_RESOLUTIONS};

use super::builtin::{BuiltInItemValue, BuiltinInjector};

/// Lattice rows are indexed by resolution; 60 is the largest allowed.
pub const MAX_RESOLUTION: usize = 60;

/// Resolves the target `(resolution, resolution_shard)` for a key and rounds
/// the key timestamp onto the resolution grid.
///
/// Metrics without metadata collect at one-second resolution; hardware
/// metrics follow the atomically-published hardware resolution instead of
/// their own metadata.
pub fn route_resolution(
    key: &mut Key,
    key_hash: u64,
    meta: Option<&MetricMeta>,
    hardware_resolution: u32,
) -> (u32, usize) {
    let mut resolution = 1u32;
    if let Some(meta) = meta {
        resolution = if hardware_metric(meta.metric_id) {
            hardware_resolution
        } else {
            meta.effective_resolution
        };
    }
    if !ALLOWED_RESOLUTIONS.contains(&resolution) {
        resolution = 1;
    }
    let mut resolution_shard = 0usize;
    if resolution > 1 {
        key.timestamp = key.timestamp / resolution * resolution;
        // trunc([0..1) * resolution) in 32.32 fixed point, avoiding modulo.
        resolution_shard = ((key_hash & 0xFFFF_FFFF) * u64::from(resolution) >> 32) as usize;
    }
    (resolution, resolution_shard)
}

pub(crate) struct ShardInner {
    pub(crate) string_top_capacity: usize,
    /// `[resolution][resolution_shard]`; disallowed resolutions stay empty.
    pub(crate) current_buckets: [Vec<MetricsBucket>; MAX_RESOLUTION + 1],
    pub(crate) next_buckets: [Vec<MetricsBucket>; MAX_RESOLUTION + 1],
    /// Closed buckets awaiting their ship second, keyed by that second
    /// modulo 60.
    future_queue: [Vec<MetricsBucket>; 60],
    builtin_item_values: Vec<Arc<BuiltInItemValue>>,
    /// Heartbeat emitter, present on shard 0 only.
    pub(crate) injector: Option<BuiltinInjector>,
    preprocessing_bucket_time: u32,
    preprocessing_buckets: Vec<MetricsBucket>,
    stopped: bool,
}

impl ShardInner {
    /// Routes a key to its target bucket, reconciling the client timestamp
    /// against the shard clock. Never rejects: stale timestamps clamp to the
    /// believe window, future timestamps ride in the next bucket and are
    /// clamped on the aggregator.
    fn route(
        &mut self,
        key: &mut Key,
        key_hash: u64,
        meta: Option<&MetricMeta>,
        hardware_resolution: u32,
    ) -> &mut MetricsBucket {
        let (resolution, shard) = route_resolution(key, key_hash, meta, hardware_resolution);
        let res = resolution as usize;
        let current_time = self.current_buckets[res][shard].time;
        if key.timestamp == 0 {
            // Built-in producers without explicit timestamps mean "now".
            key.timestamp = current_time;
            return &mut self.current_buckets[res][shard];
        }
        if key.timestamp <= current_time {
            if current_time > BELIEVE_TIMESTAMP_WINDOW
                && key.timestamp < current_time - BELIEVE_TIMESTAMP_WINDOW
            {
                // The window is a multiple of 60, so the clamped timestamp
                // stays aligned for every resolution.
                key.timestamp = current_time - BELIEVE_TIMESTAMP_WINDOW;
            }
            return &mut self.current_buckets[res][shard];
        }
        // Our clock may lag a client with correct timestamps; the aggregator
        // clamps on receive.
        &mut self.next_buckets[res][shard]
    }

    fn run_builtins(&mut self, now_unix: u32) {
        let capacity = self.string_top_capacity;
        let bucket = &mut self.current_buckets[1][0];
        let cells = std::mem::take(&mut self.builtin_item_values);
        for cell in &cells {
            let mut value = cell.lock_value();
            if value.counter > 0.0 {
                let mut key = cell.key();
                if key.timestamp == 0 {
                    key.timestamp = bucket.time;
                }
                bucket.map_key_item(key, capacity).tail.value.merge(&value);
                *value = ItemValue::default();
            }
        }
        self.builtin_item_values = cells;

        if let Some(mut injector) = self.injector.take() {
            injector.run(self, now_unix);
            self.injector = Some(injector);
        }
    }
}

/// Independently locked partition of the agent's in-memory state.
pub struct Shard {
    pub shard_num: usize,
    pub shard_key: i32,
    /// Random offset inside the second, spreading sends across agents.
    pub time_spread_delta: Duration,
    hardware_metric_resolution: Arc<AtomicU32>,
    mu: Mutex<ShardInner>,
    preprocess_cond: Condvar,
    /// Reuse pool for splitting unique hashes across shards.
    unique_value_pool: Mutex<Vec<Vec<Vec<i64>>>>,
    pub historic_out_of_window_dropped: AtomicI64,
    dropped_after_stop: AtomicU64,
}

impl Shard {
    pub fn new(
        shard_num: usize,
        shard_key: i32,
        start_time: u32,
        string_top_capacity: usize,
        hardware_metric_resolution: Arc<AtomicU32>,
        time_spread_delta: Duration,
        injector: Option<BuiltinInjector>,
    ) -> Self {
        let mut current_buckets: [Vec<MetricsBucket>; MAX_RESOLUTION + 1] =
            std::array::from_fn(|_| Vec::new());
        let mut next_buckets: [Vec<MetricsBucket>; MAX_RESOLUTION + 1] =
            std::array::from_fn(|_| Vec::new());
        for &r in &ALLOWED_RESOLUTIONS {
            let res = r as usize;
            let aligned = start_time / r * r;
            current_buckets[res] = (0..res).map(|_| MetricsBucket::new(aligned)).collect();
            next_buckets[res] = (0..res).map(|_| MetricsBucket::new(aligned + r)).collect();
        }
        Self {
            shard_num,
            shard_key,
            time_spread_delta,
            hardware_metric_resolution,
            mu: Mutex::new(ShardInner {
                string_top_capacity,
                current_buckets,
                next_buckets,
                future_queue: std::array::from_fn(|_| Vec::new()),
                builtin_item_values: Vec::new(),
                injector,
                preprocessing_bucket_time: 0,
                preprocessing_buckets: Vec::new(),
                stopped: false,
            }),
            preprocess_cond: Condvar::new(),
            unique_value_pool: Mutex::new(Vec::new()),
            historic_out_of_window_dropped: AtomicI64::new(0),
            dropped_after_stop: AtomicU64::new(0),
        }
    }

    /// Registers a shared built-in cell, flushed into the shard's
    /// resolution-1 bucket every second.
    pub fn create_builtin(&self, key: Key) -> Arc<BuiltInItemValue> {
        let cell = Arc::new(BuiltInItemValue::new(key));
        self.mu.lock().builtin_item_values.push(Arc::clone(&cell));
        cell
    }

    // --- Ingest API; every call serializes on the shard mutex. ---

    pub fn apply_unique(
        &self,
        key: Key,
        key_hash: u64,
        str_key: &str,
        hashes: &[i64],
        count: f64,
        host_tag: i32,
        meta: Option<&MetricMeta>,
    ) {
        let total = if count != 0.0 {
            count
        } else {
            hashes.len() as f64
        };
        self.ingest(key, key_hash, meta, |item| {
            item.map_string_top(str_key, total)
                .apply_unique(hashes, count, host_tag);
        });
    }

    pub fn apply_values(
        &self,
        key: Key,
        key_hash: u64,
        str_key: &str,
        values: &[f64],
        count: f64,
        host_tag: i32,
        meta: Option<&MetricMeta>,
    ) {
        let total = if count != 0.0 {
            count
        } else {
            values.len() as f64
        };
        let has_percentiles = meta.is_some_and(|m| m.has_percentiles);
        self.ingest(key, key_hash, meta, |item| {
            item.map_string_top(str_key, total).apply_values(
                values,
                count,
                host_tag,
                AGENT_PERCENTILE_COMPRESSION,
                has_percentiles,
            );
        });
    }

    pub fn apply_counter(
        &self,
        key: Key,
        key_hash: u64,
        str_key: &str,
        count: f64,
        host_tag: i32,
        meta: Option<&MetricMeta>,
    ) {
        self.ingest(key, key_hash, meta, |item| {
            item.map_string_top(str_key, count)
                .add_counter_host(count, host_tag);
        });
    }

    pub fn add_counter_host(
        &self,
        key: Key,
        key_hash: u64,
        count: f64,
        host_tag: i32,
        meta: Option<&MetricMeta>,
    ) {
        self.ingest(key, key_hash, meta, |item| {
            item.tail.add_counter_host(count, host_tag);
        });
    }

    pub fn add_counter_host_string(
        &self,
        key: Key,
        key_hash: u64,
        str_key: &str,
        count: f64,
        host_tag: i32,
        meta: Option<&MetricMeta>,
    ) {
        self.ingest(key, key_hash, meta, |item| {
            item.map_string_top(str_key, count)
                .add_counter_host(count, host_tag);
        });
    }

    pub fn add_value_counter_host(
        &self,
        key: Key,
        key_hash: u64,
        value: f64,
        count: f64,
        host_tag: i32,
        meta: Option<&MetricMeta>,
    ) {
        let has_percentiles = meta.is_some_and(|m| m.has_percentiles);
        self.ingest(key, key_hash, meta, |item| {
            if has_percentiles {
                item.tail.add_value_counter_host_percentile(
                    value,
                    count,
                    host_tag,
                    AGENT_PERCENTILE_COMPRESSION,
                );
            } else {
                item.tail.add_value_counter_host(value, count, host_tag);
            }
        });
    }

    pub fn add_value_counter_host_string(
        &self,
        key: Key,
        key_hash: u64,
        value: f64,
        count: f64,
        host_tag: i32,
        str_key: &str,
        meta: Option<&MetricMeta>,
    ) {
        self.ingest(key, key_hash, meta, |item| {
            item.map_string_top(str_key, count)
                .add_value_counter_host(value, count, host_tag);
        });
    }

    pub fn add_value_array_host(
        &self,
        key: Key,
        key_hash: u64,
        values: &[f64],
        mult: f64,
        host_tag: i32,
        meta: Option<&MetricMeta>,
    ) {
        let has_percentiles = meta.is_some_and(|m| m.has_percentiles);
        self.ingest(key, key_hash, meta, |item| {
            if has_percentiles {
                item.tail.add_value_array_host_percentile(
                    values,
                    mult,
                    host_tag,
                    AGENT_PERCENTILE_COMPRESSION,
                );
            } else {
                item.tail.add_value_array_host(values, mult, host_tag);
            }
        });
    }

    pub fn add_value_array_host_string(
        &self,
        key: Key,
        key_hash: u64,
        values: &[f64],
        mult: f64,
        host_tag: i32,
        str_key: &str,
        meta: Option<&MetricMeta>,
    ) {
        let count = values.len() as f64 * mult;
        let has_percentiles = meta.is_some_and(|m| m.has_percentiles);
        self.ingest(key, key_hash, meta, |item| {
            let target = item.map_string_top(str_key, count);
            if has_percentiles {
                target.add_value_array_host_percentile(
                    values,
                    mult,
                    host_tag,
                    AGENT_PERCENTILE_COMPRESSION,
                );
            } else {
                target.add_value_array_host(values, mult, host_tag);
            }
        });
    }

    pub fn add_unique_host_string(
        &self,
        key: Key,
        host_tag: i32,
        str_key: &str,
        key_hash: u64,
        hashes: &[i64],
        count: f64,
        meta: Option<&MetricMeta>,
    ) {
        self.ingest(key, key_hash, meta, |item| {
            item.map_string_top(str_key, count)
                .apply_unique(hashes, count, host_tag);
        });
    }

    pub fn merge_item_value(
        &self,
        key: Key,
        key_hash: u64,
        value: &ItemValue,
        meta: Option<&MetricMeta>,
    ) {
        self.ingest(key, key_hash, meta, |item| {
            item.tail.value.merge(value);
        });
    }

    fn ingest<F>(&self, mut key: Key, key_hash: u64, meta: Option<&MetricMeta>, apply: F)
    where
        F: FnOnce(&mut crate::data_model::MultiItem),
    {
        let hardware_resolution = self.hardware_metric_resolution.load(Ordering::Relaxed);
        let mut inner = self.mu.lock();
        if inner.stopped {
            self.dropped_after_stop.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let capacity = inner.string_top_capacity;
        let bucket = inner.route(&mut key, key_hash, meta, hardware_resolution);
        apply(bucket.map_key_item(key, capacity));
    }

    // --- Time advance ---

    /// Crosses wall-clock second `now_unix`: injects this second's built-ins,
    /// rotates every lattice row whose interval ends now, and hands the slot
    /// shipped this second to the preprocessor.
    pub fn advance_time(&self, now_unix: u32) {
        let mut inner = self.mu.lock();
        if inner.stopped {
            return;
        }
        inner.run_builtins(now_unix);

        for &r in &ALLOWED_RESOLUTIONS {
            if now_unix % r != 0 {
                continue;
            }
            let res = r as usize;
            for idx in 0..inner.current_buckets[res].len() {
                let next_time = inner.next_buckets[res][idx].time;
                let fresh = MetricsBucket::new(next_time + r);
                let next = std::mem::replace(&mut inner.next_buckets[res][idx], fresh);
                let closed = std::mem::replace(&mut inner.current_buckets[res][idx], next);
                // Resolution shard `idx` ships `idx` seconds from now,
                // spreading a low-resolution bucket over its whole interval.
                let slot = (now_unix as usize + idx) % 60;
                inner.future_queue[slot].push(closed);
            }
        }

        let ship_slot = (now_unix % 60) as usize;
        let shipped = std::mem::take(&mut inner.future_queue[ship_slot]);
        if !shipped.is_empty() {
            inner.preprocessing_bucket_time = now_unix.wrapping_sub(1);
            inner.preprocessing_buckets.extend(shipped);
            drop(inner);
            self.preprocess_cond.notify_one();
        }
    }

    /// Blocks until closed buckets are ready, returning `(second, buckets)`.
    /// Returns None once the shard is stopped and drained.
    pub fn wait_preprocessing(&self) -> Option<(u32, Vec<MetricsBucket>)> {
        let mut inner = self.mu.lock();
        loop {
            if !inner.preprocessing_buckets.is_empty() {
                let time = inner.preprocessing_bucket_time;
                return Some((time, std::mem::take(&mut inner.preprocessing_buckets)));
            }
            if inner.stopped {
                return None;
            }
            self.preprocess_cond.wait(&mut inner);
        }
    }

    /// Non-blocking variant of `wait_preprocessing` for tests and shutdown.
    pub fn take_preprocessing(&self) -> Option<(u32, Vec<MetricsBucket>)> {
        let mut inner = self.mu.lock();
        if inner.preprocessing_buckets.is_empty() {
            return None;
        }
        let time = inner.preprocessing_bucket_time;
        Some((time, std::mem::take(&mut inner.preprocessing_buckets)))
    }

    pub fn stop(&self) {
        self.mu.lock().stopped = true;
        self.preprocess_cond.notify_all();
    }

    pub fn dropped_after_stop(&self) -> u64 {
        self.dropped_after_stop.load(Ordering::Relaxed)
    }

    // --- Unique-hash scratch pool ---

    /// Borrows per-shard scratch buffers for splitting unique hashes;
    /// returned buffers are truncated, reallocated only when the shard
    /// count changes.
    pub fn get_unique_values_cache(&self, not_skipped_shards: usize) -> Vec<Vec<i64>> {
        let mut pool = self.unique_value_pool.lock();
        let mut buffers = pool.pop().unwrap_or_default();
        drop(pool);
        if buffers.len() != not_skipped_shards {
            buffers = vec![Vec::new(); not_skipped_shards];
        } else {
            for b in &mut buffers {
                b.clear();
            }
        }
        buffers
    }

    pub fn put_unique_values_cache(&self, buffers: Vec<Vec<i64>>) {
        self.unique_value_pool.lock().push(buffers);
    }

    // --- Introspection for tests and the agent assembly ---

    /// Runs `f` over the current bucket at `(resolution, resolution_shard)`.
    pub fn with_current_bucket<T>(
        &self,
        resolution: u32,
        resolution_shard: usize,
        f: impl FnOnce(&MetricsBucket) -> T,
    ) -> T {
        let inner = self.mu.lock();
        f(&inner.current_buckets[resolution as usize][resolution_shard])
    }

    /// Checks the lattice invariant: `current.time % R == 0` and
    /// `next.time == current.time + R` for every filled row.
    #[cfg(test)]
    fn assert_lattice_invariant(&self) {
        let inner = self.mu.lock();
        for &r in &ALLOWED_RESOLUTIONS {
            let res = r as usize;
            assert_eq!(inner.current_buckets[res].len(), res);
            for idx in 0..res {
                let current = &inner.current_buckets[res][idx];
                let next = &inner.next_buckets[res][idx];
                assert_eq!(current.time % r, 0, "resolution {r} shard {idx}");
                assert_eq!(next.time, current.time + r, "resolution {r} shard {idx}");
            }
        }
    }
}
