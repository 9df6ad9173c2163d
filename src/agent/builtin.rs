//! Built-in self metrics: heartbeat, process CPU/memory usage, and metric
//! journal version, injected into the shard lattice each second before time
//! advance so they land in the closing bucket.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::data_model::{ItemValue, Key, MetricsBucket};
use crate::format::{
    MetaProvider, BUILTIN_METRIC_ID_HEARTBEAT_ARGS, BUILTIN_METRIC_ID_HEARTBEAT_VERSION,
    BUILTIN_METRIC_ID_JOURNAL_VERSIONS, BUILTIN_METRIC_ID_USAGE_CPU,
    BUILTIN_METRIC_ID_USAGE_MEMORY, MAX_TAGS, TAG_VALUE_ID_CPU_USAGE_SYS,
    TAG_VALUE_ID_CPU_USAGE_USER, TAG_VALUE_ID_HEARTBEAT_EVENT_HEARTBEAT,
    TAG_VALUE_ID_HEARTBEAT_EVENT_START,
};

use super::shard::ShardInner;

/// Shared aggregate cell a producer can update without taking the shard
/// lock; the injector drains it into the resolution-1 bucket each second.
pub struct BuiltInItemValue {
    key: Key,
    value: Mutex<ItemValue>,
}

impl BuiltInItemValue {
    pub(crate) fn new(key: Key) -> Self {
        Self {
            key,
            value: Mutex::new(ItemValue::default()),
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub(crate) fn lock_value(&self) -> MutexGuard<'_, ItemValue> {
        self.value.lock()
    }

    pub fn add_counter(&self, count: f64) {
        self.value.lock().add_counter_host(count, 0);
    }

    pub fn add_value_counter(&self, value: f64, count: f64) {
        self.value.lock().add_value_counter_host(value, count, 0);
    }

    /// Replaces the cell contents with a single observation.
    pub fn set_value_counter(&self, value: f64, count: f64) {
        *self.value.lock() = ItemValue::simple(value, count, 0);
    }
}

/// Emits heartbeat and usage self metrics; lives on shard 0 and runs under
/// the shard lock.
pub struct BuiltinInjector {
    meta: Arc<dyn MetaProvider>,
    component_tag: i32,
    start_timestamp: u32,
    version: String,
    args: String,
    args_hash: i32,
    args_len: i32,
    /// Slot inside the 60-second lattice row receiving this agent's
    /// heartbeat rows, randomized per agent.
    heartbeat_second_bucket: usize,
    heartbeat_event_type: i32,
    current_journal_version: i64,
    current_journal_hash: String,
    current_journal_hash_tag: i32,
    /// Seconds the hash stayed unchanged without being emitted; flushing one
    /// aggregated row instead of 60 saves most of the journal traffic.
    current_journal_hash_seconds: f64,
    prev_user_ns: i64,
    prev_sys_ns: i64,
}

impl BuiltinInjector {
    pub fn new(
        meta: Arc<dyn MetaProvider>,
        component_tag: i32,
        start_timestamp: u32,
        version: String,
        args: String,
        heartbeat_second_bucket: usize,
    ) -> Self {
        let (prev_user_ns, prev_sys_ns) = cpu_times_ns();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        args.hash(&mut hasher);
        let args_hash = hasher.finish() as i32;
        let args_len = args.len() as i32;
        Self {
            meta,
            component_tag,
            start_timestamp,
            version,
            args,
            args_hash,
            args_len,
            heartbeat_second_bucket: heartbeat_second_bucket % 60,
            heartbeat_event_type: TAG_VALUE_ID_HEARTBEAT_EVENT_START,
            current_journal_version: 0,
            current_journal_hash: String::new(),
            current_journal_hash_tag: 0,
            current_journal_hash_seconds: 0.0,
            prev_user_ns,
            prev_sys_ns,
        }
    }

    pub(crate) fn run(&mut self, inner: &mut ShardInner, now_unix: u32) {
        let capacity = inner.string_top_capacity;

        if self.heartbeat_event_type != TAG_VALUE_ID_HEARTBEAT_EVENT_HEARTBEAT {
            // Send the start event immediately, then switch to heartbeats.
            self.write_heartbeats(&mut inner.current_buckets[1][0], capacity, now_unix, 1.0);
            self.heartbeat_event_type = TAG_VALUE_ID_HEARTBEAT_EVENT_HEARTBEAT;
        }

        let journal_version = self.meta.journal_version();
        let journal_hash = self.meta.journal_state_hash();
        if journal_hash != self.current_journal_hash {
            if self.current_journal_hash_seconds != 0.0 {
                let pending = (
                    self.current_journal_version,
                    self.current_journal_hash.clone(),
                    self.current_journal_hash_tag,
                    self.current_journal_hash_seconds,
                );
                self.write_journal_version(
                    &mut inner.current_buckets[1][0],
                    capacity,
                    pending.0,
                    &pending.1,
                    pending.2,
                    pending.3,
                );
                self.current_journal_hash_seconds = 0.0;
            }
            self.current_journal_version = journal_version;
            self.current_journal_hash_tag = journal_hash_tag(&journal_hash);
            self.current_journal_hash = journal_hash;
            let row = (
                self.current_journal_version,
                self.current_journal_hash.clone(),
                self.current_journal_hash_tag,
            );
            self.write_journal_version(
                &mut inner.current_buckets[1][0],
                capacity,
                row.0,
                &row.1,
                row.2,
                1.0,
            );
        } else {
            self.current_journal_hash_seconds += 1.0;
        }

        // Per-second CPU usage deltas ride in the 60-second row so every
        // agent contributes exactly one minute-worth of points per minute.
        let (user_ns, sys_ns) = cpu_times_ns();
        let user = (user_ns - self.prev_user_ns) as f64 / 1e9;
        let sys = (sys_ns - self.prev_sys_ns) as f64 / 1e9;
        self.prev_user_ns = user_ns;
        self.prev_sys_ns = sys_ns;

        let hb_bucket = &mut inner.current_buckets[60][self.heartbeat_second_bucket];
        let mut tags = [0i32; MAX_TAGS];
        tags[1] = self.component_tag;
        tags[2] = TAG_VALUE_ID_CPU_USAGE_USER;
        let key = Key::at(hb_bucket.time, BUILTIN_METRIC_ID_USAGE_CPU, tags);
        hb_bucket
            .map_key_item(key, capacity)
            .tail
            .add_value_counter_host(user, 1.0, 0);
        tags[2] = TAG_VALUE_ID_CPU_USAGE_SYS;
        let key = Key::at(hb_bucket.time, BUILTIN_METRIC_ID_USAGE_CPU, tags);
        hb_bucket
            .map_key_item(key, capacity)
            .tail
            .add_value_counter_host(sys, 1.0, 0);

        if now_unix % 60 != 0 {
            return;
        }

        // Minute mark: flush the aggregated journal row and the once-per-
        // minute usage and heartbeat rows.
        if self.current_journal_hash_seconds != 0.0 {
            let pending = (
                self.current_journal_version,
                self.current_journal_hash.clone(),
                self.current_journal_hash_tag,
                self.current_journal_hash_seconds,
            );
            self.write_journal_version(
                &mut inner.current_buckets[1][0],
                capacity,
                pending.0,
                &pending.1,
                pending.2,
                pending.3,
            );
            self.current_journal_hash_seconds = 0.0;
        }

        let rss = read_rss_bytes();
        let hb_bucket = &mut inner.current_buckets[60][self.heartbeat_second_bucket];
        let mut tags = [0i32; MAX_TAGS];
        tags[1] = self.component_tag;
        let key = Key::at(hb_bucket.time, BUILTIN_METRIC_ID_USAGE_MEMORY, tags);
        hb_bucket
            .map_key_item(key, capacity)
            .tail
            .add_value_counter_host(rss, 60.0, 0);

        let hb = self.heartbeat_second_bucket;
        self.write_heartbeats(&mut inner.current_buckets[60][hb], capacity, now_unix, 60.0);
    }

    fn write_heartbeats(
        &self,
        bucket: &mut MetricsBucket,
        capacity: usize,
        now_unix: u32,
        count: f64,
    ) {
        let uptime = f64::from(now_unix.saturating_sub(self.start_timestamp));

        let mut tags = [0i32; MAX_TAGS];
        tags[1] = self.component_tag;
        tags[2] = self.heartbeat_event_type;
        let key = Key::at(bucket.time, BUILTIN_METRIC_ID_HEARTBEAT_VERSION, tags);
        bucket
            .map_key_item(key, capacity)
            .map_string_top(&self.version, count)
            .add_value_counter_host(uptime, count, 0);

        let mut tags = [0i32; MAX_TAGS];
        tags[1] = self.component_tag;
        tags[2] = self.heartbeat_event_type;
        tags[3] = self.args_hash;
        tags[9] = self.args_len;
        let key = Key::at(bucket.time, BUILTIN_METRIC_ID_HEARTBEAT_ARGS, tags);
        bucket
            .map_key_item(key, capacity)
            .map_string_top(&self.args, count)
            .add_value_counter_host(uptime, count, 0);
    }

    fn write_journal_version(
        &self,
        bucket: &mut MetricsBucket,
        capacity: usize,
        version: i64,
        hash: &str,
        hash_tag: i32,
        count: f64,
    ) {
        let mut tags = [0i32; MAX_TAGS];
        tags[1] = self.component_tag;
        tags[5] = version as i32;
        tags[6] = hash_tag;
        let key = Key::at(bucket.time, BUILTIN_METRIC_ID_JOURNAL_VERSIONS, tags);
        bucket
            .map_key_item(key, capacity)
            .map_string_top(hash, count)
            .add_counter_host(count, 0);
    }
}

/// First four bytes of the hex-decoded journal hash as a big-endian i32
/// tag; 0 when the hash is too short or not hex.
pub fn journal_hash_tag(hash: &str) -> i32 {
    let bytes = hash.as_bytes();
    if bytes.len() < 8 {
        return 0;
    }
    let mut out = [0u8; 4];
    for (i, chunk) in bytes[..8].chunks_exact(2).enumerate() {
        match (hex_nibble(chunk[0]), hex_nibble(chunk[1])) {
            (Some(hi), Some(lo)) => out[i] = (hi << 4) | lo,
            _ => return 0,
        }
    }
    i32::from_be_bytes(out)
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Process user/system CPU time in nanoseconds since start.
fn cpu_times_ns() -> (i64, i64) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: getrusage writes into the supplied struct and has no other
    // requirements beyond a valid pointer.
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
        return (0, 0);
    }
    (timeval_ns(usage.ru_utime), timeval_ns(usage.ru_stime))
}

fn timeval_ns(tv: libc::timeval) -> i64 {
    tv.tv_sec as i64 * 1_000_000_000 + tv.tv_usec as i64 * 1_000
}

/// Resident set size in bytes from /proc/self/statm, 0 when unreadable.
fn read_rss_bytes() -> f64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0.0;
    };
    let Some(rss_pages) = statm
        .split_whitespace()
        .nth(1)
        .and_then(|f| f.parse::<u64>().ok())
    else {
        return 0.0;
    };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if page_size > 0 { page_size as u64 } else { 4096 };
    (rss_pages * page_size) as f64
}
