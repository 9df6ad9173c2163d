//! Metric identity space: built-in metric ids, tag value ids, and per-metric
//! metadata used by routing and the row encoder.
//!
//! Built-in (self) metrics carry negative ids; the wire format keeps the
//! signed bit pattern in the `metric` column.

use std::collections::HashMap;
use std::sync::Arc;

/// Number of fixed tag slots on every key.
pub const MAX_TAGS: usize = 16;

// --- Built-in metric ids ---

/// Per-producer ingestion outcome rows; charged to the metric in `tags[1]`.
pub const BUILTIN_METRIC_ID_INGESTION_STATUS: i32 = -11;
/// Synthetic 5-second-grid rows derived from built-in errors/warnings.
pub const BUILTIN_METRIC_ID_BADGES: i32 = -20;
pub const BUILTIN_METRIC_ID_JOURNAL_VERSIONS: i32 = -34;
pub const BUILTIN_METRIC_ID_HEARTBEAT_VERSION: i32 = -41;
pub const BUILTIN_METRIC_ID_HEARTBEAT_ARGS: i32 = -42;
pub const BUILTIN_METRIC_ID_USAGE_CPU: i32 = -45;
pub const BUILTIN_METRIC_ID_USAGE_MEMORY: i32 = -46;
pub const BUILTIN_METRIC_ID_AGENT_SAMPLING_FACTOR: i32 = -51;
pub const BUILTIN_METRIC_ID_AGG_SAMPLING_FACTOR: i32 = -52;
pub const BUILTIN_METRIC_ID_AGG_INSERT_SIZE: i32 = -53;
pub const BUILTIN_METRIC_ID_AGG_SAMPLING_SIZE_BYTES: i32 = -54;
pub const BUILTIN_METRIC_ID_AGG_SAMPLING_BUDGET: i32 = -55;
pub const BUILTIN_METRIC_ID_AGG_SAMPLING_GROUP_BUDGET: i32 = -56;
pub const BUILTIN_METRIC_ID_AGG_SAMPLING_METRIC_COUNT: i32 = -57;
pub const BUILTIN_METRIC_ID_AGG_SAMPLING_TIME: i32 = -58;
pub const BUILTIN_METRIC_ID_AGG_CONTRIBUTORS: i32 = -59;
pub const BUILTIN_METRIC_ID_AGG_MAPPING_CREATED: i32 = -60;
pub const BUILTIN_METRIC_ID_AGG_BUCKET_RECEIVE_DELAY_SEC: i32 = -61;
pub const BUILTIN_METRIC_ID_CONTRIBUTORS_LOG: i32 = -62;
pub const BUILTIN_METRIC_ID_CONTRIBUTORS_LOG_REV: i32 = -63;
pub const BUILTIN_METRIC_ID_HISTORIC_OUT_OF_WINDOW_DROPPED: i32 = -64;

/// Hardware host metrics occupy a reserved id range and follow the
/// atomically-published hardware resolution instead of their own metadata.
pub const HARDWARE_METRIC_ID_MAX: i32 = -900;
pub const HARDWARE_METRIC_ID_MIN: i32 = -999;

/// True for metrics in the reserved hardware host-metric range.
pub fn hardware_metric(metric_id: i32) -> bool {
    (HARDWARE_METRIC_ID_MIN..=HARDWARE_METRIC_ID_MAX).contains(&metric_id)
}

// --- Tag value ids ---

pub const TAG_VALUE_ID_COMPONENT_AGENT: i32 = 1;
pub const TAG_VALUE_ID_COMPONENT_AGGREGATOR: i32 = 2;

pub const TAG_VALUE_ID_CONVEYOR_RECENT: i32 = 1;
pub const TAG_VALUE_ID_CONVEYOR_HISTORIC: i32 = 2;

pub const TAG_VALUE_ID_SIZE_COUNTER: i32 = 1;
pub const TAG_VALUE_ID_SIZE_VALUE: i32 = 2;
pub const TAG_VALUE_ID_SIZE_PERCENTILES: i32 = 3;
pub const TAG_VALUE_ID_SIZE_UNIQUE: i32 = 4;
pub const TAG_VALUE_ID_SIZE_STRING_TOP: i32 = 5;
pub const TAG_VALUE_ID_SIZE_BUILTIN: i32 = 6;

pub const TAG_VALUE_ID_CPU_USAGE_USER: i32 = 1;
pub const TAG_VALUE_ID_CPU_USAGE_SYS: i32 = 2;

pub const TAG_VALUE_ID_HEARTBEAT_EVENT_START: i32 = 1;
pub const TAG_VALUE_ID_HEARTBEAT_EVENT_HEARTBEAT: i32 = 2;

pub const TAG_VALUE_ID_BADGE_INGESTION_ERRORS: i32 = 1;
pub const TAG_VALUE_ID_BADGE_INGESTION_WARNINGS: i32 = 2;
pub const TAG_VALUE_ID_BADGE_AGENT_SAMPLING_FACTOR: i32 = 3;
pub const TAG_VALUE_ID_BADGE_AGG_SAMPLING_FACTOR: i32 = 4;
pub const TAG_VALUE_ID_BADGE_AGG_MAPPING_ERRORS: i32 = 5;
pub const TAG_VALUE_ID_BADGE_CONTRIBUTORS: i32 = 6;

pub const TAG_VALUE_ID_SRC_INGESTION_STATUS_OK_CACHED: i32 = 1;
pub const TAG_VALUE_ID_SRC_INGESTION_STATUS_OK_UNCACHED: i32 = 2;
pub const TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_DEPRECATED_KEY_NAME: i32 = 10;
pub const TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_DEPRECATED_T: i32 = 11;
pub const TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_DEPRECATED_STOP: i32 = 12;
pub const TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_MAP_TAG_SET_TWICE: i32 = 13;
pub const TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_OLD_COUNTER_SEMANTIC: i32 = 14;
pub const TAG_VALUE_ID_SRC_INGESTION_STATUS_WARN_MAP_INVALID_RAW_TAG_VALUE: i32 = 15;

pub const TAG_VALUE_ID_AGG_MAPPING_CREATED_STATUS_OK: i32 = 1;
pub const TAG_VALUE_ID_AGG_MAPPING_CREATED_STATUS_CREATED: i32 = 2;

pub const TAG_VALUE_ID_SAMPLING_DECISION_KEEP: i32 = 1;
pub const TAG_VALUE_ID_SAMPLING_DECISION_DISCARD: i32 = 2;

pub const TAG_VALUE_ID_AGG_SAMPLING_FACTOR_REASON_INSERT_SIZE: i32 = 1;

/// Resolutions that divide 60; the only values a metric may declare.
pub const ALLOWED_RESOLUTIONS: [u32; 12] = [1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30, 60];

/// Snaps an arbitrary declared resolution to the allow-list, rounding up.
pub fn snap_resolution(resolution: u32) -> u32 {
    for r in ALLOWED_RESOLUTIONS {
        if resolution <= r {
            return r;
        }
    }
    60
}

/// Per-metric metadata consulted by routing and the row encoder.
#[derive(Debug, Clone, Default)]
pub struct MetricMeta {
    pub metric_id: i32,
    pub name: String,
    pub namespace_id: i32,
    pub group_id: i32,
    /// Seconds per bucket, snapped to the allow-list.
    pub effective_resolution: u32,
    pub has_percentiles: bool,
    pub skip_min_host: bool,
    pub skip_max_host: bool,
    pub skip_sum_square: bool,
    /// Tag index materialized as the `prekey` column, -1 when unset.
    pub pre_key_index: i32,
    pub pre_key_only: bool,
}

impl MetricMeta {
    pub fn new(metric_id: i32, name: &str) -> Self {
        Self {
            metric_id,
            name: name.to_string(),
            effective_resolution: 1,
            pre_key_index: -1,
            ..Default::default()
        }
    }
}

/// Source of metric metadata and journal identity.
///
/// Journal replication is a collaborator; implementations only expose the
/// replicated view.
pub trait MetaProvider: Send + Sync {
    fn meta_for(&self, metric_id: i32) -> Option<Arc<MetricMeta>>;
    fn journal_version(&self) -> i64;
    /// Hex digest of the journal state, "" when unknown.
    fn journal_state_hash(&self) -> String;
}

/// Fixed metadata table, used at startup and in tests.
#[derive(Default)]
pub struct StaticMetaProvider {
    metas: parking_lot::RwLock<HashMap<i32, Arc<MetricMeta>>>,
    version: parking_lot::Mutex<(i64, String)>,
}

impl StaticMetaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, mut meta: MetricMeta) {
        meta.effective_resolution = snap_resolution(meta.effective_resolution.max(1));
        self.metas
            .write()
            .insert(meta.metric_id, Arc::new(meta));
    }

    pub fn set_journal(&self, version: i64, state_hash: &str) {
        *self.version.lock() = (version, state_hash.to_string());
    }
}

impl MetaProvider for StaticMetaProvider {
    fn meta_for(&self, metric_id: i32) -> Option<Arc<MetricMeta>> {
        self.metas.read().get(&metric_id).cloned()
    }

    fn journal_version(&self) -> i64 {
        self.version.lock().0
    }

    fn journal_state_hash(&self) -> String {
        self.version.lock().1.clone()
    }
}
