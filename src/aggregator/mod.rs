//! Aggregator: receives contributor buckets, applies budget sampling, and
//! encodes the insert body for the column store.

pub mod clickhouse;
pub mod insert;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::config::AggregatorConfig;
use crate::data_model::{ItemValue, Key, MetricsBucket, MultiItem, MAX_HISTORIC_WINDOW};
use crate::format::MetaProvider;

use self::clickhouse::{ClickHouseSink, InsertError, InsertReport};

/// One second of merged contributor data on the aggregator.
pub struct AggregatorBucket {
    pub time: u32,
    pub multi_items: HashMap<Key, MultiItem>,
    /// Contributors that sent this bucket on the recent conveyor.
    pub contributors_original: ItemValue,
    /// Contributors that arrived through the spare path.
    pub contributors_spare: ItemValue,
}

impl AggregatorBucket {
    pub fn new(time: u32) -> Self {
        Self {
            time,
            multi_items: HashMap::new(),
            contributors_original: ItemValue::default(),
            contributors_spare: ItemValue::default(),
        }
    }

    /// Merges one contributor's shipped bucket into this second.
    pub fn merge_contributor(&mut self, bucket: &MetricsBucket, spare: bool) {
        for (key, item) in &bucket.multi_items {
            let capacity = item.top.len().max(1);
            self.multi_items
                .entry(*key)
                .or_insert_with(|| MultiItem::new(capacity))
                .merge_from(item);
        }
        if spare {
            self.contributors_spare.add_counter_host(1.0, 0);
        } else {
            self.contributors_original.add_counter_host(1.0, 0);
        }
    }
}

/// The aggregator core. Sampling configuration is remote-updatable; readers
/// clone a snapshot under the read lock.
pub struct Aggregator {
    config: RwLock<AggregatorConfig>,
    meta: Arc<dyn MetaProvider>,
    aggregator_host: i32,
    rng: Mutex<StdRng>,
    pub historic_out_of_window_dropped: AtomicI64,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, meta: Arc<dyn MetaProvider>, aggregator_host: i32) -> Self {
        Self {
            config: RwLock::new(config),
            meta,
            aggregator_host,
            rng: Mutex::new(StdRng::from_entropy()),
            historic_out_of_window_dropped: AtomicI64::new(0),
        }
    }

    /// Test constructor with a fixed PRNG seed for reproducible sampling.
    pub fn with_seed(
        config: AggregatorConfig,
        meta: Arc<dyn MetaProvider>,
        aggregator_host: i32,
        seed: u64,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            meta,
            aggregator_host,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            historic_out_of_window_dropped: AtomicI64::new(0),
        }
    }

    pub fn config_snapshot(&self) -> AggregatorConfig {
        self.config.read().clone()
    }

    /// Replaces the remote-updatable configuration. A failed validation
    /// keeps the previous config.
    pub fn update_config(&self, new_config: AggregatorConfig) {
        if new_config.insert_budget <= 0 || new_config.string_top_count_insert == 0 {
            warn!("rejected aggregator config update, keeping previous config");
            return;
        }
        *self.config.write() = new_config;
        info!("aggregator config updated");
    }

    /// Clamps a contributor-supplied bucket timestamp into the acceptable
    /// window around `now`. Future timestamps clamp to now; timestamps older
    /// than the historic window clamp to its edge and are counted.
    pub fn clamp_bucket_time(&self, time: u32, now: u32) -> u32 {
        if time > now {
            return now;
        }
        if now > MAX_HISTORIC_WINDOW && time < now - MAX_HISTORIC_WINDOW {
            self.historic_out_of_window_dropped
                .fetch_add(1, Ordering::Relaxed);
            return now - MAX_HISTORIC_WINDOW;
        }
        time
    }

    /// Samples and encodes a conveyor batch; first bucket recent, the rest
    /// historic.
    pub fn marshal_insert(&self, buckets: &mut [AggregatorBucket]) -> Vec<u8> {
        let config = self.config_snapshot();
        let mut rng = self.rng.lock();
        insert::row_data_marshal(
            buckets,
            &config,
            Some(self.meta.as_ref()),
            self.aggregator_host,
            &mut *rng,
            unix_now(),
        )
    }

    /// Encodes and posts a conveyor batch. Transient errors leave the batch
    /// eligible for retry by the caller; permanent errors mean the batch
    /// must be dropped after logging.
    pub async fn insert_buckets(
        &self,
        sink: &ClickHouseSink,
        buckets: &mut [AggregatorBucket],
    ) -> Result<InsertReport, InsertError> {
        let body = self.marshal_insert(buckets);
        let result = sink.insert(body).await;
        match &result {
            Ok(report) => {
                info!(
                    status = report.status,
                    elapsed = report.elapsed_seconds,
                    buckets = buckets.len(),
                    "insert ok"
                );
            }
            Err(e) if e.is_permanent() => {
                warn!(error = %e, "permanent insert failure, dropping batch");
            }
            Err(e) => {
                warn!(error = %e, "transient insert failure, batch kept for retry");
            }
        }
        result
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::StaticMetaProvider;

    fn test_aggregator() -> Aggregator {
        Aggregator::with_seed(
            AggregatorConfig::default(),
            Arc::new(StaticMetaProvider::new()),
            9,
            42,
        )
    }

    #[test]
    fn test_clamp_bucket_time() {
        let agg = test_aggregator();
        let now = 1_000_000;
        assert_eq!(agg.clamp_bucket_time(now + 50, now), now);
        assert_eq!(agg.clamp_bucket_time(now - 10, now), now - 10);
        assert_eq!(
            agg.clamp_bucket_time(now - MAX_HISTORIC_WINDOW - 5, now),
            now - MAX_HISTORIC_WINDOW
        );
        assert_eq!(
            agg.historic_out_of_window_dropped.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let agg = test_aggregator();
        let mut bad = AggregatorConfig::default();
        bad.insert_budget = 0;
        agg.update_config(bad);
        assert_eq!(
            agg.config_snapshot().insert_budget,
            AggregatorConfig::default().insert_budget
        );

        let mut good = AggregatorConfig::default();
        good.insert_budget = 999;
        agg.update_config(good);
        assert_eq!(agg.config_snapshot().insert_budget, 999);
    }

    #[test]
    fn test_merge_contributor_counts() {
        let mut agg_bucket = AggregatorBucket::new(100);
        let mut bucket = MetricsBucket::new(100);
        bucket
            .map_key_item(Key::new(42, [0; 16]), 4)
            .tail
            .add_counter_host(2.0, 0);
        agg_bucket.merge_contributor(&bucket, false);
        agg_bucket.merge_contributor(&bucket, true);
        assert_eq!(agg_bucket.contributors_original.counter, 1.0);
        assert_eq!(agg_bucket.contributors_spare.counter, 1.0);
        let item = agg_bucket.multi_items.values().next().expect("merged");
        assert_eq!(item.tail.value.counter, 4.0);
    }
}
