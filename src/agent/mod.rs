//! Agent assembly: shard fan-out, per-shard tick and preprocessor loops,
//! and the outbound conveyor feeding the transport.

pub mod builtin;
pub mod codec;
pub mod shard;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::data_model::{ItemValue, Key, MetricsBucket, MAX_HISTORIC_WINDOW};
use crate::format::{MetaProvider, TAG_VALUE_ID_COMPONENT_AGENT};

use self::builtin::{BuiltInItemValue, BuiltinInjector};
use self::shard::Shard;

/// One second of shard output, framed and ready for the transport.
#[derive(Debug, Clone)]
pub struct CompressedBucket {
    pub time: u32,
    /// 4-byte little-endian uncompressed length, then the codec blob.
    pub data: Vec<u8>,
    /// Whether the payload was spilled to the disk cache.
    pub on_disk: bool,
}

/// Transport shipping compressed buckets to the aggregator. The network
/// half is a collaborator; implementations only need to accept or fail.
pub trait Transport: Send + Sync {
    fn ship(&self, bucket: &CompressedBucket) -> Result<()>;
}

/// Accepts and discards every bucket; used in dry-run mode and tests.
#[derive(Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn ship(&self, _bucket: &CompressedBucket) -> Result<()> {
        Ok(())
    }
}

/// Durable spill target for buckets the outbound queue cannot take.
pub trait DiskBucketCache: Send + Sync {
    fn store(&self, shard_num: usize, time: u32, data: &[u8]) -> Result<()>;
}

/// In-memory stand-in for the on-disk cache collaborator.
#[derive(Default)]
pub struct MemoryBucketCache {
    entries: Mutex<Vec<(usize, u32, Vec<u8>)>>,
}

impl MemoryBucketCache {
    pub fn take_entries(&self) -> Vec<(usize, u32, Vec<u8>)> {
        std::mem::take(&mut self.entries.lock())
    }
}

impl DiskBucketCache for MemoryBucketCache {
    fn store(&self, shard_num: usize, time: u32, data: &[u8]) -> Result<()> {
        self.entries.lock().push((shard_num, time, data.to_vec()));
        Ok(())
    }
}

/// The agent: a fan-in ingest API over independently locked shards, a 1 Hz
/// per-shard clock, and the compression/ship pipeline behind them.
pub struct Agent {
    cfg: AgentConfig,
    shards: Vec<Arc<Shard>>,
    meta: Arc<dyn MetaProvider>,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn DiskBucketCache>,
    hardware_metric_resolution: Arc<AtomicU32>,
    historic_data_size: Arc<AtomicUsize>,
    cancel: CancellationToken,
    bucket_tx: mpsc::Sender<CompressedBucket>,
    bucket_rx: Option<mpsc::Receiver<CompressedBucket>>,
    preprocessors: Vec<std::thread::JoinHandle<()>>,
    shipper: Option<tokio::task::JoinHandle<()>>,
}

impl Agent {
    pub fn new(
        cfg: AgentConfig,
        meta: Arc<dyn MetaProvider>,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn DiskBucketCache>,
        version: &str,
    ) -> Result<Self> {
        let start_timestamp = unix_now();
        let hardware_metric_resolution =
            Arc::new(AtomicU32::new(cfg.hardware_metric_resolution.max(1)));

        let args: Vec<String> = std::env::args().collect();
        let args = args.join(" ");
        let mut rng = rand::thread_rng();

        let mut shards = Vec::with_capacity(cfg.num_shards);
        for shard_num in 0..cfg.num_shards {
            // Heartbeats live on the first shard only.
            let injector = (shard_num == 0).then(|| {
                BuiltinInjector::new(
                    Arc::clone(&meta),
                    TAG_VALUE_ID_COMPONENT_AGENT,
                    start_timestamp,
                    version.to_string(),
                    args.clone(),
                    rng.gen_range(0..60),
                )
            });
            shards.push(Arc::new(Shard::new(
                shard_num,
                shard_num as i32 + 1,
                start_timestamp,
                cfg.string_top_capacity,
                Arc::clone(&hardware_metric_resolution),
                Duration::from_millis(rng.gen_range(0..1000)),
                injector,
            )));
        }

        let (bucket_tx, bucket_rx) = mpsc::channel(cfg.outbound_queue_len);
        Ok(Self {
            cfg,
            shards,
            meta,
            transport,
            cache,
            hardware_metric_resolution,
            historic_data_size: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            bucket_tx,
            bucket_rx: Some(bucket_rx),
            preprocessors: Vec::new(),
            shipper: None,
        })
    }

    /// Publishes a new hardware metric resolution; subsequent hardware
    /// ingests route by it.
    pub fn set_hardware_metric_resolution(&self, resolution: u32) {
        self.hardware_metric_resolution
            .store(resolution.max(1), Ordering::Relaxed);
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    // --- Ingest API (thread-safe, never fails) ---

    pub fn apply_counter(&self, key: Key, str_key: &str, count: f64, host_tag: i32) {
        let meta = self.meta.meta_for(key.metric);
        let key_hash = key.hash64();
        self.shard_for(key_hash)
            .apply_counter(key, key_hash, str_key, count, host_tag, meta.as_deref());
    }

    pub fn apply_values(&self, key: Key, str_key: &str, values: &[f64], count: f64, host_tag: i32) {
        let meta = self.meta.meta_for(key.metric);
        let key_hash = key.hash64();
        self.shard_for(key_hash).apply_values(
            key,
            key_hash,
            str_key,
            values,
            count,
            host_tag,
            meta.as_deref(),
        );
    }

    /// Unique-value ingest. Hashes are split across shards by value so each
    /// shard's sketch covers a disjoint slice and cardinality merges cleanly
    /// downstream.
    pub fn apply_unique(&self, key: Key, str_key: &str, hashes: &[i64], count: f64, host_tag: i32) {
        let meta = self.meta.meta_for(key.metric);
        let key_hash = key.hash64();
        let home = self.shard_for(key_hash);
        if hashes.len() <= 1 || self.shards.len() == 1 {
            home.apply_unique(key, key_hash, str_key, hashes, count, host_tag, meta.as_deref());
            return;
        }
        let shard_count = self.shards.len();
        let mut buffers = home.get_unique_values_cache(shard_count);
        for &h in hashes {
            buffers[(h as u64 % shard_count as u64) as usize].push(h);
        }
        for (shard_num, buffer) in buffers.iter().enumerate() {
            if buffer.is_empty() {
                continue;
            }
            let sub_count = count * buffer.len() as f64 / hashes.len() as f64;
            self.shards[shard_num].apply_unique(
                key,
                key_hash,
                str_key,
                buffer,
                sub_count,
                host_tag,
                meta.as_deref(),
            );
        }
        home.put_unique_values_cache(buffers);
    }

    pub fn add_counter_host(&self, key: Key, count: f64, host_tag: i32) {
        let meta = self.meta.meta_for(key.metric);
        let key_hash = key.hash64();
        self.shard_for(key_hash)
            .add_counter_host(key, key_hash, count, host_tag, meta.as_deref());
    }

    pub fn add_value_counter_host(&self, key: Key, value: f64, count: f64, host_tag: i32) {
        let meta = self.meta.meta_for(key.metric);
        let key_hash = key.hash64();
        self.shard_for(key_hash)
            .add_value_counter_host(key, key_hash, value, count, host_tag, meta.as_deref());
    }

    pub fn merge_item_value(&self, key: Key, item: &ItemValue) {
        let meta = self.meta.meta_for(key.metric);
        let key_hash = key.hash64();
        self.shard_for(key_hash)
            .merge_item_value(key, key_hash, item, meta.as_deref());
    }

    /// Registers a built-in cell on the key's home shard.
    pub fn create_builtin(&self, key: Key) -> Arc<BuiltInItemValue> {
        self.shard_for(key.hash64()).create_builtin(key)
    }

    fn shard_for(&self, key_hash: u64) -> &Shard {
        &self.shards[(key_hash % self.shards.len() as u64) as usize]
    }

    // --- Lifecycle ---

    /// Starts the per-shard clocks, preprocessor threads and the shipper.
    pub fn start(&mut self) -> Result<()> {
        let mut bucket_rx = self
            .bucket_rx
            .take()
            .context("agent started more than once")?;

        for shard in &self.shards {
            let tick_shard = Arc::clone(shard);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut last_ticked = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                loop {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default();
                    let next_second = now.as_secs() + 1;
                    let target = Duration::from_secs(next_second) + tick_shard.time_spread_delta;
                    let sleep_for = target.saturating_sub(now);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                    // Catch up through any seconds a slow tick skipped, so
                    // the lattice never falls behind the wall clock.
                    for second in (last_ticked + 1)..=next_second {
                        tick_shard.advance_time(second as u32);
                    }
                    last_ticked = next_second;
                }
            });

            let pp_shard = Arc::clone(shard);
            let tx = self.bucket_tx.clone();
            let cache = Arc::clone(&self.cache);
            let codec = self.cfg.compression.clone();
            let historic_size = Arc::clone(&self.historic_data_size);
            let handle = std::thread::Builder::new()
                .name(format!("preprocess-{}", pp_shard.shard_num))
                .spawn(move || {
                    preprocess_loop(&pp_shard, &tx, cache.as_ref(), &codec, &historic_size)
                })
                .context("spawning preprocessor thread")?;
            self.preprocessors.push(handle);
        }

        let transport = Arc::clone(&self.transport);
        let cache = Arc::clone(&self.cache);
        let cancel = self.cancel.clone();
        let historic_size = Arc::clone(&self.historic_data_size);
        self.shipper = Some(tokio::spawn(async move {
            loop {
                let bucket = tokio::select! {
                    _ = cancel.cancelled() => break,
                    bucket = bucket_rx.recv() => match bucket {
                        Some(b) => b,
                        None => return,
                    },
                };
                ship_or_spill(&bucket, transport.as_ref(), cache.as_ref(), &historic_size);
            }
            // Drain whatever the preprocessors managed to enqueue.
            while let Ok(bucket) = bucket_rx.try_recv() {
                ship_or_spill(&bucket, transport.as_ref(), cache.as_ref(), &historic_size);
            }
        }));

        info!(
            shards = self.shards.len(),
            compression = %self.cfg.compression,
            "agent started"
        );
        Ok(())
    }

    /// Stops ingestion and drains the outbound queue within the grace
    /// period. Ingest calls arriving after this drop silently.
    pub async fn stop(&mut self) {
        for shard in &self.shards {
            shard.stop();
        }
        for handle in self.preprocessors.drain(..) {
            if handle.join().is_err() {
                warn!("preprocessor thread panicked");
            }
        }
        self.cancel.cancel();
        if let Some(shipper) = self.shipper.take() {
            let grace = self.cfg.shutdown_grace;
            if tokio::time::timeout(grace, shipper).await.is_err() {
                warn!(grace = ?grace, "shipper did not drain within the grace period");
            }
        }
        info!("agent stopped");
    }
}

fn preprocess_loop(
    shard: &Shard,
    tx: &mpsc::Sender<CompressedBucket>,
    cache: &dyn DiskBucketCache,
    codec: &str,
    historic_size: &AtomicUsize,
) {
    while let Some((time, buckets)) = shard.wait_preprocessing() {
        let mut merged = MetricsBucket::new(time);
        let capacity = buckets
            .iter()
            .flat_map(|b| b.multi_items.values())
            .map(|item| item.top.len())
            .max()
            .unwrap_or(0);
        for bucket in &buckets {
            for (key, item) in &bucket.multi_items {
                merged
                    .map_key_item(*key, capacity.max(1))
                    .merge_from(item);
            }
        }

        let payload = codec::encode_bucket(&mut merged);
        let data = match codec::compress_frame(&payload, codec) {
            Ok(data) => data,
            Err(e) => {
                warn!(shard = shard.shard_num, error = %e, "bucket compression failed");
                continue;
            }
        };
        let bucket = CompressedBucket {
            time,
            data,
            on_disk: false,
        };
        if let Err(send_err) = tx.try_send(bucket) {
            let mut bucket = match send_err {
                mpsc::error::TrySendError::Full(b) => b,
                mpsc::error::TrySendError::Closed(b) => b,
            };
            spill(shard, &mut bucket, cache, historic_size);
        }
    }
}

fn ship_or_spill(
    bucket: &CompressedBucket,
    transport: &dyn Transport,
    cache: &dyn DiskBucketCache,
    historic_size: &AtomicUsize,
) {
    if let Err(e) = transport.ship(bucket) {
        warn!(time = bucket.time, error = %e, "bucket ship failed, spilling");
        if cache.store(0, bucket.time, &bucket.data).is_ok() {
            historic_size.fetch_add(bucket.data.len(), Ordering::Relaxed);
        }
    }
}

fn spill(
    shard: &Shard,
    bucket: &mut CompressedBucket,
    cache: &dyn DiskBucketCache,
    historic_size: &AtomicUsize,
) {
    let now = unix_now();
    if bucket.time + MAX_HISTORIC_WINDOW < now {
        shard
            .historic_out_of_window_dropped
            .fetch_add(1, Ordering::Relaxed);
        return;
    }
    match cache.store(shard.shard_num, bucket.time, &bucket.data) {
        Ok(()) => {
            bucket.on_disk = true;
            historic_size.fetch_add(bucket.data.len(), Ordering::Relaxed);
        }
        Err(e) => {
            warn!(shard = shard.shard_num, time = bucket.time, error = %e, "bucket spill failed, dropping");
        }
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
    use crate::format::{MetricMeta, StaticMetaProvider, MAX_TAGS};

    fn test_agent(num_shards: usize) -> Agent {
        let meta = Arc::new(StaticMetaProvider::new());
        let mut percentile_meta = MetricMeta::new(50, "request_time");
        percentile_meta.has_percentiles = true;
        meta.put(percentile_meta);
        let cfg = AgentConfig {
            num_shards,
            ..AgentConfig::default()
        };
        Agent::new(
            cfg,
            meta,
            Arc::new(NullTransport),
            Arc::new(MemoryBucketCache::default()),
            "test",
        )
        .expect("agent")
    }

    fn key_with_tag(metric: i32, tag0: i32) -> Key {
        let mut tags = [0i32; MAX_TAGS];
        tags[0] = tag0;
        Key::new(metric, tags)
    }

    #[test]
    fn test_same_key_lands_on_one_shard() {
        let agent = test_agent(4);
        let key = key_with_tag(42, 7);
        for _ in 0..10 {
            agent.apply_counter(key, "", 1.0, 0);
        }
        let mut shards_with_data = 0;
        for shard in agent.shards() {
            let items = shard.with_current_bucket(1, 0, |b| b.multi_items.len());
            if items > 0 {
                shards_with_data += 1;
                shard.with_current_bucket(1, 0, |b| {
                    assert_eq!(
                        b.multi_items.values().next().expect("item").tail.value.counter,
                        10.0
                    );
                });
            }
        }
        assert_eq!(shards_with_data, 1);
    }

    #[test]
    fn test_unique_hashes_split_across_shards() {
        let agent = test_agent(4);
        let hashes: Vec<i64> = (0..1000).collect();
        agent.apply_unique(key_with_tag(42, 1), "", &hashes, 0.0, 0);

        let mut total_estimate = 0.0;
        let mut total_counter = 0.0;
        for shard in agent.shards() {
            shard.with_current_bucket(1, 0, |b| {
                for item in b.multi_items.values() {
                    total_estimate += item.tail.uniques.estimate();
                    total_counter += item.tail.value.counter;
                }
            });
        }
        // Disjoint slices: estimates add up to the true cardinality.
        assert_eq!(total_estimate, 1000.0);
        assert_eq!(total_counter, 1000.0);
    }

    #[test]
    fn test_percentile_metric_builds_digest() {
        let agent = test_agent(2);
        agent.add_value_counter_host(key_with_tag(50, 1), 12.5, 2.0, 0);
        let mut found = false;
        for shard in agent.shards() {
            shard.with_current_bucket(1, 0, |b| {
                for item in b.multi_items.values() {
                    if item.tail.percentiles.is_some() {
                        found = true;
                    }
                }
            });
        }
        assert!(found, "metric with percentiles did not get a digest");
    }

    #[tokio::test]
    async fn test_advance_and_ship_through_queue() {
        let mut agent = test_agent(1);
        agent.start().expect("start");
        let key = key_with_tag(42, 1);
        agent.apply_counter(key, "", 3.0, 0);
        // Drive time by hand instead of waiting for the wall clock.
        let now = unix_now();
        agent.shards()[0].advance_time(now + 1);
        agent.stop().await;
    }

    #[test]
    fn test_spill_sets_on_disk_and_accounts_size() {
        let cache = MemoryBucketCache::default();
        let historic = AtomicUsize::new(0);
        let shard = Shard::new(
            0,
            1,
            100,
            4,
            Arc::new(AtomicU32::new(60)),
            Duration::ZERO,
            None,
        );
        let mut bucket = CompressedBucket {
            time: unix_now(),
            data: vec![1, 2, 3],
            on_disk: false,
        };
        spill(&shard, &mut bucket, &cache, &historic);
        assert!(bucket.on_disk);
        assert_eq!(historic.load(Ordering::Relaxed), 3);
        assert_eq!(cache.take_entries().len(), 1);

        // Too old for the historic window: dropped and counted.
        let mut stale = CompressedBucket {
            time: 10,
            data: vec![1],
            on_disk: false,
        };
        spill(&shard, &mut stale, &cache, &historic);
        assert!(!stale.on_disk);
        assert_eq!(
            shard
                .historic_out_of_window_dropped
                .load(Ordering::Relaxed),
            1
        );
    }
}
