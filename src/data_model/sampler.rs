//! Budget-driven sampling over metric groups.
//!
//! Candidates are grouped `namespace → group → metric`; the byte budget is
//! split level by level proportionally to configured weights, with unused
//! share flowing to heavier entries. An over-budget metric keeps its whales
//! verbatim and retains the remainder probabilistically with counters scaled
//! by the sampling factor, preserving expected sums.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::Rng;

use crate::format::MetaProvider;

use super::{ItemValue, Key, MultiItem};

/// One sampling candidate, produced per bucket item after string-top
/// finalization.
pub struct SamplingPair {
    pub key: Key,
    pub item: MultiItem,
    /// Largest string-top counter, used to pin heavy hitters.
    pub whale_weight: f64,
    pub size: usize,
    /// Metric whose budget this item is charged to (ingestion-status rows
    /// are charged to the metric they describe).
    pub account_metric: i32,
    pub bucket_ts: u32,
}

/// Keep/discard byte totals for one `(namespace, group, metric)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplingSizes {
    pub sum_size_keep: ItemValue,
    pub sum_size_discard: ItemValue,
}

/// What the sampler saw and decided, encoded afterwards as self metrics.
#[derive(Debug, Default)]
pub struct SamplerStatistics {
    pub items: BTreeMap<(i32, i32, i32), SamplingSizes>,
    /// Budget allocated per `(namespace, group)`.
    pub budget: BTreeMap<(i32, i32), f64>,
    pub metrics: HashSet<i32>,
    sample_factors: BTreeMap<i32, f64>,
}

impl SamplerStatistics {
    /// Per-metric sampling factors, only metrics that were actually sampled.
    pub fn sample_factors(&self) -> impl Iterator<Item = (i32, f64)> + '_ {
        self.sample_factors.iter().map(|(&m, &sf)| (m, sf))
    }

    fn record_keep(&mut self, key: (i32, i32, i32), size: usize) {
        self.metrics.insert(key.2);
        self.items
            .entry(key)
            .or_default()
            .sum_size_keep
            .add_value(size as f64);
    }

    fn record_discard(&mut self, key: (i32, i32, i32), size: usize) {
        self.metrics.insert(key.2);
        self.items
            .entry(key)
            .or_default()
            .sum_size_discard
            .add_value(size as f64);
    }
}

/// Weight maps driving the hierarchical budget split. Entities without an
/// entry weigh 1.
pub struct SamplerConfig<'a> {
    pub meta: Option<&'a dyn MetaProvider>,
    pub sample_namespaces: &'a HashMap<i32, f64>,
    pub sample_groups: &'a HashMap<i32, f64>,
    pub sample_keys: &'a HashMap<i32, f64>,
}

pub struct Sampler<'a> {
    config: SamplerConfig<'a>,
    pairs: Vec<SamplingPair>,
}

impl<'a> Sampler<'a> {
    pub fn new(capacity: usize, config: SamplerConfig<'a>) -> Self {
        Self {
            config,
            pairs: Vec::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, pair: SamplingPair) {
        self.pairs.push(pair);
    }

    /// Records an item kept outside the budget (self metrics are never
    /// dropped) so statistics still account for it.
    pub fn keep_unsampled(&self, stat: &mut SamplerStatistics, account_metric: i32, size: usize) {
        stat.record_keep(self.group_key(account_metric), size);
    }

    /// Partitions the candidates against `budget` bytes and invokes `keep`
    /// for every retained item with its effective sampling factor.
    ///
    /// Deterministic for a fixed candidate order and PRNG seed.
    pub fn run<R, F>(mut self, budget: i64, rng: &mut R, stat: &mut SamplerStatistics, mut keep: F)
    where
        R: Rng,
        F: FnMut(Key, &mut MultiItem, f64, u32),
    {
        let mut by_metric: BTreeMap<(i32, i32, i32), Vec<SamplingPair>> = BTreeMap::new();
        for pair in std::mem::take(&mut self.pairs) {
            by_metric
                .entry(self.group_key(pair.account_metric))
                .or_default()
                .push(pair);
        }

        let metric_size =
            |pairs: &[SamplingPair]| pairs.iter().map(|p| p.size as f64).sum::<f64>();

        // namespace -> group -> metric sizes, then waterfill down the levels.
        let mut tree: BTreeMap<i32, BTreeMap<i32, Vec<(i32, f64)>>> = BTreeMap::new();
        for (&(ns, group, metric), pairs) in &by_metric {
            tree.entry(ns)
                .or_default()
                .entry(group)
                .or_default()
                .push((metric, metric_size(pairs)));
        }

        let ns_entries: Vec<(i32, f64, f64)> = tree
            .iter()
            .map(|(&ns, groups)| {
                let need = groups
                    .values()
                    .flat_map(|metrics| metrics.iter().map(|(_, s)| s))
                    .sum();
                (ns, self.weight(self.config.sample_namespaces, ns), need)
            })
            .collect();
        let ns_shares = waterfill(budget.max(0) as f64, &ns_entries);

        let mut metric_shares: BTreeMap<(i32, i32, i32), f64> = BTreeMap::new();
        for ((&ns, groups), ns_share) in tree.iter().zip(ns_shares) {
            let group_entries: Vec<(i32, f64, f64)> = groups
                .iter()
                .map(|(&group, metrics)| {
                    let need = metrics.iter().map(|(_, s)| s).sum();
                    (group, self.weight(self.config.sample_groups, group), need)
                })
                .collect();
            let group_shares = waterfill(ns_share, &group_entries);
            for ((&group, metrics), group_share) in groups.iter().zip(group_shares) {
                stat.budget.insert((ns, group), group_share);
                let entries: Vec<(i32, f64, f64)> = metrics
                    .iter()
                    .map(|&(metric, size)| {
                        (metric, self.weight(self.config.sample_keys, metric), size)
                    })
                    .collect();
                for (&(metric, _), share) in metrics.iter().zip(waterfill(group_share, &entries)) {
                    metric_shares.insert((ns, group, metric), share);
                }
            }
        }

        for (group_key, mut pairs) in by_metric {
            let share = metric_shares.get(&group_key).copied().unwrap_or(0.0);
            let total = metric_size(&pairs);
            stat.metrics.insert(group_key.2);

            if total <= share {
                for mut pair in pairs {
                    stat.record_keep(group_key, pair.size);
                    keep(pair.key, &mut pair.item, 1.0, pair.bucket_ts);
                }
                continue;
            }
            if share <= 0.0 {
                for pair in pairs {
                    stat.record_discard(group_key, pair.size);
                }
                stat.sample_factors.insert(group_key.2, f64::INFINITY);
                continue;
            }

            let sf = total / share;
            stat.sample_factors.insert(group_key.2, sf);

            // Heavy hitters ride for free up to half the share; discarding
            // them would swing displayed totals wildly.
            pairs.sort_by(|a, b| {
                b.whale_weight
                    .partial_cmp(&a.whale_weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let mean_weight =
                pairs.iter().map(|p| p.whale_weight).sum::<f64>() / pairs.len() as f64;
            let mut whale_size = 0.0;
            let mut rest_start = 0;
            for pair in &pairs {
                let is_whale = pair.whale_weight > mean_weight * sf
                    && whale_size + pair.size as f64 <= share / 2.0;
                if !is_whale {
                    break;
                }
                whale_size += pair.size as f64;
                rest_start += 1;
            }

            let rest_share = share - whale_size;
            let rest_size = total - whale_size;
            let rest_sf = if rest_share > 0.0 {
                (rest_size / rest_share).max(1.0)
            } else {
                f64::INFINITY
            };

            for (i, mut pair) in pairs.into_iter().enumerate() {
                if i < rest_start {
                    stat.record_keep(group_key, pair.size);
                    keep(pair.key, &mut pair.item, 1.0, pair.bucket_ts);
                } else if rest_sf.is_finite() && rng.gen::<f64>() * rest_sf < 1.0 {
                    stat.record_keep(group_key, pair.size);
                    keep(pair.key, &mut pair.item, rest_sf, pair.bucket_ts);
                } else {
                    stat.record_discard(group_key, pair.size);
                }
            }
        }
    }

    fn group_key(&self, account_metric: i32) -> (i32, i32, i32) {
        let meta = self
            .config
            .meta
            .and_then(|m| m.meta_for(account_metric));
        match meta {
            Some(meta) => (meta.namespace_id, meta.group_id, account_metric),
            None => (0, 0, account_metric),
        }
    }

    fn weight(&self, weights: &HashMap<i32, f64>, id: i32) -> f64 {
        let w = weights.get(&id).copied().unwrap_or(1.0);
        if w > 0.0 {
            w
        } else {
            1.0
        }
    }
}

/// Splits `budget` across entries `(id, weight, need)` proportionally to
/// weight, with the unused share of under-need entries redistributed to the
/// rest. Returns shares in input order.
fn waterfill(budget: f64, entries: &[(i32, f64, f64)]) -> Vec<f64> {
    let mut shares = vec![0.0; entries.len()];
    if entries.is_empty() || budget <= 0.0 {
        return shares;
    }
    let mut order: Vec<usize> = (0..entries.len()).collect();
    // Satisfy the smallest need-per-weight first so leftovers flow upward.
    order.sort_by(|&a, &b| {
        let na = entries[a].2 / entries[a].1;
        let nb = entries[b].2 / entries[b].1;
        na.partial_cmp(&nb).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut remaining = budget;
    let mut remaining_weight: f64 = entries.iter().map(|e| e.1).sum();
    for idx in order {
        let (_, weight, need) = entries[idx];
        let fair = remaining * weight / remaining_weight;
        let share = need.min(fair);
        shares[idx] = share;
        remaining -= share;
        remaining_weight -= weight;
        if remaining_weight <= 0.0 {
            break;
        }
    }
    shares
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::data_model::MultiItem;
    use crate::format::{MetricMeta, StaticMetaProvider};

    fn pair(metric: i32, size: usize, counter: f64, whale: f64) -> SamplingPair {
        let mut item = MultiItem::new(4);
        item.tail.add_counter_host(counter, 0);
        SamplingPair {
            key: Key::at(100, metric, [0; 16]),
            item,
            whale_weight: whale,
            size,
            account_metric: metric,
            bucket_ts: 100,
        }
    }

    fn empty_maps() -> (HashMap<i32, f64>, HashMap<i32, f64>, HashMap<i32, f64>) {
        (HashMap::new(), HashMap::new(), HashMap::new())
    }

    #[test]
    fn test_under_budget_keeps_everything() {
        let (ns, groups, keys) = empty_maps();
        let mut sampler = Sampler::new(
            4,
            SamplerConfig {
                meta: None,
                sample_namespaces: &ns,
                sample_groups: &groups,
                sample_keys: &keys,
            },
        );
        for i in 0..4 {
            sampler.add(pair(42, 100, f64::from(i + 1), 0.0));
        }
        let mut rng = StdRng::seed_from_u64(1);
        let mut stat = SamplerStatistics::default();
        let mut kept = 0;
        sampler.run(1_000, &mut rng, &mut stat, |_, _, sf, _| {
            assert_eq!(sf, 1.0);
            kept += 1;
        });
        assert_eq!(kept, 4);
        assert_eq!(stat.sample_factors().count(), 0);
        let sizes = stat.items.get(&(0, 0, 42)).expect("stat recorded");
        assert_eq!(sizes.sum_size_keep.value_sum, 400.0);
        assert_eq!(sizes.sum_size_discard.counter, 0.0);
    }

    #[test]
    fn test_over_budget_halves_uniform_items() {
        let (ns, groups, keys) = empty_maps();
        let mut sampler = Sampler::new(
            100,
            SamplerConfig {
                meta: None,
                sample_namespaces: &ns,
                sample_groups: &groups,
                sample_keys: &keys,
            },
        );
        for _ in 0..100 {
            sampler.add(pair(42, 100, 1.0, 1.0));
        }
        let mut rng = StdRng::seed_from_u64(7);
        let mut stat = SamplerStatistics::default();
        let mut kept = 0usize;
        sampler.run(5_000, &mut rng, &mut stat, |_, _, sf, _| {
            assert_eq!(sf, 2.0);
            kept += 1;
        });
        // Uniform whale weights pin nothing; every item flips a 1-in-2 coin.
        assert!((35..=65).contains(&kept), "kept {kept}");

        let sizes = stat.items.get(&(0, 0, 42)).expect("stat recorded");
        assert_eq!(
            sizes.sum_size_keep.value_sum + sizes.sum_size_discard.value_sum,
            10_000.0
        );
        let factors: Vec<_> = stat.sample_factors().collect();
        assert_eq!(factors, vec![(42, 2.0)]);
    }

    #[test]
    fn test_sampling_preserves_expected_counter_sum() {
        let (ns, groups, keys) = empty_maps();
        let mut total = 0.0;
        for seed in 0..200u64 {
            let mut sampler = Sampler::new(
                50,
                SamplerConfig {
                    meta: None,
                    sample_namespaces: &ns,
                    sample_groups: &groups,
                    sample_keys: &keys,
                },
            );
            for i in 0..50 {
                sampler.add(pair(7, 100, f64::from(i % 5 + 1), 0.0));
            }
            let mut rng = StdRng::seed_from_u64(seed);
            let mut stat = SamplerStatistics::default();
            sampler.run(1_000, &mut rng, &mut stat, |_, item, sf, _| {
                total += item.tail.value.counter * sf;
            });
        }
        // True per-run counter sum is 50 items averaging 3.0.
        let mean = total / 200.0;
        assert!((mean - 150.0).abs() < 15.0, "mean {mean}");
    }

    #[test]
    fn test_whales_kept_verbatim() {
        let (ns, groups, keys) = empty_maps();
        let mut sampler = Sampler::new(
            20,
            SamplerConfig {
                meta: None,
                sample_namespaces: &ns,
                sample_groups: &groups,
                sample_keys: &keys,
            },
        );
        // One dominant item plus uniform background.
        sampler.add(pair(42, 100, 500.0, 500.0));
        for _ in 0..19 {
            sampler.add(pair(42, 100, 1.0, 1.0));
        }
        let mut rng = StdRng::seed_from_u64(3);
        let mut stat = SamplerStatistics::default();
        let mut whale_sf = None;
        sampler.run(1_000, &mut rng, &mut stat, |_, item, sf, _| {
            if item.tail.value.counter == 500.0 {
                whale_sf = Some(sf);
            }
        });
        assert_eq!(whale_sf, Some(1.0));
    }

    #[test]
    fn test_deterministic_for_fixed_seed() {
        let (ns, groups, keys) = empty_maps();
        let run = |seed: u64| {
            let mut sampler = Sampler::new(
                40,
                SamplerConfig {
                    meta: None,
                    sample_namespaces: &ns,
                    sample_groups: &groups,
                    sample_keys: &keys,
                },
            );
            for i in 0..40 {
                sampler.add(pair(9, 100, f64::from(i), 0.0));
            }
            let mut rng = StdRng::seed_from_u64(seed);
            let mut stat = SamplerStatistics::default();
            let mut kept = Vec::new();
            sampler.run(2_000, &mut rng, &mut stat, |_, item, _, _| {
                kept.push(item.tail.value.counter as i64);
            });
            kept
        };
        assert_eq!(run(5), run(5));
        assert_ne!(run(5), run(6));
    }

    #[test]
    fn test_namespace_weights_split_budget() {
        let meta = StaticMetaProvider::new();
        let mut m1 = MetricMeta::new(1, "first");
        m1.namespace_id = 10;
        meta.put(m1);
        let mut m2 = MetricMeta::new(2, "second");
        m2.namespace_id = 20;
        meta.put(m2);

        let mut ns = HashMap::new();
        ns.insert(10, 3.0);
        ns.insert(20, 1.0);
        let groups = HashMap::new();
        let keys = HashMap::new();

        let mut sampler = Sampler::new(
            40,
            SamplerConfig {
                meta: Some(&meta),
                sample_namespaces: &ns,
                sample_groups: &groups,
                sample_keys: &keys,
            },
        );
        for _ in 0..20 {
            sampler.add(pair(1, 100, 1.0, 0.0));
            sampler.add(pair(2, 100, 1.0, 0.0));
        }
        let mut rng = StdRng::seed_from_u64(11);
        let mut stat = SamplerStatistics::default();
        sampler.run(2_000, &mut rng, &mut stat, |_, _, _, _| {});

        // Both namespaces need 2000; weight 3 vs 1 splits the 2000 budget
        // 1500 / 500, so the heavier namespace is sampled far more gently.
        assert_eq!(stat.budget.get(&(10, 0)).copied(), Some(1_500.0));
        assert_eq!(stat.budget.get(&(20, 0)).copied(), Some(500.0));
        let factors: HashMap<i32, f64> = stat.sample_factors().collect();
        assert!((factors[&1] - 2_000.0 / 1_500.0).abs() < 1e-9);
        assert!((factors[&2] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_waterfill_redistributes() {
        let shares = waterfill(
            100.0,
            &[(1, 1.0, 10.0), (2, 1.0, 200.0), (3, 1.0, 30.0)],
        );
        assert_eq!(shares[0], 10.0);
        assert_eq!(shares[2], 30.0);
        assert_eq!(shares[1], 60.0);
    }
}
