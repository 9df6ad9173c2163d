//! Weighted centroid digest backing percentile metrics.
//!
//! Bounded-memory quantile summary: incoming `(value, weight)` points are
//! buffered, then folded into a sorted centroid list under a scale function
//! that keeps centroids small near the distribution tails. The centroid list
//! is exactly what the wire format ships, so it is exposed for marshalling.

/// One centroid: mean of the merged points and their total weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub mean: f64,
    pub weight: f64,
}

impl Centroid {
    fn absorb(&mut self, other: &Centroid) {
        let total = self.weight + other.weight;
        if total > 0.0 {
            self.mean = (self.mean * self.weight + other.mean * other.weight) / total;
            self.weight = total;
        }
    }
}

/// Streaming quantile digest with weighted insertion.
#[derive(Debug, Clone)]
pub struct CentroidDigest {
    compression: f64,
    /// Flushed centroids, sorted by mean.
    centroids: Vec<Centroid>,
    /// Unprocessed points since the last flush.
    buffer: Vec<Centroid>,
    total_weight: f64,
}

impl CentroidDigest {
    pub fn new(compression: f64) -> Self {
        Self {
            compression: compression.max(1.0),
            centroids: Vec::new(),
            buffer: Vec::new(),
            total_weight: 0.0,
        }
    }

    /// Rebuilds a digest from previously flushed centroids (sorted by mean),
    /// as produced by `centroids()`.
    pub fn from_parts(compression: f64, centroids: Vec<Centroid>) -> Self {
        let total_weight = centroids.iter().map(|c| c.weight).sum();
        Self {
            compression: compression.max(1.0),
            centroids,
            buffer: Vec::new(),
            total_weight,
        }
    }

    pub fn compression(&self) -> f64 {
        self.compression
    }

    /// Adds one observation with the given weight. Non-finite or non-positive
    /// weights are ignored.
    pub fn add(&mut self, value: f64, weight: f64) {
        if !value.is_finite() || !weight.is_finite() || weight <= 0.0 {
            return;
        }
        self.buffer.push(Centroid {
            mean: value,
            weight,
        });
        self.total_weight += weight;
        if self.buffer.len() >= self.buffer_capacity() {
            self.flush();
        }
    }

    /// Folds another digest into this one.
    pub fn merge(&mut self, other: &Self) {
        for c in other.centroids.iter().chain(other.buffer.iter()) {
            self.buffer.push(*c);
            self.total_weight += c.weight;
        }
        if self.buffer.len() >= self.buffer_capacity() {
            self.flush();
        }
    }

    /// Total weight of all accepted points.
    pub fn count(&self) -> f64 {
        self.total_weight
    }

    /// Upper bound on centroids a flush would produce, without flushing.
    pub fn point_count(&self) -> usize {
        self.centroids.len() + self.buffer.len()
    }

    /// Flushes pending points and returns the sorted centroid list.
    pub fn centroids(&mut self) -> &[Centroid] {
        self.flush();
        &self.centroids
    }

    /// Estimates the value at quantile `q` in [0, 1] by interpolating over
    /// cumulative centroid weight. Returns None when empty.
    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        self.flush();
        if self.centroids.is_empty() || !(0.0..=1.0).contains(&q) {
            return None;
        }
        let target = q * self.total_weight;
        let mut cum = 0.0;
        for (i, c) in self.centroids.iter().enumerate() {
            if cum + c.weight >= target {
                // Interpolate toward the neighboring mean.
                let frac = if c.weight > 0.0 {
                    (target - cum) / c.weight
                } else {
                    0.5
                };
                let lo = if i == 0 {
                    c.mean
                } else {
                    (self.centroids[i - 1].mean + c.mean) / 2.0
                };
                let hi = if i + 1 == self.centroids.len() {
                    c.mean
                } else {
                    (c.mean + self.centroids[i + 1].mean) / 2.0
                };
                return Some(lo + frac * (hi - lo));
            }
            cum += c.weight;
        }
        self.centroids.last().map(|c| c.mean)
    }

    fn buffer_capacity(&self) -> usize {
        (self.compression * 2.0) as usize
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut all = std::mem::take(&mut self.centroids);
        all.append(&mut self.buffer);
        all.sort_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap_or(std::cmp::Ordering::Equal));
        self.centroids = self.compact(all);
    }

    /// Merges adjacent centroids while each stays under the scale-function
    /// weight limit at its quantile position.
    fn compact(&self, sorted: Vec<Centroid>) -> Vec<Centroid> {
        let mut result = Vec::new();
        let mut iter = sorted.into_iter();
        let Some(mut current) = iter.next() else {
            return result;
        };
        let mut weight_so_far = 0.0;
        for c in iter {
            let proposed = current.weight + c.weight;
            let q = (weight_so_far + proposed / 2.0) / self.total_weight.max(1.0);
            if proposed <= self.weight_limit(q) {
                current.absorb(&c);
            } else {
                weight_so_far += current.weight;
                result.push(current);
                current = c;
            }
        }
        result.push(current);
        result
    }

    fn weight_limit(&self, q: f64) -> f64 {
        let q = q.clamp(0.0001, 0.9999);
        (self.compression * (q * (1.0 - q)).sqrt() * 4.0).max(1.0)
    }
}
