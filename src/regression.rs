//! Incremental least-squares statistics over PPS delta samples.
//!
//! Each bucket regresses the rollover-corrected delta (y) against the 1-based
//! sample index (x). Only running sums are kept, so a bucket costs the same
//! after ten samples as after ten million.

use serde::Serialize;

/// Named accumulator slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Bucket {
    /// Startup calibration.
    Initial,
    /// Everything since start (reset only on counter overflow).
    Running,
    /// Recalibration after a lock-loss holdover.
    Holdover,
    /// Unused slot kept so the layout matches archived logs.
    Reserved,
    /// Samples since the last DDS adjustment.
    CalcSlope,
    UltraShortDiscipline,
    ShortDiscipline,
    Discipline,
    UltraLongDiscipline,
}

impl Bucket {
    pub const COUNT: usize = 9;

    pub const ALL: [Bucket; Bucket::COUNT] = [
        Bucket::Initial,
        Bucket::Running,
        Bucket::Holdover,
        Bucket::Reserved,
        Bucket::CalcSlope,
        Bucket::UltraShortDiscipline,
        Bucket::ShortDiscipline,
        Bucket::Discipline,
        Bucket::UltraLongDiscipline,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Running sums for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BucketStats {
    /// Weight of the most recent sample; equals the sample count while
    /// callers feed 1-based indices.
    pub count: u32,
    pub cumulative_count: i64,
    pub cumulative_value: f64,
    pub sum_xx: f64,
    pub sum_yy: f64,
    pub sum_xy: f64,
    pub dds_value: f64,
    pub old_dds_value: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct RegressionAccumulator {
    buckets: [BucketStats; Bucket::COUNT],
    crystal_hz: f64,
}

impl RegressionAccumulator {
    pub fn new(crystal_hz: u64) -> Self {
        RegressionAccumulator {
            buckets: [BucketStats::default(); Bucket::COUNT],
            crystal_hz: crystal_hz as f64,
        }
    }

    pub fn get(&self, bucket: Bucket) -> &BucketStats {
        &self.buckets[bucket.index()]
    }

    pub fn get_mut(&mut self, bucket: Bucket) -> &mut BucketStats {
        &mut self.buckets[bucket.index()]
    }

    /// Add one (weight, value) point. `weight` is the 1-based sample index
    /// within the current run, not a constant.
    pub fn accumulate(&mut self, bucket: Bucket, value: i64, weight: u32) {
        let b = &mut self.buckets[bucket.index()];
        let x = weight as f64;
        let y = value as f64;

        b.count = weight;
        b.cumulative_count += weight as i64;
        b.cumulative_value += y;
        b.sum_xx += x * x;
        b.sum_yy += y * y;
        b.sum_xy += y * x;
    }

    /// Least-squares slope of value vs. sample index, normalised by the
    /// crystal frequency into a fractional frequency offset.
    pub fn slope(&self, bucket: Bucket) -> f64 {
        let b = &self.buckets[bucket.index()];
        if b.count == 0 {
            return 0.0;
        }

        let n = b.count as f64;
        let sum_x = b.cumulative_count as f64;
        let sxy = (b.sum_xy - sum_x * b.cumulative_value / n) * n;
        let sxx = (b.sum_xx - sum_x * sum_x / n) * n;
        if sxx == 0.0 {
            return 0.0;
        }

        sxy / sxx / self.crystal_hz
    }

    /// Overwrite `to` with a copy of `from`.
    pub fn archive(&mut self, from: Bucket, to: Bucket) {
        self.buckets[to.index()] = self.buckets[from.index()];
    }

    pub fn reset(&mut self, bucket: Bucket) {
        self.buckets[bucket.index()] = BucketStats::default();
    }

    pub fn snapshot(&self) -> Vec<(Bucket, BucketStats)> {
        Bucket::ALL.iter().map(|&b| (b, *self.get(b))).collect()
    }
}
