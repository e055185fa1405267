//! Low-amplitude DDS correction from the drift window.
//!
//! Between calibrations the loop nudges the DDS by whole increments whenever
//! the average drift over the window exceeds the drift limit, then re-zeroes
//! the drift reference so the next window starts fresh.

use crate::dds::round_tenth;
use crate::engine::DisciplineEngine;
use crate::error::Result;
use crate::regression::Bucket;
use crate::traits::DeviceCommandSink;
use log::{debug, info};

impl DisciplineEngine {
    /// Returns true when an adjustment was pushed to the device.
    pub fn check_and_adjust<D>(&mut self, sink: &mut D) -> Result<bool>
    where
        D: DeviceCommandSink + ?Sized,
    {
        let (window, limit, warmup, increment) = {
            let c = self.config();
            (c.drift_window, c.drift_limit, c.dds_check_interval, c.increment_unit())
        };

        if self.sample_counter() <= warmup {
            return Ok(false);
        }

        let sum = self.drift.windowed_sum(window);
        let average = sum as f64 / window as f64;
        if average.abs() < limit {
            debug!("[DDS] drift avg {:+.3} within limit {}", average, limit);
            return Ok(false);
        }

        let multiplier = (average / limit).round();
        let new_value = round_tenth(self.dds.value + multiplier * increment);
        info!("[DDS] {}", step_summary(average, sum, multiplier, self.dds.value, new_value));

        self.dds.replace(new_value);
        self.rebase_drift_offset();
        sink.set_dds_value(new_value)?;
        Ok(true)
    }

    /// Snapshot CalcSlope into the discipline bucket matching its length,
    /// then start a fresh CalcSlope run.
    pub fn archive_calc_slope(&mut self) -> Bucket {
        let entries = self.config().discipline_entries;
        let count = self.regression.get(Bucket::CalcSlope).count;

        let target = if count >= 2 * entries {
            Bucket::UltraLongDiscipline
        } else if count >= entries {
            Bucket::Discipline
        } else if count >= entries / 2 {
            Bucket::ShortDiscipline
        } else {
            Bucket::UltraShortDiscipline
        };

        let dds = self.dds;
        let counter = self.sample_counter();
        self.regression.archive(Bucket::CalcSlope, target);
        let archived = self.regression.get_mut(target);
        archived.dds_value = dds.value;
        archived.old_dds_value = dds.previous;
        archived.timestamp = counter;
        self.regression.reset(Bucket::CalcSlope);

        debug!("[DDS] archived {} CalcSlope samples as {:?}", count, target);
        target
    }
}

fn step_summary(average: f64, sum: i64, multiplier: f64, old: f64, new: f64) -> String {
    format!("drift avg {:+.3} (sum {}) -> x{} step, DDS {:.1} -> {:.1}", average, sum, multiplier, old, new)
}
