//! Discipline state aggregate.
//!
//! Everything the control loop mutates lives here: regression buckets, the
//! drift window, the DDS value, the holdover machine and the latest device
//! readings. The controller owns one engine and hands it to each step by
//! exclusive reference.

use crate::config::DisciplineConfig;
use crate::dds::DdsState;
use crate::drift::DriftRingBuffer;
use crate::error::{DisciplineError, Result};
use crate::holdover::{HoldoverMachine, HoldoverSample};
use crate::regression::{Bucket, RegressionAccumulator};
use crate::rollover::{advance_sample_counter, correct_rollover};
use log::trace;

pub struct DisciplineEngine {
    config: DisciplineConfig,
    crystal_hz: u64,

    pub(crate) regression: RegressionAccumulator,
    pub(crate) drift: DriftRingBuffer,
    pub(crate) holdover: HoldoverMachine,
    pub(crate) dds: DdsState,

    // Latest two raw PPS delta readings
    pps_raw: u64,
    pps_prev_raw: u64,

    /// Corrected delta at the last drift adjustment; drift samples are
    /// stored relative to it.
    pps_offset: i64,

    /// Samples tracked since start, wrapping at `pps_rollover`.
    sample_counter: u64,

    control_register: u32,
}

impl DisciplineEngine {
    pub fn new(config: DisciplineConfig, crystal_hz: u64) -> Result<Self> {
        if crystal_hz == 0 {
            return Err(DisciplineError::schema("CRYSTAL"));
        }

        Ok(DisciplineEngine {
            regression: RegressionAccumulator::new(crystal_hz),
            drift: DriftRingBuffer::new(config.ring_capacity()),
            holdover: HoldoverMachine::new(config.pps_trigger),
            dds: DdsState::new(config.initial_dds),
            crystal_hz,
            pps_raw: 0,
            pps_prev_raw: 0,
            pps_offset: 0,
            sample_counter: 0,
            control_register: 0,
            config,
        })
    }

    pub fn config(&self) -> &DisciplineConfig {
        &self.config
    }

    pub fn crystal_hz(&self) -> u64 {
        self.crystal_hz
    }

    pub fn regression(&self) -> &RegressionAccumulator {
        &self.regression
    }

    pub fn drift(&self) -> &DriftRingBuffer {
        &self.drift
    }

    pub fn holdover(&self) -> &HoldoverMachine {
        &self.holdover
    }

    pub fn dds(&self) -> DdsState {
        self.dds
    }

    pub fn sample_counter(&self) -> u64 {
        self.sample_counter
    }

    pub fn pps_offset(&self) -> i64 {
        self.pps_offset
    }

    pub fn correct(&self, raw: u64) -> i64 {
        correct_rollover(raw, self.crystal_hz)
    }

    // ------------------------------------------------------------------
    // Device readings
    // ------------------------------------------------------------------

    pub fn observe_pps_delta(&mut self, raw: u64) {
        self.pps_prev_raw = self.pps_raw;
        self.pps_raw = raw;
    }

    pub fn observe_control_register(&mut self, value: u32) {
        self.control_register = value;
    }

    pub fn pps_raw(&self) -> u64 {
        self.pps_raw
    }

    pub fn pps_corrected(&self) -> i64 {
        self.correct(self.pps_raw)
    }

    /// corrected(previous) - corrected(current)
    pub fn pps_diff(&self) -> i64 {
        self.correct(self.pps_prev_raw) - self.correct(self.pps_raw)
    }

    pub fn control_register(&self) -> u32 {
        self.control_register
    }

    pub fn lock_bad(&self) -> bool {
        self.control_register & self.config.lock_bad_mask != 0
    }

    pub fn spike_detected(&self) -> bool {
        self.pps_diff().abs() >= self.config.pps_trigger
    }

    // ------------------------------------------------------------------
    // Sample tracking
    // ------------------------------------------------------------------

    /// Feed the current reading into Running, CalcSlope and the drift window.
    pub fn accumulate_current(&mut self) {
        let value = self.pps_corrected();

        for bucket in [Bucket::Running, Bucket::CalcSlope] {
            let count = self.regression.get(bucket).count as u64;
            if count + 1 > self.config.pps_rollover {
                self.regression.reset(bucket);
            }
            let weight = self.regression.get(bucket).count + 1;
            self.regression.accumulate(bucket, value, weight);
        }

        self.track_sample(value - self.pps_offset);
        trace!("sample #{} delta={} ({}) drift={}",
               self.sample_counter, self.pps_raw, value, value - self.pps_offset);
    }

    /// Keep the drift window moving while holding over.
    pub fn track_placeholder(&mut self) {
        self.track_sample(0);
    }

    fn track_sample(&mut self, value: i64) {
        self.drift.push(value);
        self.sample_counter = advance_sample_counter(self.sample_counter, self.config.pps_rollover);
    }

    /// Average drift per sample over the drift window.
    pub fn drift_average(&self) -> f64 {
        let window = self.config.drift_window;
        self.drift.windowed_sum(window) as f64 / window as f64
    }

    /// Re-zero the drift reference at the current corrected delta.
    pub fn rebase_drift_offset(&mut self) {
        self.pps_offset = self.pps_corrected();
    }

    pub fn holdover_sample(&self) -> HoldoverSample {
        HoldoverSample {
            lock_bad: self.lock_bad(),
            diff: self.pps_diff(),
            current: self.pps_corrected(),
            previous: self.correct(self.pps_prev_raw),
            sample_counter: self.sample_counter,
            dds: self.dds,
        }
    }

    /// Drop holdover-era samples from the drift window.
    pub fn flush_drift_window(&mut self) {
        self.drift.flush_recent(self.config.drift_window);
    }
}
