//! Long-run frequency calibration.
//!
//! A calibration zeroes the PPS delta register, collects `discipline_entries`
//! one-second samples into a regression bucket and converts the fitted slope
//! into a DDS correction. The run blocks the control loop; aborts (lock lost,
//! PPS spike) are recoverable and the retry loop simply starts over from the
//! same DDS value.

use crate::clock::{Deadline, TickClock};
use crate::controller::DisciplineController;
use crate::dds::{exceeds_hysteresis, quantize_offset, round_tenth};
use crate::error::{CalibrationAbort, Result};
use crate::regression::Bucket;
use crate::traits::{DeviceCommandSink, HeartbeatIndicator, TelemetryProvider};
use log::{debug, info, warn};
use serde::Serialize;

/// Outcome of one successful calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub bucket: Bucket,
    pub samples: u32,
    /// Fitted slope as fractional frequency.
    pub slope: f64,
    /// slope / dds_base_value before quantisation
    pub raw_offset: f64,
    pub quantized_offset: f64,
    pub old_dds: f64,
    pub new_dds: f64,
    /// False when the correction fell inside the hysteresis band.
    pub applied: bool,
}

impl<V, C, H> DisciplineController<V, C, H>
where
    V: TelemetryProvider + DeviceCommandSink,
    C: TickClock,
    H: HeartbeatIndicator,
{
    /// Retry [`run_calibration`](Self::run_calibration) until it succeeds.
    ///
    /// Only calibration aborts are retried; transport, schema and shutdown
    /// errors go straight to the caller. `calibration_attempt_limit` bounds the retries.
    pub fn calibrate_until_success(&mut self, bucket: Bucket, starting_dds: f64) -> Result<CalibrationReport> {
        let target = self.engine.config().discipline_entries;
        let mut attempts = 0u32;

        self.calibrating = true;
        self.update_shared_status();

        let outcome = loop {
            attempts += 1;
            match self.run_calibration(bucket, starting_dds, target) {
                Ok(report) => break Ok(report),
                Err(e) if e.is_recoverable() => {
                    warn!("[Cal] attempt {} of {:?} failed: {}, restarting", attempts, bucket, e);
                    if let Some(limit) = self.schedule.calibration_attempt_limit {
                        if attempts >= limit {
                            break Err(e);
                        }
                    }
                }
                Err(e) => break Err(e),
            }
        };

        self.calibrating = false;
        if outcome.is_ok() {
            self.calibrations += 1;
        }
        self.update_shared_status();
        outcome
    }

    /// One calibration run of `target` samples into `bucket`, starting from
    /// `starting_dds`.
    pub fn run_calibration(&mut self, bucket: Bucket, starting_dds: f64, target: u32) -> Result<CalibrationReport> {
        self.calibration_attempts += 1;

        // Fresh view of the unit before we start
        let raw = self.device.pps_delta()?;
        self.engine.observe_pps_delta(raw);
        let health = self.device.health()?;
        self.engine.observe_control_register(health.control_register);
        self.last_health = Some(health);

        info!("[Cal] {:?}: {} samples from DDS {:.1}", bucket, target, starting_dds);
        self.engine.dds.value = starting_dds;
        self.device.set_dds_value(starting_dds)?;
        self.zero_pps_delta()?;
        self.engine.regression.reset(bucket);

        let raw = self.device.pps_delta()?;
        self.engine.observe_pps_delta(raw);
        let ctl = self.device.control_register()?;
        self.engine.observe_control_register(ctl);

        let tick = self.schedule.tick();
        let idle = self.schedule.idle_sleep();
        let mut deadline = Deadline::after(&self.clock, tick);
        let mut samples = 0u32;
        let mut total = 0i64;
        let mut reported = true;

        while samples < target {
            self.check_shutdown()?;
            if !deadline.is_due(&self.clock) {
                if !reported && samples % 100 == 0 {
                    self.log_progress(bucket, samples, target, total);
                    reported = true;
                }
                self.clock.sleep(idle);
                continue;
            }

            let raw = self.device.pps_delta()?;
            self.engine.observe_pps_delta(raw);
            let ctl = self.device.control_register()?;
            self.engine.observe_control_register(ctl);
            self.heartbeat.toggle();

            if self.engine.lock_bad() {
                warn!("[Cal] rubidium lock lost after {} samples", samples);
                return Err(CalibrationAbort::LockLost.into());
            }
            if self.engine.spike_detected() {
                let diff = self.engine.pps_diff();
                warn!("[Cal] PPS spike (diff {}) after {} samples", diff, samples);
                return Err(CalibrationAbort::Spike { diff }.into());
            }

            deadline.reschedule(&self.clock, tick);
            let value = self.engine.pps_corrected();
            samples += 1;
            self.engine.regression.accumulate(bucket, value, samples);
            total += value;
            reported = false;
        }

        let config = self.engine.config();
        let (base, increment) = (config.dds_base_value, config.increment_unit());
        let counter = self.engine.sample_counter();

        let slope = self.engine.regression().slope(bucket);
        let raw_offset = slope / base;
        let quantized_offset = quantize_offset(raw_offset);
        let applied = exceeds_hysteresis(quantized_offset, increment);
        let new_dds = if applied { round_tenth(starting_dds + quantized_offset) } else { starting_dds };

        let stats = self.engine.regression.get_mut(bucket);
        stats.count = target;
        stats.old_dds_value = starting_dds;
        stats.dds_value = new_dds;
        stats.timestamp = counter;

        info!("[Cal] {:?} done: slope {:.4e}, offset {:+.3} -> {:+.1} ({})",
              bucket, slope, raw_offset, quantized_offset,
              if applied { "applied" } else { "within hysteresis" });

        if applied {
            info!("[Cal] DDS {:.1} -> {:.1}", starting_dds, new_dds);
            self.engine.dds.value = new_dds;
            self.device.set_dds_value(new_dds)?;
        }
        self.zero_pps_delta()?;

        Ok(CalibrationReport {
            bucket,
            samples: target,
            slope,
            raw_offset,
            quantized_offset,
            old_dds: starting_dds,
            new_dds,
            applied,
        })
    }

    /// Zero the PPS delta register and wait until it reads back zero.
    ///
    /// The zero command is re-sent every `zero_retry_every` polls. Without a
    /// `wait_poll_limit` this waits forever on a unit that never confirms.
    pub fn zero_pps_delta(&mut self) -> Result<()> {
        let observed = self.device.pps_delta()?;
        self.engine.observe_pps_delta(observed);
        debug!("[Cal] zeroing PPS delta (was {})", observed);
        self.device.zero_pps_delta_to(observed)?;

        let mut raw = self.device.pps_delta()?;
        self.engine.observe_pps_delta(raw);
        let mut retry = 1u32;
        let mut polls = 0u64;

        while raw != 0 {
            self.check_shutdown()?;
            if let Some(limit) = self.schedule.wait_poll_limit {
                if polls >= limit {
                    warn!("[Cal] PPS delta still {} after {} polls", raw, polls);
                    return Err(CalibrationAbort::ZeroNotConfirmed { polls }.into());
                }
            }
            self.clock.sleep(self.schedule.zero_wait());
            self.heartbeat.toggle();
            raw = self.device.pps_delta()?;
            self.engine.observe_pps_delta(raw);
            polls += 1;
            retry += 1;

            if retry > self.schedule.zero_retry_every && raw != 0 {
                debug!("[Cal] re-sending zero (delta {})", raw);
                self.device.zero_pps_delta_to(raw)?;
                retry = 1;
            }
        }
        Ok(())
    }

    fn log_progress(&self, bucket: Bucket, samples: u32, target: u32, total: i64) {
        if samples == 0 {
            return;
        }
        let average = total as f64 / samples as f64;
        if samples % 200 == 0 {
            let slope = self.engine.regression().slope(bucket);
            info!("[Cal] {:?} {}/{} avg {:+.3} slope {:.4e}", bucket, samples, target, average, slope);
        } else {
            debug!("[Cal] {:?} {}/{} avg {:+.3}", bucket, samples, target, average);
        }
    }
}
