//! Discipline controller - the cooperative control loop for a rubidium
//! oscillator steered by a GPS PPS reference.
//!
//! Three periodic jobs share one thread:
//! 1. **PPS tick** (every second): read the PPS delta and control register,
//!    run the holdover machine, accumulate the sample.
//! 2. **Drift check**: nudge the DDS when the windowed drift exceeds the
//!    limit, then archive the CalcSlope run.
//! 3. **Health poll**: refresh device health and publish the status snapshot.
//!
//! Long calibration runs (see `calibration.rs`) block the loop on purpose;
//! nothing else may touch the device while one is in progress.

use crate::clock::{Deadline, TickClock};
use crate::config::{ScheduleConfig, SystemConfig};
use crate::engine::DisciplineEngine;
use crate::error::{DisciplineError, Result};
use crate::holdover::{HoldoverAction, HoldoverState};
use crate::regression::Bucket;
use crate::status::DisciplineStatus;
use crate::telemetry::{HealthReport, ModelInfo};
use crate::traits::{DeviceCommandSink, HeartbeatIndicator, TelemetryProvider};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

/// Which jobs ran during one loop iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopEvents {
    pub pps: bool,
    pub drift_check: bool,
    pub adjusted: bool,
    pub health: bool,
    pub idle: bool,
}

// ============================================================================
// DATA STRUCTURES
// ============================================================================

pub struct DisciplineController<V, C, H>
where
    V: TelemetryProvider + DeviceCommandSink,
    C: TickClock,
    H: HeartbeatIndicator,
{
    // Core components
    pub(crate) device: V,
    pub(crate) clock: C,
    pub(crate) heartbeat: H,
    pub(crate) schedule: ScheduleConfig,
    pub(crate) model: ModelInfo,

    pub(crate) engine: DisciplineEngine,
    pub(crate) last_health: Option<HealthReport>,

    // Scheduler
    pps_deadline: Deadline,
    drift_deadline: Deadline,
    health_deadline: Deadline,

    // Counters (for status display)
    pub(crate) calibrating: bool,
    pub(crate) calibrations: u64,
    pub(crate) calibration_attempts: u64,
    recoveries: u64,
    adjustments: u64,

    // Shared status for observers
    status_shared: Arc<RwLock<DisciplineStatus>>,
    status_file: Option<PathBuf>,

    // Cleared by the shutdown handler; checked inside every blocking loop
    running: Arc<AtomicBool>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl<V, C, H> DisciplineController<V, C, H>
where
    V: TelemetryProvider + DeviceCommandSink,
    C: TickClock,
    H: HeartbeatIndicator,
{
    pub fn new(
        device: V,
        clock: C,
        heartbeat: H,
        model: ModelInfo,
        status_shared: Arc<RwLock<DisciplineStatus>>,
        config: SystemConfig,
    ) -> Result<Self> {
        let engine = DisciplineEngine::new(config.discipline.clone(), model.crystal_hz)?;
        let d = &config.discipline;

        info!("=== Rubidium Discipline Controller Initialization ===");
        info!("Unit: {} ({:?}), crystal {} Hz", model.model_text, model.family, model.crystal_hz);
        if let Some(fw) = &model.firmware {
            info!("Firmware: {}", fw);
        }
        info!("Calibration: {} samples, spike trigger {}", d.discipline_entries, d.pps_trigger);
        info!("Drift loop: window={}, limit={}, step={:.1} DDS units",
              d.drift_window, d.drift_limit, d.increment_unit());
        info!("Initial DDS: {:.1}", d.initial_dds);
        info!("=== Ready ===");

        let schedule = config.schedule.clone();
        let pps_deadline = Deadline::after(&clock, schedule.tick());
        let drift_deadline = Deadline::after(&clock, schedule.ticks(d.initial_adjust_ticks()));
        let health_deadline = Deadline::after(&clock, schedule.ticks(schedule.health_initial_ticks));

        let controller = DisciplineController {
            device,
            clock,
            heartbeat,
            schedule,
            model,
            engine,
            last_health: None,
            pps_deadline,
            drift_deadline,
            health_deadline,
            calibrating: false,
            calibrations: 0,
            calibration_attempts: 0,
            recoveries: 0,
            adjustments: 0,
            status_shared,
            status_file: None,
            running: Arc::new(AtomicBool::new(true)),
        };
        controller.update_shared_status();
        Ok(controller)
    }

    /// Identify the unit first, then build the controller around it.
    pub fn connect(
        mut device: V,
        clock: C,
        heartbeat: H,
        status_shared: Arc<RwLock<DisciplineStatus>>,
        config: SystemConfig,
    ) -> Result<Self> {
        let model = device.identify()?;
        Self::new(device, clock, heartbeat, model, status_shared, config)
    }

    /// Also mirror every status update into a JSON file.
    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_file = Some(path);
        self
    }

    /// Share the shutdown flag so startup, calibration and the main loop
    /// all stop when it clears.
    pub fn with_shutdown_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    pub fn get_status_shared(&self) -> Arc<RwLock<DisciplineStatus>> {
        self.status_shared.clone()
    }

    pub fn engine(&self) -> &DisciplineEngine {
        &self.engine
    }

    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    pub fn calibrations(&self) -> u64 {
        self.calibrations
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    pub fn adjustments(&self) -> u64 {
        self.adjustments
    }

    /// Clear the control register, wait for rubidium lock, then calibrate
    /// from the configured initial DDS value until a run succeeds.
    ///
    /// Returns [`DisciplineError::Interrupted`] if the shutdown flag clears
    /// first.
    pub fn startup(&mut self) -> Result<()> {
        self.device.set_control_register(0)?;
        self.wait_for_lock()?;

        let initial = self.engine.config().initial_dds;
        let report = self.calibrate_until_success(Bucket::Initial, initial)?;
        info!("Initial calibration done: DDS {:.1} -> {:.1}", report.old_dds, report.new_dds);
        self.engine.rebase_drift_offset();

        self.arm_schedule();
        self.update_shared_status();
        Ok(())
    }

    /// Run the loop until the shutdown flag clears, then drain the channel.
    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown_requested() {
            match self.process_loop_iteration() {
                Ok(_) | Err(DisciplineError::Interrupted) => {}
                Err(e) => return Err(e),
            }
        }
        info!("Stopping, draining telemetry channel");
        self.device.drain()?;
        self.update_shared_status();
        Ok(())
    }

    pub fn log_status(&self) {
        let e = &self.engine;
        let health = self.last_health.as_ref();
        info!(
            "[Status] mode={} DDS={:.1} delta={} drift={:+.3} samples={} | ctl=0x{:04X} temp={} htr={} lamp={} pwrhrs={}",
            self.mode_name(),
            e.dds().value,
            e.pps_corrected(),
            e.drift_average(),
            e.sample_counter(),
            e.control_register(),
            fmt_opt(health.and_then(|h| h.temperature_c)),
            fmt_opt(health.and_then(|h| h.heater_voltage)),
            fmt_opt(health.and_then(|h| h.lamp_voltage)),
            health.and_then(|h| h.power_hours).map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
        );
    }

    /// One pass of the cooperative scheduler.
    ///
    /// PPS runs first. A drift check and a health poll never share an
    /// iteration, and the loop idles only when neither was due.
    pub fn process_loop_iteration(&mut self) -> Result<LoopEvents> {
        let mut events = LoopEvents::default();

        if self.pps_deadline.is_due(&self.clock) {
            self.pps_deadline.reschedule(&self.clock, self.schedule.tick());
            events.pps = true;
            if !self.pps_tick()? {
                return Ok(events);
            }
        }

        if self.drift_deadline.is_due(&self.clock) {
            events.drift_check = true;
            events.adjusted = self.drift_tick()?;
        } else if self.health_deadline.is_due(&self.clock) {
            self.health_deadline.reschedule(&self.clock, self.ticks(self.schedule.health_interval_ticks));
            events.health = true;
            self.health_tick()?;
        } else {
            events.idle = true;
            self.clock.sleep(self.schedule.idle_sleep());
        }

        Ok(events)
    }

    // ========================================================================
    // PERIODIC JOBS
    // ========================================================================

    /// Returns false when the rest of the iteration should be skipped.
    fn pps_tick(&mut self) -> Result<bool> {
        let raw = self.device.pps_delta()?;
        self.engine.observe_pps_delta(raw);
        let ctl = self.device.control_register()?;
        self.engine.observe_control_register(ctl);
        self.heartbeat.toggle();

        let sample = self.engine.holdover_sample();
        match self.engine.holdover.evaluate(&sample) {
            HoldoverAction::Accumulate => {
                self.engine.accumulate_current();
                Ok(true)
            }
            HoldoverAction::Suspend => {
                self.engine.track_placeholder();
                Ok(false)
            }
            HoldoverAction::DiscardSpike => {
                self.engine.regression.reset(Bucket::CalcSlope);
                self.engine.track_placeholder();
                Ok(false)
            }
            HoldoverAction::Recover => {
                self.recover_from_holdover()?;
                Ok(false)
            }
        }
    }

    fn recover_from_holdover(&mut self) -> Result<()> {
        let dds = self.engine.dds().value;
        info!("[Holdover] recalibrating from DDS {:.1}", dds);
        self.calibrate_until_success(Bucket::Holdover, dds)?;

        self.engine.regression.reset(Bucket::CalcSlope);
        self.engine.holdover.complete_recovery();
        // The calibration re-zeroed the delta register
        self.engine.rebase_drift_offset();
        self.engine.flush_drift_window();
        self.recoveries += 1;
        self.update_shared_status();
        Ok(())
    }

    /// Returns true when the DDS was adjusted.
    fn drift_tick(&mut self) -> Result<bool> {
        let settle = self.ticks(self.engine.config().settle_ticks());

        if self.engine.holdover().is_holding() {
            debug!("[DDS] holding over, drift check postponed");
            self.drift_deadline.reschedule(&self.clock, settle);
            return Ok(false);
        }

        if self.engine.check_and_adjust(&mut self.device)? {
            self.adjustments += 1;
            self.drift_deadline.reschedule(&self.clock, settle);
            self.engine.archive_calc_slope();
            self.update_shared_status();
            Ok(true)
        } else {
            let interval = self.ticks(self.engine.config().dds_check_interval);
            self.drift_deadline.reschedule(&self.clock, interval);
            Ok(false)
        }
    }

    fn health_tick(&mut self) -> Result<()> {
        let report = self.device.health()?;
        self.engine.observe_control_register(report.control_register);
        self.last_health = Some(report);
        self.update_shared_status();
        self.log_status();
        Ok(())
    }

    // ========================================================================
    // STARTUP HELPERS
    // ========================================================================

    fn wait_for_lock(&mut self) -> Result<()> {
        let ctl = self.device.control_register()?;
        self.engine.observe_control_register(ctl);
        if !self.engine.lock_bad() {
            info!("Rubidium lock is good");
            return Ok(());
        }

        warn!("Rubidium lock is bad, waiting for lock..");
        let mut polls = 0u64;
        while self.engine.lock_bad() {
            self.check_shutdown()?;
            if let Some(limit) = self.schedule.wait_poll_limit {
                if polls >= limit {
                    return Err(DisciplineError::LockNotAcquired { polls });
                }
            }
            let ctl = self.device.control_register()?;
            self.engine.observe_control_register(ctl);
            self.clock.sleep(self.schedule.lock_wait());
            self.heartbeat.toggle();
            polls += 1;
        }
        info!("Rubidium lock acquired after {} polls", polls);
        Ok(())
    }

    fn arm_schedule(&mut self) {
        let d = self.engine.config();
        let first_check = self.ticks(d.initial_adjust_ticks());
        let first_health = self.ticks(self.schedule.health_initial_ticks);
        self.pps_deadline.reschedule(&self.clock, self.schedule.tick());
        self.drift_deadline.reschedule(&self.clock, first_check);
        self.health_deadline.reschedule(&self.clock, first_health);
    }

    fn ticks(&self, n: u64) -> Duration {
        self.schedule.ticks(n)
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn check_shutdown(&self) -> Result<()> {
        if self.shutdown_requested() {
            info!("Shutdown requested, abandoning {}", self.mode_name());
            return Err(DisciplineError::Interrupted);
        }
        Ok(())
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    fn mode_name(&self) -> &'static str {
        if self.calibrating {
            return "CALIBRATING";
        }
        match self.engine.holdover().state() {
            HoldoverState::Normal if self.calibrations == 0 => "STARTUP",
            HoldoverState::Normal => "DISCIPLINE",
            HoldoverState::SpikeSuspect => "HOLDOVER-SPIKE",
            HoldoverState::LockLost => "HOLDOVER-LOCK",
        }
    }

    pub(crate) fn update_shared_status(&self) {
        let snapshot = if let Ok(mut status) = self.status_shared.write() {
            let e = &self.engine;
            status.mode = self.mode_name().to_string();
            status.dds_value = e.dds().value;
            status.holdover = match e.holdover().state() {
                HoldoverState::Normal => "NORMAL",
                HoldoverState::SpikeSuspect => "SPIKE-SUSPECT",
                HoldoverState::LockLost => "LOCK-LOST",
            }
            .to_string();
            status.pps_raw = e.pps_raw();
            status.pps_delta = e.pps_corrected();
            status.pps_adjusted = e.pps_corrected() - e.pps_offset();
            status.drift_offset = e.pps_offset();
            status.running_slope = e.regression().slope(Bucket::Running);
            status.calc_slope = e.regression().slope(Bucket::CalcSlope);
            status.drift_average = e.drift_average();
            status.sample_counter = e.sample_counter();
            status.calibrations = self.calibrations;
            status.adjustments = self.adjustments;
            status.updated_ts = SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();

            status.rb_locked = !e.lock_bad();
            status.control_register = e.control_register();
            status.crystal_hz = self.model.crystal_hz;
            status.model = self.model.model_text.clone();
            status.serial = self.model.serial.clone();
            if let Some(h) = &self.last_health {
                status.temperature_c = h.temperature_c;
                status.heater_voltage = h.heater_voltage;
                status.lamp_voltage = h.lamp_voltage;
                status.power_hours = h.power_hours;
            }
            Some(status.clone())
        } else {
            None
        };

        if let (Some(path), Some(snapshot)) = (&self.status_file, snapshot) {
            if let Err(e) = snapshot.write_json(path) {
                warn!("Status file update failed: {:#}", e);
            }
        }
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{:.2}", x)).unwrap_or_else(|| "-".to_string())
}

// ============================================================================
// TESTS
// ============================================================================
