//! Simulated oscillator and virtual clock for unit tests.
//!
//! Sleeping on the [`SimClock`] advances simulated time, and the
//! [`SimDevice`] PPS delta evolves with whatever DDS value was last pushed.
//! Both share one [`SimState`], so blocking loops finish instantly.

use crate::clock::TickClock;
use crate::error::Result;
use crate::telemetry::{HealthReport, ModelFamily, ModelInfo};
use crate::traits::{DeviceCommandSink, TelemetryProvider};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const CRYSTAL: u64 = 60_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum SimCommand {
    SetDds(f64),
    Zero(u64),
    SetControl(u32),
}

pub struct SimState {
    pub now_ns: u64,
    pub crystal_hz: u64,
    /// DDS value at which the oscillator has zero drift.
    pub natural_dds: f64,
    pub dds: f64,
    phase: f64,
    latched: f64,
    zero_ref: f64,
    /// Seconds `[from, to)` during which the lock-bad bit is set.
    pub lock_bad_window: Option<(u64, u64)>,
    /// Seconds `[from, to)` during which the reading is displaced.
    pub spike_window: Option<(u64, u64, i64)>,
    /// Fail every transport call once set.
    pub fail_transport: bool,
    /// Never let the delta confirm zero.
    pub stuck_delta: Option<u64>,
    /// Clear this flag once simulated time reaches the given second.
    pub stop_at: Option<(u64, Arc<AtomicBool>)>,
    pub commands: Vec<SimCommand>,
}

impl SimState {
    pub fn secs(&self) -> u64 {
        self.now_ns / 1_000_000_000
    }

    fn advance(&mut self, duration: Duration) {
        let before = self.secs();
        let dt = duration.as_secs_f64();
        // cycles per second = crystal * fractional offset
        let rate = self.crystal_hz as f64 * (self.natural_dds - self.dds) * 1e-11;
        self.phase += rate * dt;
        self.now_ns += duration.as_nanos() as u64;
        if self.secs() != before {
            self.latched = self.phase;
        }
        if let Some((at, flag)) = &self.stop_at {
            if self.secs() >= *at {
                flag.store(false, Ordering::SeqCst);
            }
        }
    }

    fn reading(&self) -> u64 {
        if let Some(v) = self.stuck_delta {
            return v;
        }
        let mut value = (self.latched - self.zero_ref).round() as i64;
        if let Some((from, to, amount)) = self.spike_window {
            if (from..to).contains(&self.secs()) {
                value += amount;
            }
        }
        value.rem_euclid(self.crystal_hz as i64) as u64
    }

    fn lock_bad(&self) -> bool {
        self.lock_bad_window
            .map(|(from, to)| (from..to).contains(&self.secs()))
            .unwrap_or(false)
    }

    fn check_transport(&self) -> Result<()> {
        if self.fail_transport {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sim link down").into());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SimHandle(pub Rc<RefCell<SimState>>);

impl SimHandle {
    pub fn new(natural_dds: f64) -> Self {
        SimHandle(Rc::new(RefCell::new(SimState {
            now_ns: 0,
            crystal_hz: CRYSTAL,
            natural_dds,
            dds: 0.0,
            phase: 0.0,
            latched: 0.0,
            zero_ref: 0.0,
            lock_bad_window: None,
            spike_window: None,
            fail_transport: false,
            stuck_delta: None,
            stop_at: None,
            commands: Vec::new(),
        })))
    }

    pub fn clock(&self) -> SimClock {
        SimClock(self.clone())
    }

    pub fn device(&self) -> SimDevice {
        SimDevice(self.clone())
    }

    pub fn secs(&self) -> u64 {
        self.0.borrow().secs()
    }

    pub fn commands(&self) -> Vec<SimCommand> {
        self.0.borrow().commands.clone()
    }

    /// A shutdown flag that the simulation clears at second `at`.
    pub fn stop_flag_at(&self, at: u64) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(true));
        self.0.borrow_mut().stop_at = Some((at, flag.clone()));
        flag
    }

    pub fn dds_pushes(&self) -> Vec<f64> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                SimCommand::SetDds(v) => Some(v),
                _ => None,
            })
            .collect()
    }
}

pub struct SimClock(SimHandle);

impl TickClock for SimClock {
    fn now(&self) -> u64 {
        self.0 .0.borrow().now_ns
    }

    fn ticks_per_second(&self) -> u64 {
        1_000_000_000
    }

    fn sleep(&mut self, duration: Duration) {
        self.0 .0.borrow_mut().advance(duration);
    }
}

pub struct SimDevice(SimHandle);

impl TelemetryProvider for SimDevice {
    fn identify(&mut self) -> Result<ModelInfo> {
        let state = self.0 .0.borrow();
        state.check_transport()?;
        Ok(ModelInfo {
            family: ModelFamily::X72,
            model_text: "X72".to_string(),
            firmware: Some("sim".to_string()),
            serial: Some("000000001-H".to_string()),
            service_pin: Some("LOW".to_string()),
            crystal_hz: state.crystal_hz,
        })
    }

    fn pps_delta(&mut self) -> Result<u64> {
        let state = self.0 .0.borrow();
        state.check_transport()?;
        Ok(state.reading())
    }

    fn control_register(&mut self) -> Result<u32> {
        let state = self.0 .0.borrow();
        state.check_transport()?;
        Ok(if state.lock_bad() { 0x0002 } else { 0 })
    }

    fn health(&mut self) -> Result<HealthReport> {
        let state = self.0 .0.borrow();
        state.check_transport()?;
        Ok(HealthReport {
            control_register: if state.lock_bad() { 0x0002 } else { 0 },
            temperature_c: Some(54.25),
            heater_voltage: Some(14.88),
            lamp_voltage: Some(13.52),
            power_hours: Some(123_456),
            power_ticks: Some(12_345_678),
        })
    }
}

impl DeviceCommandSink for SimDevice {
    fn set_dds_value(&mut self, value: f64) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        state.check_transport()?;
        state.dds = value;
        state.commands.push(SimCommand::SetDds(value));
        Ok(())
    }

    fn zero_pps_delta_to(&mut self, observed: u64) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        state.check_transport()?;
        let corrected = crate::rollover::correct_rollover(observed, state.crystal_hz);
        state.zero_ref += corrected as f64;
        state.commands.push(SimCommand::Zero(observed));
        Ok(())
    }

    fn set_control_register(&mut self, value: u32) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        state.check_transport()?;
        state.commands.push(SimCommand::SetControl(value));
        Ok(())
    }
}
