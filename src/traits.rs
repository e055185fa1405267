use crate::error::Result;
use crate::telemetry::{HealthReport, ModelInfo};

/// Read side of the oscillator link.
#[cfg_attr(test, mockall::automock)]
pub trait TelemetryProvider {
    /// Identify the unit. Called once; `crystal_hz` is fixed afterwards.
    fn identify(&mut self) -> Result<ModelInfo>;

    /// Raw PPS delta register, in `[0, crystal_hz)`.
    fn pps_delta(&mut self) -> Result<u64>;

    fn control_register(&mut self) -> Result<u32>;

    fn health(&mut self) -> Result<HealthReport>;

    /// Discard anything still buffered on the channel. Default impl does nothing.
    fn drain(&mut self) -> Result<()> { Ok(()) }
}

/// Write side of the oscillator link.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceCommandSink {
    fn set_dds_value(&mut self, value: f64) -> Result<()>;

    /// Subtract `observed` from the PPS delta register so it reads zero.
    fn zero_pps_delta_to(&mut self, observed: u64) -> Result<()>;

    fn set_control_register(&mut self, value: u32) -> Result<()>;
}

/// Status LED or similar, toggled while the loop waits on the device.
#[cfg_attr(test, mockall::automock)]
pub trait HeartbeatIndicator {
    fn toggle(&mut self);
}

/// Heartbeat for hosts without an indicator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHeartbeat;

impl HeartbeatIndicator for NoHeartbeat {
    fn toggle(&mut self) {}
}
