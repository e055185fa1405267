use serde::{Deserialize, Serialize};

/// Oscillator families that share the line protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    Sa22c,
    X72,
    X99,
    Unknown,
}

impl ModelFamily {
    /// X99 units report registers in decimal, everything else in hex.
    pub fn decimal_registers(self) -> bool {
        self == ModelFamily::X99
    }
}

/// Identity read once after the serial link comes up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub family: ModelFamily,
    pub model_text: String,
    pub firmware: Option<String>,
    pub serial: Option<String>,
    pub service_pin: Option<String>,
    /// Nominal oscillator frequency. Rollover modulus and slope normaliser.
    pub crystal_hz: u64,
}

/// Health poll. Only the control register feeds the control loop; the rest
/// is passed through for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub control_register: u32,
    pub temperature_c: Option<f64>,
    pub heater_voltage: Option<f64>,
    pub lamp_voltage: Option<f64>,
    pub power_hours: Option<u64>,
    pub power_ticks: Option<u64>,
}
