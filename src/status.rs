use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Discipline status snapshot, shared with whoever wants to observe the loop
/// (log line, status file).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DisciplineStatus {
    // ========================================================================
    // Loop state
    // ========================================================================
    /// "STARTUP", "CALIBRATING", "DISCIPLINE", "HOLDOVER-SPIKE" or "HOLDOVER-LOCK"
    pub mode: String,

    /// Current DDS value (DDS units, 1 unit = 1e-11 fractional frequency)
    pub dds_value: f64,

    /// "NORMAL", "SPIKE-SUSPECT" or "LOCK-LOST"
    pub holdover: String,

    /// Last PPS delta register value as read
    pub pps_raw: u64,

    /// Last PPS delta after rollover correction (crystal cycles)
    pub pps_delta: i64,

    /// Corrected delta relative to the drift offset
    pub pps_adjusted: i64,

    /// Corrected delta at the last DDS adjustment
    pub drift_offset: i64,

    /// Fitted slopes (fractional frequency)
    pub running_slope: f64,
    pub calc_slope: f64,

    /// Average drift per sample over the drift window
    pub drift_average: f64,

    pub sample_counter: u64,

    /// Completed calibrations (initial + holdover recoveries)
    pub calibrations: u64,

    /// DDS adjustments pushed by the drift loop
    pub adjustments: u64,

    /// Unix timestamp of last status update
    pub updated_ts: u64,

    // ========================================================================
    // Device health (last health poll)
    // ========================================================================
    pub rb_locked: bool,
    pub control_register: u32,
    pub temperature_c: Option<f64>,
    pub heater_voltage: Option<f64>,
    pub lamp_voltage: Option<f64>,
    pub power_hours: Option<u64>,
    pub crystal_hz: u64,
    pub model: String,
    pub serial: Option<String>,
}

impl Default for DisciplineStatus {
    fn default() -> Self {
        DisciplineStatus {
            mode: "STARTUP".to_string(),
            dds_value: 0.0,
            holdover: "NORMAL".to_string(),
            pps_raw: 0,
            pps_delta: 0,
            pps_adjusted: 0,
            drift_offset: 0,
            running_slope: 0.0,
            calc_slope: 0.0,
            drift_average: 0.0,
            sample_counter: 0,
            calibrations: 0,
            adjustments: 0,
            updated_ts: 0,

            rb_locked: false,
            control_register: 0,
            temperature_c: None,
            heater_voltage: None,
            lamp_voltage: None,
            power_hours: None,
            crystal_hz: 0,
            model: String::new(),
            serial: None,
        }
    }
}

impl DisciplineStatus {
    /// Replace `path` with the JSON form of this snapshot.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize status")?;
        // Write next to the target and rename so readers never see a partial file
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write status {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace status {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_default() {
        let status = DisciplineStatus::default();
        assert_eq!(status.mode, "STARTUP");
        assert_eq!(status.dds_value, 0.0);
        assert!(!status.rb_locked);
        assert!(status.temperature_c.is_none());
    }

    #[test]
    fn test_status_serde_roundtrip() {
        let mut status = DisciplineStatus::default();
        status.mode = "DISCIPLINE".to_string();
        status.dds_value = -74.2;
        status.rb_locked = true;
        status.temperature_c = Some(54.25);

        let json = serde_json::to_string(&status).expect("serialize failed");
        let restored: DisciplineStatus = serde_json::from_str(&json).expect("deserialize failed");

        assert_eq!(restored.mode, "DISCIPLINE");
        assert!((restored.dds_value + 74.2).abs() < f64::EPSILON);
        assert!(restored.rb_locked);
        assert_eq!(restored.temperature_c, Some(54.25));
    }

    #[test]
    fn test_write_json_replaces_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status.json");

        let mut status = DisciplineStatus::default();
        status.write_json(&path).expect("first write");
        status.calibrations = 3;
        status.write_json(&path).expect("second write");

        let text = std::fs::read_to_string(&path).expect("read back");
        let restored: DisciplineStatus = serde_json::from_str(&text).expect("parse");
        assert_eq!(restored.calibrations, 3);
        assert!(!path.with_extension("tmp").exists());
    }
}
