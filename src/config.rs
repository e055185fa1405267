use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub discipline: DisciplineConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisciplineConfig {
    pub discipline_entries: u32,    // samples per calibration run
    pub pps_trigger: i64,           // |diff| of corrected deltas that counts as a spike
    pub pps_rollover: u64,          // sample counter / bucket count overflow limit
    pub drift_window: usize,        // samples in the drift window
    pub drift_limit: f64,           // average drift per sample that triggers an adjustment
    pub dds_check_interval: u64,    // warm-up samples and re-check period (ticks)
    pub dds_base_value: f64,        // 1 DDS unit as fractional frequency
    pub dds_low_value: f64,         // smallest adjustment as fractional frequency
    pub lock_bad_mask: u32,         // control register bit: rubidium lock bad
    pub initial_dds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub tick_ms: u64,                         // nominal PPS period
    pub health_interval_ticks: u64,
    pub health_initial_ticks: u64,
    pub idle_sleep_ms: u64,
    pub zero_retry_every: u32,                // re-send the zero command after this many polls
    pub zero_wait_ms: u64,
    pub lock_wait_ms: u64,
    pub wait_poll_limit: Option<u64>,         // None = wait forever
    pub calibration_attempt_limit: Option<u32>, // None = retry forever
}

impl Default for DisciplineConfig {
    fn default() -> Self {
        DisciplineConfig {
            discipline_entries: 2200,
            pps_trigger: 10_000,
            pps_rollover: 864_000_000,
            drift_window: 60,
            drift_limit: 0.75,
            dds_check_interval: 10,
            dds_base_value: 1e-11,
            dds_low_value: 2e-12,
            lock_bad_mask: 0x0002,
            initial_dds: 0.0,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            tick_ms: 1000,
            health_interval_ticks: 10,
            health_initial_ticks: 5,
            idle_sleep_ms: 10,
            zero_retry_every: 10,
            zero_wait_ms: 1000,
            lock_wait_ms: 2000,
            wait_poll_limit: None,
            calibration_attempt_limit: None,
        }
    }
}

impl DisciplineConfig {
    /// Smallest DDS step in DDS units (0.2 with the default values).
    pub fn increment_unit(&self) -> f64 {
        self.dds_low_value / self.dds_base_value
    }

    pub fn ring_capacity(&self) -> usize {
        10 * self.drift_window
    }

    /// Initial delay before the first drift check, in ticks.
    pub fn initial_adjust_ticks(&self) -> u64 {
        self.drift_window as u64 / 4 + self.dds_check_interval
    }

    /// Delay after an adjustment before the next check, in ticks.
    pub fn settle_ticks(&self) -> u64 {
        2 * self.drift_window as u64
    }
}

impl ScheduleConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Duration of `n` ticks, saturating instead of wrapping.
    pub fn ticks(&self, n: u64) -> Duration {
        Duration::from_millis(self.tick_ms.saturating_mul(n))
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn zero_wait(&self) -> Duration {
        Duration::from_millis(self.zero_wait_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.discipline;
        let s = &self.schedule;

        if d.drift_window == 0 {
            return Err(anyhow!("drift_window must be > 0"));
        }
        if d.drift_limit <= 0.0 {
            return Err(anyhow!("drift_limit must be > 0 (got {})", d.drift_limit));
        }
        if d.dds_base_value <= 0.0 || d.dds_low_value <= 0.0 {
            return Err(anyhow!("dds_base_value and dds_low_value must be > 0"));
        }
        if d.pps_trigger <= 0 || d.pps_rollover == 0 {
            return Err(anyhow!("pps_trigger and pps_rollover must be > 0"));
        }
        if d.ring_capacity() < d.drift_window {
            return Err(anyhow!("ring capacity {} smaller than drift window {}",
                d.ring_capacity(), d.drift_window));
        }
        if s.tick_ms == 0 {
            return Err(anyhow!("tick_ms must be > 0"));
        }
        if s.zero_retry_every == 0 {
            return Err(anyhow!("zero_retry_every must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_tuning() {
        let config = SystemConfig::default();
        assert_eq!(config.discipline.discipline_entries, 2200);
        assert_eq!(config.discipline.ring_capacity(), 600);
        assert!((config.discipline.increment_unit() - 0.2).abs() < 1e-12);
        assert_eq!(config.discipline.initial_adjust_ticks(), 25);
        assert_eq!(config.discipline.settle_ticks(), 120);
        assert_eq!(config.schedule.tick(), Duration::from_secs(1));
        assert!(config.schedule.wait_poll_limit.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tick_counts_do_not_truncate() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.ticks(120), Duration::from_secs(120));
        // Larger than u32::MAX ticks
        assert_eq!(schedule.ticks(5_000_000_000), Duration::from_secs(5_000_000_000));
        assert_eq!(schedule.ticks(u64::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{ "discipline": {{ "drift_limit": 1.05, "drift_window": 10 }} }}"#)
            .expect("write");

        let config = SystemConfig::load(file.path()).expect("load");
        assert_eq!(config.discipline.drift_limit, 1.05);
        assert_eq!(config.discipline.drift_window, 10);
        assert_eq!(config.discipline.ring_capacity(), 100);
        assert_eq!(config.discipline.pps_trigger, 10_000);
        assert_eq!(config.schedule.tick_ms, 1000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{ "discipline": {{ "drift_window": 0 }} }}"#).expect("write");
        assert!(SystemConfig::load(file.path()).is_err());

        let mut config = SystemConfig::default();
        config.schedule.tick_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "not json").expect("write");
        let err = SystemConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
