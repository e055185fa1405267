//! DDS value bookkeeping and the quantisation rules applied to corrections.
//!
//! DDS values are expressed in units of `dds_base_value` (1e-11), so a device
//! setting of 1.234e-10 is carried here as 12.34. The device only resolves
//! even tenths; the smallest meaningful step is one increment unit (0.2).

/// Current and previous DDS setting. The current value is the single source
/// of truth for what the device was last told.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DdsState {
    pub value: f64,
    pub previous: f64,
}

impl DdsState {
    pub fn new(value: f64) -> Self {
        DdsState { value, previous: value }
    }

    /// Record a new value, remembering the one it replaces.
    pub fn replace(&mut self, value: f64) {
        self.previous = self.value;
        self.value = value;
    }
}

/// Round to the nearest tenth.
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Quantise a raw calibration offset: round to the nearest tenth, then bump
/// odd tenths by +0.1 so only multiples of 0.2 survive.
pub fn quantize_offset(raw: f64) -> f64 {
    let mut tenths = (raw * 10.0).round() as i64;
    if tenths.rem_euclid(2) == 1 {
        tenths += 1;
    }
    tenths as f64 / 10.0
}

/// Corrections at or below one increment are ignored. The increment is a
/// float quotient, so equality is judged with an epsilon.
pub fn exceeds_hysteresis(quantized: f64, increment: f64) -> bool {
    quantized.abs() > increment + f64::EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_even_tenths_are_kept() {
        assert!(close(quantize_offset(0.37), 0.4));
        assert!(close(quantize_offset(0.0), 0.0));
        assert!(close(quantize_offset(-0.41), -0.4));
        assert!(close(quantize_offset(12.58), 12.6));
    }

    #[test]
    fn test_odd_tenths_are_bumped_up() {
        assert!(close(quantize_offset(0.13), 0.2));
        assert!(close(quantize_offset(0.15), 0.2));
        assert!(close(quantize_offset(0.31), 0.4));
        // Bump is always +0.1, also for negatives
        assert!(close(quantize_offset(-0.3), -0.2));
        assert!(close(quantize_offset(-1.08), -1.0));
    }

    #[test]
    fn test_hysteresis_uses_quantized_value() {
        // 0.15 quantises to 0.2, which does not exceed one increment
        let q = quantize_offset(0.15);
        assert!(!exceeds_hysteresis(q, 0.2));
        assert!(!exceeds_hysteresis(quantize_offset(-0.22), 0.2));
        assert!(exceeds_hysteresis(quantize_offset(0.37), 0.2));
        assert!(!exceeds_hysteresis(quantize_offset(-0.3), 0.2));
        assert!(exceeds_hysteresis(quantize_offset(-0.5), 0.2));
    }

    #[test]
    fn test_round_tenth() {
        assert!(close(round_tenth(26.6000000001), 26.6));
        assert!(close(round_tenth(-10.24), -10.2));
        assert!(close(round_tenth(0.2 * 133.0), 26.6));
    }

    #[test]
    fn test_replace_tracks_previous() {
        let mut dds = DdsState::new(-74.2);
        assert_eq!(dds.previous, -74.2);
        dds.replace(-74.0);
        assert_eq!(dds.value, -74.0);
        assert_eq!(dds.previous, -74.2);
    }
}
