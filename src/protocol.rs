//! ASCII line protocol spoken by the Symmetricom rubidium family.
//!
//! Every query is a single-letter command; the unit answers with a handful
//! of `KEY: VALUE` lines. Values come in a mix of hex, decimal and hex-coded
//! IEEE-754 floats depending on the field and the model, so parsing is kept
//! pure here and the serial transport only moves bytes.

use crate::error::{DisciplineError, Result};
use crate::telemetry::{HealthReport, ModelFamily, ModelInfo};
use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;

// ============================================================================
// COMMANDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Identify,
    PpsDelta,
    Health,
    ControlRegister,
    SetDds(f64),
    /// Subtract the given raw delta from the PPS delta register.
    ZeroPpsDelta(u64),
    SetControlRegister(u32),
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Command::Identify => "i".to_string(),
            Command::PpsDelta => "j".to_string(),
            Command::Health => "w".to_string(),
            Command::ControlRegister => "p".to_string(),
            Command::SetDds(v) => format!("f{:.1}", v),
            Command::ZeroPpsDelta(v) => format!("k{}", v),
            Command::SetControlRegister(v) => format!("q{}", v),
        }
    }
}

// ============================================================================
// VALUES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Int(v) => u64::try_from(*v).ok(),
            FieldValue::Float(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

pub type FieldMap = BTreeMap<String, FieldValue>;

/// Keys whose values are always hex, whatever the model.
const HEX_KEYS: [&str; 3] = ["CTL REG", "CONTROL REG", "IFPGACTL"];

/// Decode an 8-hex-digit big-endian IEEE-754 single, e.g. `42590000.`.
pub fn parse_hex_float(raw: &str) -> Option<f64> {
    let digits = raw.trim_matches('.');
    if digits.len() != 8 {
        return None;
    }
    let mut bytes = [0u8; 4];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(digits.get(2 * i..2 * i + 2)?, 16).ok()?;
    }
    Some(BigEndian::read_f32(&bytes) as f64)
}

fn is_hex_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Interpret one field value according to its key and the unit's family.
pub fn parse_value(key: &str, raw: &str, family: ModelFamily) -> FieldValue {
    let mut value = raw.trim();

    if let Some(idx) = value.find("HZ") {
        value = &value[..idx];
        if !family.decimal_registers() {
            value = value.split('.').next().unwrap_or(value);
        }
    }

    if value.contains('.') {
        if let Some(f) = parse_hex_float(value) {
            return FieldValue::Float(f);
        }
        return match value.parse::<f64>() {
            Ok(f) => FieldValue::Float(f),
            Err(_) => FieldValue::Text(value.to_string()),
        };
    }

    if HEX_KEYS.iter().any(|k| key.contains(k)) {
        return match i64::from_str_radix(value, 16) {
            Ok(v) => FieldValue::Int(v),
            Err(_) => FieldValue::Text(value.to_string()),
        };
    }

    if !family.decimal_registers() && is_hex_digits(value) {
        if let Ok(v) = i64::from_str_radix(value, 16) {
            return FieldValue::Int(v);
        }
    }

    if let Ok(v) = value.parse::<i64>() {
        FieldValue::Int(v)
    } else if let Ok(f) = value.parse::<f64>() {
        FieldValue::Float(f)
    } else {
        FieldValue::Text(value.to_string())
    }
}

/// Split a raw response into trimmed, upper-cased, non-empty lines.
pub fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split(|c| c == '\r' || c == '\n')
        .map(|l| l.trim().to_uppercase())
        .filter(|l| !l.is_empty())
        .collect()
}

fn split_pair(item: &str) -> Option<(&str, &str)> {
    let (key, value) = item.split_once(": ")?;
    Some((key.trim(), value.trim()))
}

// ============================================================================
// RESPONSES
// ============================================================================

pub fn detect_family(model_text: &str) -> ModelFamily {
    if model_text.contains("22") {
        ModelFamily::Sa22c
    } else if model_text.contains("X 9") {
        ModelFamily::X99
    } else {
        ModelFamily::X72
    }
}

/// Parse the `i` response. `CRYSTAL` is required; everything else is
/// best effort.
pub fn parse_identity(lines: &[String]) -> Result<(ModelInfo, FieldMap)> {
    let mut family = ModelFamily::Unknown;
    let mut model_text = String::from("UNKNOWN");
    let mut firmware = None;
    let mut serial = None;

    for line in lines {
        if let Some(idx) = line.find("BY SYMMETRICOM,") {
            model_text = line[..idx].trim().to_string();
            family = detect_family(&model_text);
        }
        if let (Some(start), Some(end)) = (line.find("VERSION "), line.find(" OF")) {
            if start + 8 <= end {
                firmware = Some(line[start + 8..end].to_string());
            }
        }
        if let (Some(start), Some(end)) = (line.find("SERIAL CODE IS "), line.find("-H,")) {
            if start + 15 <= end {
                serial = Some(format!("{}-H", &line[start + 15..end]));
            }
        }
    }

    let mut fields = FieldMap::new();
    for line in lines {
        if !line.contains(", ") {
            continue;
        }
        let register_line = line.contains("CRYSTAL: ") || line.contains("CTL REG: ");
        let service_line = line.contains(" SRVC: ") && line.contains("FC: ");
        if !register_line && !service_line {
            continue;
        }
        for (key, value) in line.split(", ").filter_map(split_pair) {
            let parsed = if service_line && !register_line {
                FieldValue::Text(value.to_string())
            } else {
                parse_value(key, value, family)
            };
            fields.insert(key.to_string(), parsed);
        }
    }

    let crystal_hz = fields
        .get("CRYSTAL")
        .and_then(FieldValue::as_u64)
        .filter(|hz| *hz > 0)
        .ok_or_else(|| DisciplineError::schema("CRYSTAL"))?;

    let info = ModelInfo {
        family,
        model_text,
        firmware,
        serial,
        service_pin: fields.get("SRVC").map(FieldValue::as_text),
        crystal_hz,
    };
    Ok((info, fields))
}

/// Parse the `j` response.
pub fn parse_pps_delta(lines: &[String], family: ModelFamily) -> Result<u64> {
    let raw = lines
        .iter()
        .find(|l| l.contains("DELTA REG:"))
        .and_then(|l| split_pair(l))
        .map(|(_, v)| v)
        .ok_or_else(|| DisciplineError::schema("DELTA REG"))?;

    let parsed = if family.decimal_registers() {
        raw.parse::<u64>().ok()
    } else {
        u64::from_str_radix(raw, 16).ok()
    };
    parsed.ok_or_else(|| DisciplineError::schema("DELTA REG"))
}

/// Parse the `p` response.
pub fn parse_control_register(lines: &[String]) -> Result<u32> {
    lines
        .iter()
        .find(|l| l.contains("ONTROL REG:"))
        .and_then(|l| split_pair(l))
        .and_then(|(_, v)| u32::from_str_radix(v, 16).ok())
        .ok_or_else(|| DisciplineError::schema("CONTROL REG"))
}

pub fn parse_fields(lines: &[String], family: ModelFamily) -> FieldMap {
    lines
        .iter()
        .filter_map(|l| split_pair(l))
        .map(|(k, v)| (k.to_string(), parse_value(k, v, family)))
        .collect()
}

/// Parse the `w` response. `IFPGACTL` is required.
pub fn parse_health(lines: &[String], family: ModelFamily) -> Result<(HealthReport, FieldMap)> {
    let fields = parse_fields(lines, family);

    let control_register = fields
        .get("IFPGACTL")
        .and_then(FieldValue::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| DisciplineError::schema("IFPGACTL"))?;

    let float = |key: &str| fields.get(key).and_then(FieldValue::as_f64);
    let int = |key: &str| fields.get(key).and_then(FieldValue::as_u64);

    let report = HealthReport {
        control_register,
        temperature_c: float("DCURTEMP"),
        heater_voltage: float("DHTRVOLT"),
        lamp_voltage: float("DMP17"),
        power_hours: int("PWRHRS"),
        power_ticks: int("PWRTICKS"),
    };
    Ok((report, fields))
}
