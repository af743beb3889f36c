//! OBD-II PID Definitions and Response Parsing
//!
//! Static Mode 01 sensor table: one [`SensorSpec`] per PID with its data
//! width, unit and the SAE J1979 formula that turns the reply bytes into a
//! value. Also holds the supported-PID bitmap type filled from the
//! `0100`/`0120`/... range queries.

use crate::dtc;
use crate::error::DecodeError;
use crate::mode;
use serde::Serialize;

/// PID whose reply carries monitor status and the DTC count
pub const MONITOR_STATUS_PID: u8 = 0x01;

/// How the data bytes A, B, ... of a reply become a value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Formula {
    /// A * scale + offset
    Byte { scale: f64, offset: f64 },
    /// (256A + B) * scale + offset
    Word { scale: f64, offset: f64 },
    /// Two's complement (A, B) * scale
    SignedWord { scale: f64 },
    /// Oxygen sensor: A / 200 volts (B is the sensor's fuel trim)
    OxygenVoltage,
    /// Bit field, shown as hex bytes
    Bitmask,
    /// Enumerated state in A
    Enumerated(&'static [(u8, &'static str)]),
    /// Trouble code that stored the freeze frame
    FreezeDtc,
}

/// Sensor table entry for one PID
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSpec {
    /// Mode 01 PID number
    pub pid: u8,
    /// Display name
    pub name: &'static str,
    /// Unit of the decoded value (empty for unitless)
    pub unit: &'static str,
    /// Number of data bytes in a well-formed reply
    pub data_bytes: usize,
    /// Decimal places in the formatted value
    pub precision: usize,
    /// Decode formula
    pub formula: Formula,
}

/// A decoded sensor value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// The PID that was queried
    pub pid: u8,
    /// Decoded value
    pub value: f64,
    /// Value formatted for display
    pub formatted: String,
    /// Unit of `value`
    pub unit: &'static str,
}

impl std::fmt::Display for SensorReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.unit.is_empty() {
            write!(f, "{}", self.formatted)
        } else {
            write!(f, "{} ({})", self.formatted, self.unit)
        }
    }
}

impl SensorSpec {
    /// Request sent to the adapter, e.g. `010C`
    pub fn command(&self) -> String {
        format!("{:02X}{:02X}", mode::CURRENT_DATA, self.pid)
    }

    /// Decode the data bytes (mode and PID echo already stripped)
    pub fn decode(&self, bytes: &[u8]) -> Result<SensorReading, DecodeError> {
        if bytes.len() != self.data_bytes {
            return Err(DecodeError::BadLength {
                pid: self.pid,
                expected: self.data_bytes,
                actual: bytes.len(),
            });
        }

        let word = || u16::from_be_bytes([bytes[0], bytes[1]]);

        let (value, formatted) = match self.formula {
            Formula::Byte { scale, offset } => {
                let v = bytes[0] as f64 * scale + offset;
                (v, format!("{:.*}", self.precision, v))
            }
            Formula::Word { scale, offset } => {
                let v = word() as f64 * scale + offset;
                (v, format!("{:.*}", self.precision, v))
            }
            Formula::SignedWord { scale } => {
                let v = word() as i16 as f64 * scale;
                (v, format!("{:.*}", self.precision, v))
            }
            Formula::OxygenVoltage => {
                let v = bytes[0] as f64 / 200.0;
                (v, format!("{:.*}", self.precision, v))
            }
            Formula::Bitmask => {
                let v = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
                let hex: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
                (v as f64, hex.join(" "))
            }
            Formula::Enumerated(states) => {
                let a = bytes[0];
                let text = states
                    .iter()
                    .find(|(code, _)| *code == a)
                    .map(|(_, text)| (*text).to_string())
                    .unwrap_or_else(|| format!("Unknown ({:#04X})", a));
                (a as f64, text)
            }
            Formula::FreezeDtc => {
                let raw = word();
                (raw as f64, dtc::decode_dtc(bytes[0], bytes[1]))
            }
        };

        Ok(SensorReading {
            pid: self.pid,
            value,
            formatted,
            unit: self.unit,
        })
    }
}

const PERCENT: f64 = 100.0 / 255.0;
const TRIM: f64 = 100.0 / 128.0;
const LAMBDA: f64 = 2.0 / 65536.0;

const fn byte(
    pid: u8,
    name: &'static str,
    unit: &'static str,
    scale: f64,
    offset: f64,
    precision: usize,
) -> SensorSpec {
    SensorSpec {
        pid,
        name,
        unit,
        data_bytes: 1,
        precision,
        formula: Formula::Byte { scale, offset },
    }
}

const fn word(
    pid: u8,
    name: &'static str,
    unit: &'static str,
    scale: f64,
    offset: f64,
    precision: usize,
) -> SensorSpec {
    SensorSpec {
        pid,
        name,
        unit,
        data_bytes: 2,
        precision,
        formula: Formula::Word { scale, offset },
    }
}

/// Equivalence ratio sensors reply with four bytes; the ratio is in A,B
const fn lambda(pid: u8, name: &'static str) -> SensorSpec {
    SensorSpec {
        pid,
        name,
        unit: "",
        data_bytes: 4,
        precision: 3,
        formula: Formula::Word {
            scale: LAMBDA,
            offset: 0.0,
        },
    }
}

const fn oxygen(pid: u8, name: &'static str) -> SensorSpec {
    SensorSpec {
        pid,
        name,
        unit: "V",
        data_bytes: 2,
        precision: 3,
        formula: Formula::OxygenVoltage,
    }
}

const fn bitmask(pid: u8, name: &'static str, data_bytes: usize) -> SensorSpec {
    SensorSpec {
        pid,
        name,
        unit: "",
        data_bytes,
        precision: 0,
        formula: Formula::Bitmask,
    }
}

const fn enumerated(
    pid: u8,
    name: &'static str,
    data_bytes: usize,
    states: &'static [(u8, &'static str)],
) -> SensorSpec {
    SensorSpec {
        pid,
        name,
        unit: "",
        data_bytes,
        precision: 0,
        formula: Formula::Enumerated(states),
    }
}

const FUEL_SYSTEM: &[(u8, &str)] = &[
    (0x00, "Not reported"),
    (0x01, "Open loop (insufficient engine temperature)"),
    (0x02, "Closed loop (oxygen sensor feedback)"),
    (0x04, "Open loop (engine load or deceleration fuel cut)"),
    (0x08, "Open loop (system failure)"),
    (0x10, "Closed loop (feedback system fault)"),
];

const SECONDARY_AIR: &[(u8, &str)] = &[
    (0x01, "Upstream"),
    (0x02, "Downstream of catalytic converter"),
    (0x04, "From outside atmosphere or off"),
    (0x08, "Pump commanded on for diagnostics"),
];

const OBD_STANDARDS: &[(u8, &str)] = &[
    (0x01, "OBD-II (CARB)"),
    (0x02, "OBD (EPA)"),
    (0x03, "OBD and OBD-II"),
    (0x04, "OBD-I"),
    (0x05, "Not OBD compliant"),
    (0x06, "EOBD"),
    (0x07, "EOBD and OBD-II"),
    (0x08, "EOBD and OBD"),
    (0x09, "EOBD, OBD and OBD-II"),
    (0x0A, "JOBD"),
    (0x0B, "JOBD and OBD-II"),
    (0x0C, "JOBD and EOBD"),
    (0x0D, "JOBD, EOBD and OBD-II"),
];

const AUX_INPUT: &[(u8, &str)] = &[(0x00, "PTO inactive"), (0x01, "PTO active")];

const FUEL_TYPE: &[(u8, &str)] = &[
    (0x00, "Not available"),
    (0x01, "Gasoline"),
    (0x02, "Methanol"),
    (0x03, "Ethanol"),
    (0x04, "Diesel"),
    (0x05, "LPG"),
    (0x06, "CNG"),
    (0x07, "Propane"),
    (0x08, "Electric"),
    (0x09, "Bifuel running gasoline"),
    (0x0A, "Bifuel running methanol"),
    (0x0B, "Bifuel running ethanol"),
    (0x0C, "Bifuel running LPG"),
    (0x0D, "Bifuel running CNG"),
    (0x0E, "Bifuel running propane"),
    (0x0F, "Bifuel running electricity"),
    (0x10, "Bifuel running electric and combustion engine"),
    (0x11, "Hybrid gasoline"),
    (0x12, "Hybrid ethanol"),
    (0x13, "Hybrid diesel"),
    (0x14, "Hybrid electric"),
];

/// Mode 01 sensor table, sorted by PID
pub static SENSORS: &[SensorSpec] = &[
    SensorSpec {
        pid: 0x02,
        name: "Freeze DTC",
        unit: "",
        data_bytes: 2,
        precision: 0,
        formula: Formula::FreezeDtc,
    },
    enumerated(0x03, "Fuel System Status", 2, FUEL_SYSTEM),
    byte(0x04, "Calculated Load Value", "%", PERCENT, 0.0, 1),
    byte(0x05, "Coolant Temperature", "°C", 1.0, -40.0, 0),
    byte(0x06, "Short Term Fuel Trim (Bank 1)", "%", TRIM, -100.0, 1),
    byte(0x07, "Long Term Fuel Trim (Bank 1)", "%", TRIM, -100.0, 1),
    byte(0x08, "Short Term Fuel Trim (Bank 2)", "%", TRIM, -100.0, 1),
    byte(0x09, "Long Term Fuel Trim (Bank 2)", "%", TRIM, -100.0, 1),
    byte(0x0A, "Fuel Pressure", "kPa", 3.0, 0.0, 0),
    byte(0x0B, "Intake Manifold Pressure", "kPa", 1.0, 0.0, 0),
    word(0x0C, "Engine RPM", "rpm", 0.25, 0.0, 0),
    byte(0x0D, "Vehicle Speed", "km/h", 1.0, 0.0, 0),
    byte(0x0E, "Timing Advance", "°", 0.5, -64.0, 1),
    byte(0x0F, "Intake Air Temp", "°C", 1.0, -40.0, 0),
    word(0x10, "Air Flow Rate (MAF)", "g/s", 0.01, 0.0, 2),
    byte(0x11, "Throttle Position", "%", PERCENT, 0.0, 1),
    enumerated(0x12, "Secondary Air Status", 1, SECONDARY_AIR),
    bitmask(0x13, "Location of O2 sensors", 1),
    oxygen(0x14, "O2 Sensor: 1 - 1"),
    oxygen(0x15, "O2 Sensor: 1 - 2"),
    oxygen(0x16, "O2 Sensor: 1 - 3"),
    oxygen(0x17, "O2 Sensor: 1 - 4"),
    oxygen(0x18, "O2 Sensor: 2 - 1"),
    oxygen(0x19, "O2 Sensor: 2 - 2"),
    oxygen(0x1A, "O2 Sensor: 2 - 3"),
    oxygen(0x1B, "O2 Sensor: 2 - 4"),
    enumerated(0x1C, "OBD Designation", 1, OBD_STANDARDS),
    bitmask(0x1D, "Location of O2 sensors (4 banks)", 1),
    enumerated(0x1E, "Aux input status", 1, AUX_INPUT),
    word(0x1F, "Time Since Engine Start", "s", 1.0, 0.0, 0),
    word(0x21, "Distance Traveled with MIL On", "km", 1.0, 0.0, 0),
    word(0x22, "Fuel Rail Pressure (vacuum)", "kPa", 0.079, 0.0, 1),
    word(0x23, "Fuel Rail Pressure (gauge)", "kPa", 10.0, 0.0, 0),
    lambda(0x24, "O2 Sensor 1 Equivalence Ratio"),
    lambda(0x25, "O2 Sensor 2 Equivalence Ratio"),
    lambda(0x26, "O2 Sensor 3 Equivalence Ratio"),
    lambda(0x27, "O2 Sensor 4 Equivalence Ratio"),
    lambda(0x28, "O2 Sensor 5 Equivalence Ratio"),
    lambda(0x29, "O2 Sensor 6 Equivalence Ratio"),
    lambda(0x2A, "O2 Sensor 7 Equivalence Ratio"),
    lambda(0x2B, "O2 Sensor 8 Equivalence Ratio"),
    byte(0x2C, "Commanded EGR", "%", PERCENT, 0.0, 1),
    byte(0x2D, "EGR Error", "%", TRIM, -100.0, 1),
    byte(0x2E, "Commanded Evaporative Purge", "%", PERCENT, 0.0, 1),
    byte(0x2F, "Fuel Level Input", "%", PERCENT, 0.0, 1),
    byte(0x30, "Warm-ups Since Codes Cleared", "", 1.0, 0.0, 0),
    word(0x31, "Distance Since Codes Cleared", "km", 1.0, 0.0, 0),
    SensorSpec {
        pid: 0x32,
        name: "Evap System Vapor Pressure",
        unit: "Pa",
        data_bytes: 2,
        precision: 2,
        formula: Formula::SignedWord { scale: 0.25 },
    },
    byte(0x33, "Barometric Pressure", "kPa", 1.0, 0.0, 0),
    lambda(0x34, "O2 Sensor 1 Equivalence Ratio (current)"),
    lambda(0x35, "O2 Sensor 2 Equivalence Ratio (current)"),
    lambda(0x36, "O2 Sensor 3 Equivalence Ratio (current)"),
    lambda(0x37, "O2 Sensor 4 Equivalence Ratio (current)"),
    lambda(0x38, "O2 Sensor 5 Equivalence Ratio (current)"),
    lambda(0x39, "O2 Sensor 6 Equivalence Ratio (current)"),
    lambda(0x3A, "O2 Sensor 7 Equivalence Ratio (current)"),
    lambda(0x3B, "O2 Sensor 8 Equivalence Ratio (current)"),
    word(0x3C, "Catalyst Temperature: Bank 1 - 1", "°C", 0.1, -40.0, 1),
    word(0x3D, "Catalyst Temperature: Bank 2 - 1", "°C", 0.1, -40.0, 1),
    word(0x3E, "Catalyst Temperature: Bank 1 - 2", "°C", 0.1, -40.0, 1),
    word(0x3F, "Catalyst Temperature: Bank 2 - 2", "°C", 0.1, -40.0, 1),
    bitmask(0x41, "Monitor Status This Drive Cycle", 4),
    word(0x42, "Control Module Voltage", "V", 0.001, 0.0, 3),
    word(0x43, "Absolute Load Value", "%", PERCENT, 0.0, 1),
    word(0x44, "Commanded Equivalence Ratio", "", LAMBDA, 0.0, 3),
    byte(0x45, "Relative Throttle Position", "%", PERCENT, 0.0, 1),
    byte(0x46, "Ambient Air Temperature", "°C", 1.0, -40.0, 0),
    byte(0x47, "Absolute Throttle Position B", "%", PERCENT, 0.0, 1),
    byte(0x48, "Absolute Throttle Position C", "%", PERCENT, 0.0, 1),
    byte(0x49, "Accelerator Pedal Position D", "%", PERCENT, 0.0, 1),
    byte(0x4A, "Accelerator Pedal Position E", "%", PERCENT, 0.0, 1),
    byte(0x4B, "Accelerator Pedal Position F", "%", PERCENT, 0.0, 1),
    byte(0x4C, "Commanded Throttle Actuator", "%", PERCENT, 0.0, 1),
    word(0x4D, "Time Run with MIL On", "min", 1.0, 0.0, 0),
    word(0x4E, "Time Since Trouble Codes Cleared", "min", 1.0, 0.0, 0),
    enumerated(0x51, "Fuel Type", 1, FUEL_TYPE),
    byte(0x52, "Ethanol Fuel", "%", PERCENT, 0.0, 1),
    byte(0x5C, "Engine Oil Temperature", "°C", 1.0, -40.0, 0),
    word(0x5E, "Engine Fuel Rate", "L/h", 0.05, 0.0, 2),
];

/// Look up the sensor table entry for a PID
pub fn sensor(pid: u8) -> Option<&'static SensorSpec> {
    SENSORS
        .binary_search_by_key(&pid, |s| s.pid)
        .ok()
        .map(|i| &SENSORS[i])
}

/// Decode reply bytes for a PID through the sensor table
pub fn decode(pid: u8, bytes: &[u8]) -> Result<SensorReading, DecodeError> {
    sensor(pid)
        .ok_or(DecodeError::Unsupported(pid))?
        .decode(bytes)
}

/// Whether a PID is one of the `0100`/`0120`/... range queries
pub fn is_range_query(pid: u8) -> bool {
    pid % 0x20 == 0
}

/// Supported-PID bitmap for one ECU, indexed by PID number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedPids {
    bits: [bool; 256],
}

impl Default for SupportedPids {
    fn default() -> Self {
        Self { bits: [false; 256] }
    }
}

impl SupportedPids {
    /// Empty bitmap
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the four mask bytes of a range query reply.
    ///
    /// Bit 7 of the first byte is PID `base + 1`, bit 0 of the last byte is
    /// PID `base + 0x20`. Returns whether that last bit (the next range) is set.
    pub fn merge_range(&mut self, base: u8, mask: [u8; 4]) -> bool {
        for offset in 0..32usize {
            let bit = (mask[offset / 8] >> (7 - offset % 8)) & 1 == 1;
            let pid = base as usize + offset + 1;
            if bit && pid < self.bits.len() {
                self.bits[pid] = true;
            }
        }
        mask[3] & 1 == 1
    }

    /// Mark a PID supported
    pub fn insert(&mut self, pid: u8) {
        self.bits[pid as usize] = true;
    }

    /// Check whether the ECU reports a PID as supported
    pub fn is_supported(&self, pid: u8) -> bool {
        self.bits[pid as usize]
    }

    /// Raw boolean array indexed by PID
    pub fn as_bools(&self) -> &[bool; 256] {
        &self.bits
    }

    /// All supported PIDs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(move |pid| self.bits[*pid as usize])
    }

    /// Supported PIDs that can be polled as live data.
    ///
    /// Excludes the range queries and PID 01, which is read as the
    /// self-test channel instead.
    pub fn live_data_pids(&self) -> impl Iterator<Item = u8> + '_ {
        self.iter().filter(move |pid| self.is_live_data(*pid))
    }

    /// Whether a PID is supported and can be polled as live data
    pub fn is_live_data(&self, pid: u8) -> bool {
        self.is_supported(pid)
            && pid != MONITOR_STATUS_PID
            && !is_range_query(pid)
            && sensor(pid).is_some()
    }

    /// Number of supported PIDs
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }
}
