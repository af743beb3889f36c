//! Diagnostic Trouble Codes
//!
//! Two-byte DTC decoding (`P0133` style), Mode 03/07 reply parsing and the
//! static code-to-description catalog.

use serde::Serialize;

/// Where a code was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DtcStatus {
    /// Confirmed code from Mode 03
    Stored,
    /// Pending code from Mode 07
    Pending,
}

impl std::fmt::Display for DtcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DtcStatus::Stored => write!(f, "Stored"),
            DtcStatus::Pending => write!(f, "Pending"),
        }
    }
}

/// One decoded trouble code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DtcEntry {
    /// Stored or pending
    pub status: DtcStatus,
    /// Code such as `P0133`
    pub code: String,
    /// Catalog description, or a generic one for unknown codes
    pub description: String,
}

impl DtcEntry {
    /// Build an entry and look up its description
    pub fn new(status: DtcStatus, code: String) -> Self {
        let description = describe(&code);
        Self {
            status,
            code,
            description,
        }
    }
}

/// Decode a raw byte pair into the `P/C/B/U` + 4 digit form.
///
/// The top two bits of `a` select the system letter, the next two bits the
/// first digit; the remaining nibble of `a` and both nibbles of `b` are the
/// last three hex digits.
pub fn decode_dtc(a: u8, b: u8) -> String {
    let system = match a >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!("{}{}{:X}{:02X}", system, (a >> 4) & 0x03, a & 0x0F, b)
}

/// Extract codes from the frames of one ECU's Mode 03/07 reply.
///
/// CAN replies carry a count byte after the response mode; legacy replies
/// pack three pairs per frame with `00 00` padding.
pub fn parse_codes(frames: &[Vec<u8>], response_mode: u8, is_can: bool) -> Vec<String> {
    let mut codes = Vec::new();

    for frame in frames {
        let Some((&first, rest)) = frame.split_first() else {
            continue;
        };
        if first != response_mode {
            continue;
        }

        let pairs = if is_can {
            match rest.split_first() {
                Some((&count, pairs)) => &pairs[..pairs.len().min(count as usize * 2)],
                None => continue,
            }
        } else {
            rest
        };

        for pair in pairs.chunks_exact(2) {
            if pair[0] == 0 && pair[1] == 0 {
                continue;
            }
            codes.push(decode_dtc(pair[0], pair[1]));
        }
    }

    codes
}

/// Look up a code in the catalog
pub fn lookup(code: &str) -> Option<&'static str> {
    CATALOG
        .binary_search_by(|(c, _)| (*c).cmp(code))
        .ok()
        .map(|i| CATALOG[i].1)
}

/// Catalog description, or a generic category description for unknown codes
pub fn describe(code: &str) -> String {
    if let Some(text) = lookup(code) {
        return text.to_string();
    }

    let mut chars = code.chars();
    let system = match chars.next() {
        Some('P') => "powertrain",
        Some('C') => "chassis",
        Some('B') => "body",
        Some('U') => "network",
        _ => return "Unknown trouble code".to_string(),
    };
    match chars.next() {
        Some('1') | Some('3') => format!("Manufacturer-specific {} code", system),
        _ => format!("Generic {} code (no description available)", system),
    }
}

/// The full code catalog, sorted by code
pub fn catalog() -> &'static [(&'static str, &'static str)] {
    CATALOG
}

static CATALOG: &[(&str, &str)] = &[
    ("P0005", "Fuel Shutoff Valve A Control Circuit/Open"),
    ("P0010", "Intake Camshaft Position Actuator Circuit (Bank 1)"),
    ("P0011", "Intake Camshaft Position Timing - Over-Advanced (Bank 1)"),
    ("P0012", "Intake Camshaft Position Timing - Over-Retarded (Bank 1)"),
    ("P0013", "Exhaust Camshaft Position Actuator Circuit (Bank 1)"),
    ("P0014", "Exhaust Camshaft Position Timing - Over-Advanced (Bank 1)"),
    ("P0016", "Crankshaft Position - Camshaft Position Correlation (Bank 1 Sensor A)"),
    ("P0030", "HO2S Heater Control Circuit (Bank 1 Sensor 1)"),
    ("P0036", "HO2S Heater Control Circuit (Bank 1 Sensor 2)"),
    ("P0100", "Mass or Volume Air Flow Circuit Malfunction"),
    ("P0101", "Mass or Volume Air Flow Circuit Range/Performance Problem"),
    ("P0102", "Mass or Volume Air Flow Circuit Low Input"),
    ("P0103", "Mass or Volume Air Flow Circuit High Input"),
    ("P0105", "Manifold Absolute Pressure/Barometric Pressure Circuit Malfunction"),
    ("P0106", "Manifold Absolute Pressure/Barometric Pressure Circuit Range/Performance Problem"),
    ("P0107", "Manifold Absolute Pressure/Barometric Pressure Circuit Low Input"),
    ("P0108", "Manifold Absolute Pressure/Barometric Pressure Circuit High Input"),
    ("P0110", "Intake Air Temperature Circuit Malfunction"),
    ("P0112", "Intake Air Temperature Circuit Low Input"),
    ("P0113", "Intake Air Temperature Circuit High Input"),
    ("P0115", "Engine Coolant Temperature Circuit Malfunction"),
    ("P0116", "Engine Coolant Temperature Circuit Range/Performance Problem"),
    ("P0117", "Engine Coolant Temperature Circuit Low Input"),
    ("P0118", "Engine Coolant Temperature Circuit High Input"),
    ("P0120", "Throttle Position Sensor/Switch A Circuit Malfunction"),
    ("P0121", "Throttle Position Sensor/Switch A Circuit Range/Performance Problem"),
    ("P0122", "Throttle Position Sensor/Switch A Circuit Low Input"),
    ("P0123", "Throttle Position Sensor/Switch A Circuit High Input"),
    ("P0125", "Insufficient Coolant Temperature for Closed Loop Fuel Control"),
    ("P0128", "Coolant Thermostat (Coolant Temperature Below Thermostat Regulating Temperature)"),
    ("P0130", "O2 Sensor Circuit Malfunction (Bank 1 Sensor 1)"),
    ("P0131", "O2 Sensor Circuit Low Voltage (Bank 1 Sensor 1)"),
    ("P0132", "O2 Sensor Circuit High Voltage (Bank 1 Sensor 1)"),
    ("P0133", "O2 Sensor Circuit Slow Response (Bank 1 Sensor 1)"),
    ("P0134", "O2 Sensor Circuit No Activity Detected (Bank 1 Sensor 1)"),
    ("P0135", "O2 Sensor Heater Circuit Malfunction (Bank 1 Sensor 1)"),
    ("P0136", "O2 Sensor Circuit Malfunction (Bank 1 Sensor 2)"),
    ("P0137", "O2 Sensor Circuit Low Voltage (Bank 1 Sensor 2)"),
    ("P0138", "O2 Sensor Circuit High Voltage (Bank 1 Sensor 2)"),
    ("P0139", "O2 Sensor Circuit Slow Response (Bank 1 Sensor 2)"),
    ("P0140", "O2 Sensor Circuit No Activity Detected (Bank 1 Sensor 2)"),
    ("P0141", "O2 Sensor Heater Circuit Malfunction (Bank 1 Sensor 2)"),
    ("P0150", "O2 Sensor Circuit Malfunction (Bank 2 Sensor 1)"),
    ("P0155", "O2 Sensor Heater Circuit Malfunction (Bank 2 Sensor 1)"),
    ("P0171", "System too Lean (Bank 1)"),
    ("P0172", "System too Rich (Bank 1)"),
    ("P0174", "System too Lean (Bank 2)"),
    ("P0175", "System too Rich (Bank 2)"),
    ("P0200", "Injector Circuit Malfunction"),
    ("P0201", "Injector Circuit Malfunction - Cylinder 1"),
    ("P0202", "Injector Circuit Malfunction - Cylinder 2"),
    ("P0203", "Injector Circuit Malfunction - Cylinder 3"),
    ("P0204", "Injector Circuit Malfunction - Cylinder 4"),
    ("P0217", "Engine Overtemp Condition"),
    ("P0218", "Transmission Over Temperature Condition"),
    ("P0219", "Engine Overspeed Condition"),
    ("P0230", "Fuel Pump Primary Circuit Malfunction"),
    ("P0234", "Engine Overboost Condition"),
    ("P0300", "Random/Multiple Cylinder Misfire Detected"),
    ("P0301", "Cylinder 1 Misfire Detected"),
    ("P0302", "Cylinder 2 Misfire Detected"),
    ("P0303", "Cylinder 3 Misfire Detected"),
    ("P0304", "Cylinder 4 Misfire Detected"),
    ("P0305", "Cylinder 5 Misfire Detected"),
    ("P0306", "Cylinder 6 Misfire Detected"),
    ("P0307", "Cylinder 7 Misfire Detected"),
    ("P0308", "Cylinder 8 Misfire Detected"),
    ("P0325", "Knock Sensor 1 Circuit Malfunction (Bank 1 or Single Sensor)"),
    ("P0327", "Knock Sensor 1 Circuit Low Input (Bank 1 or Single Sensor)"),
    ("P0335", "Crankshaft Position Sensor A Circuit Malfunction"),
    ("P0336", "Crankshaft Position Sensor A Circuit Range/Performance"),
    ("P0340", "Camshaft Position Sensor Circuit Malfunction"),
    ("P0351", "Ignition Coil A Primary/Secondary Circuit Malfunction"),
    ("P0352", "Ignition Coil B Primary/Secondary Circuit Malfunction"),
    ("P0353", "Ignition Coil C Primary/Secondary Circuit Malfunction"),
    ("P0354", "Ignition Coil D Primary/Secondary Circuit Malfunction"),
    ("P0400", "Exhaust Gas Recirculation Flow Malfunction"),
    ("P0401", "Exhaust Gas Recirculation Flow Insufficient Detected"),
    ("P0402", "Exhaust Gas Recirculation Flow Excessive Detected"),
    ("P0403", "Exhaust Gas Recirculation Circuit Malfunction"),
    ("P0404", "Exhaust Gas Recirculation Circuit Range/Performance"),
    ("P0410", "Secondary Air Injection System Malfunction"),
    ("P0411", "Secondary Air Injection System Incorrect Flow Detected"),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)"),
    ("P0421", "Warm Up Catalyst Efficiency Below Threshold (Bank 1)"),
    ("P0430", "Catalyst System Efficiency Below Threshold (Bank 2)"),
    ("P0440", "Evaporative Emission Control System Malfunction"),
    ("P0441", "Evaporative Emission Control System Incorrect Purge Flow"),
    ("P0442", "Evaporative Emission Control System Leak Detected (small leak)"),
    ("P0443", "Evaporative Emission Control System Purge Control Valve Circuit Malfunction"),
    ("P0446", "Evaporative Emission Control System Vent Control Circuit Malfunction"),
    ("P0449", "Evaporative Emission Control System Vent Valve/Solenoid Circuit Malfunction"),
    ("P0451", "Evaporative Emission Control System Pressure Sensor Range/Performance"),
    ("P0455", "Evaporative Emission Control System Leak Detected (gross leak)"),
    ("P0456", "Evaporative Emission Control System Leak Detected (very small leak)"),
    ("P0460", "Fuel Level Sensor Circuit Malfunction"),
    ("P0480", "Cooling Fan 1 Control Circuit Malfunction"),
    ("P0500", "Vehicle Speed Sensor Malfunction"),
    ("P0505", "Idle Control System Malfunction"),
    ("P0506", "Idle Control System RPM Lower Than Expected"),
    ("P0507", "Idle Control System RPM Higher Than Expected"),
    ("P0520", "Engine Oil Pressure Sensor/Switch Circuit Malfunction"),
    ("P0530", "A/C Refrigerant Pressure Sensor Circuit Malfunction"),
    ("P0560", "System Voltage Malfunction"),
    ("P0562", "System Voltage Low"),
    ("P0563", "System Voltage High"),
    ("P0600", "Serial Communication Link Malfunction"),
    ("P0601", "Internal Control Module Memory Check Sum Error"),
    ("P0603", "Internal Control Module Keep Alive Memory (KAM) Error"),
    ("P0605", "Internal Control Module Read Only Memory (ROM) Error"),
    ("P0700", "Transmission Control System Malfunction"),
    ("P0705", "Transmission Range Sensor Circuit Malfunction (PRNDL Input)"),
    ("P0715", "Input/Turbine Speed Sensor Circuit Malfunction"),
    ("P0720", "Output Speed Sensor Circuit Malfunction"),
    ("P0740", "Torque Converter Clutch Circuit Malfunction"),
    ("P0750", "Shift Solenoid A Malfunction"),
    ("P0755", "Shift Solenoid B Malfunction"),
];
