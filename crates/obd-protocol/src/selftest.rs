//! Built-in self-test status (Mode 01 PID 01)

use crate::error::DecodeError;
use crate::pid::MONITOR_STATUS_PID;
use serde::Serialize;

/// One readiness monitor reported in PID 01
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MonitorTest {
    Misfire,
    FuelSystem,
    Components,
    Catalyst,
    HeatedCatalyst,
    EvaporativeSystem,
    SecondaryAirSystem,
    AcRefrigerant,
    OxygenSensor,
    OxygenSensorHeater,
    EgrSystem,
    NmhcCatalyst,
    NoxScrMonitor,
    BoostPressure,
    ExhaustGasSensor,
    PmFilter,
    EgrVvtSystem,
}

impl MonitorTest {
    /// Description shown in the test list
    pub fn description(&self) -> &'static str {
        match self {
            MonitorTest::Misfire => "Misfire Monitoring",
            MonitorTest::FuelSystem => "Fuel System Monitoring",
            MonitorTest::Components => "Comprehensive Component Monitoring",
            MonitorTest::Catalyst => "Catalyst Monitoring",
            MonitorTest::HeatedCatalyst => "Heated Catalyst Monitoring",
            MonitorTest::EvaporativeSystem => "Evaporative System Monitoring",
            MonitorTest::SecondaryAirSystem => "Secondary Air System Monitoring",
            MonitorTest::AcRefrigerant => "A/C Refrigerant Monitoring",
            MonitorTest::OxygenSensor => "Oxygen Sensor Monitoring",
            MonitorTest::OxygenSensorHeater => "Oxygen Sensor Heater Monitoring",
            MonitorTest::EgrSystem => "EGR System Monitoring",
            MonitorTest::NmhcCatalyst => "NMHC Catalyst Monitoring",
            MonitorTest::NoxScrMonitor => "NOx/SCR Monitoring",
            MonitorTest::BoostPressure => "Boost Pressure Monitoring",
            MonitorTest::ExhaustGasSensor => "Exhaust Gas Sensor Monitoring",
            MonitorTest::PmFilter => "PM Filter Monitoring",
            MonitorTest::EgrVvtSystem => "EGR/VVT System Monitoring",
        }
    }
}

/// Continuous monitors, bits 0..2 of byte B
const CONTINUOUS: [MonitorTest; 3] = [
    MonitorTest::Misfire,
    MonitorTest::FuelSystem,
    MonitorTest::Components,
];

/// Non-continuous monitors of spark ignition engines, bits 0..7 of C/D
const SPARK: [Option<MonitorTest>; 8] = [
    Some(MonitorTest::Catalyst),
    Some(MonitorTest::HeatedCatalyst),
    Some(MonitorTest::EvaporativeSystem),
    Some(MonitorTest::SecondaryAirSystem),
    Some(MonitorTest::AcRefrigerant),
    Some(MonitorTest::OxygenSensor),
    Some(MonitorTest::OxygenSensorHeater),
    Some(MonitorTest::EgrSystem),
];

/// Non-continuous monitors of compression ignition engines (bits 2 and 4 reserved)
const COMPRESSION: [Option<MonitorTest>; 8] = [
    Some(MonitorTest::NmhcCatalyst),
    Some(MonitorTest::NoxScrMonitor),
    None,
    Some(MonitorTest::BoostPressure),
    None,
    Some(MonitorTest::ExhaustGasSensor),
    Some(MonitorTest::PmFilter),
    Some(MonitorTest::EgrVvtSystem),
];

/// Result of one monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestOutcome {
    /// Monitor not available on this ECU
    NotRun,
    /// Available and complete
    Pass,
    /// Available but incomplete
    Fail,
}

impl TestOutcome {
    fn from_bits(available: bool, incomplete: bool) -> Self {
        match (available, incomplete) {
            (false, _) => TestOutcome::NotRun,
            (true, false) => TestOutcome::Pass,
            (true, true) => TestOutcome::Fail,
        }
    }
}

impl std::fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestOutcome::NotRun => write!(f, "Not run"),
            TestOutcome::Pass => write!(f, "Pass"),
            TestOutcome::Fail => write!(f, "Fail"),
        }
    }
}

/// Decoded PID 01 reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfTestStatus {
    /// Malfunction indicator lamp on
    pub mil_on: bool,
    /// Number of confirmed emission-related DTCs
    pub dtc_count: u8,
    /// Engine uses compression ignition (selects the monitor set)
    pub compression_ignition: bool,
    /// Monitors in bit order
    pub tests: Vec<(MonitorTest, TestOutcome)>,
}

impl SelfTestStatus {
    /// Decode the four data bytes A B C D of PID 01
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let [a, b, c, d] = <[u8; 4]>::try_from(bytes).map_err(|_| DecodeError::BadLength {
            pid: MONITOR_STATUS_PID,
            expected: 4,
            actual: bytes.len(),
        })?;

        let compression_ignition = b & 0x08 != 0;
        let mut tests = Vec::with_capacity(11);

        for (bit, test) in CONTINUOUS.iter().enumerate() {
            let available = b & (1 << bit) != 0;
            let incomplete = b & (1 << (bit + 4)) != 0;
            tests.push((*test, TestOutcome::from_bits(available, incomplete)));
        }

        let table = if compression_ignition { &COMPRESSION } else { &SPARK };
        for (bit, test) in table.iter().enumerate() {
            if let Some(test) = test {
                let available = c & (1 << bit) != 0;
                let incomplete = d & (1 << bit) != 0;
                tests.push((*test, TestOutcome::from_bits(available, incomplete)));
            }
        }

        Ok(Self {
            mil_on: a & 0x80 != 0,
            dtc_count: a & 0x7F,
            compression_ignition,
            tests,
        })
    }

    /// Outcome of one monitor, if it belongs to this engine type
    pub fn outcome(&self, test: MonitorTest) -> Option<TestOutcome> {
        self.tests
            .iter()
            .find(|(t, _)| *t == test)
            .map(|(_, outcome)| *outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spark_ignition_decode() {
        // MIL on, 2 codes; misfire+fuel available, fuel incomplete;
        // catalyst + O2 sensor available, O2 sensor incomplete
        let status = SelfTestStatus::decode(&[0x82, 0x23, 0x21, 0x20]).unwrap();
        assert!(status.mil_on);
        assert_eq!(status.dtc_count, 2);
        assert!(!status.compression_ignition);
        assert_eq!(status.tests.len(), 11);
        assert_eq!(status.outcome(MonitorTest::Misfire), Some(TestOutcome::Pass));
        assert_eq!(status.outcome(MonitorTest::FuelSystem), Some(TestOutcome::Fail));
        assert_eq!(status.outcome(MonitorTest::Components), Some(TestOutcome::NotRun));
        assert_eq!(status.outcome(MonitorTest::Catalyst), Some(TestOutcome::Pass));
        assert_eq!(status.outcome(MonitorTest::OxygenSensor), Some(TestOutcome::Fail));
        assert_eq!(status.outcome(MonitorTest::EgrSystem), Some(TestOutcome::NotRun));
        assert_eq!(status.outcome(MonitorTest::PmFilter), None);
    }

    #[test]
    fn test_compression_ignition_decode() {
        let status = SelfTestStatus::decode(&[0x00, 0x0F, 0x40, 0x00]).unwrap();
        assert!(!status.mil_on);
        assert!(status.compression_ignition);
        assert_eq!(status.tests.len(), 9);
        assert_eq!(status.outcome(MonitorTest::PmFilter), Some(TestOutcome::Pass));
        assert_eq!(status.outcome(MonitorTest::Catalyst), None);
    }

    #[test]
    fn test_bad_length() {
        assert_eq!(
            SelfTestStatus::decode(&[0x00, 0x00]),
            Err(DecodeError::BadLength {
                pid: 0x01,
                expected: 4,
                actual: 2
            })
        );
    }
}
