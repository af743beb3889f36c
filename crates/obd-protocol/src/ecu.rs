//! ECU registry built during discovery

use crate::pid::SupportedPids;
use crate::protocol::HeaderFormat;
use serde::{Deserialize, Serialize};

/// Bus address of a responding ECU (the source address in reply headers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EcuAddress(pub u32);

impl std::fmt::Display for EcuAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl EcuAddress {
    /// Header to put in `ATSH` to address this ECU physically, if the
    /// protocol allows it
    pub fn request_header(&self, format: HeaderFormat) -> Option<String> {
        match format {
            // 7E8..7EF answer requests sent to 7E0..7E7
            HeaderFormat::Can11 if (0x7E8..=0x7EF).contains(&self.0) => {
                Some(format!("{:03X}", self.0 - 8))
            }
            HeaderFormat::Can29 => Some(format!("DA{:02X}F1", self.0 & 0xFF)),
            _ => None,
        }
    }
}

/// One discovered ECU
#[derive(Debug, Clone, PartialEq)]
pub struct Ecu {
    /// Bus address
    pub address: EcuAddress,
    /// Display number, 1-based in discovery order
    pub number: usize,
    /// Mode 01 PIDs the ECU reports as supported
    pub supported: SupportedPids,
    /// VIN, when the ECU reports one
    pub vin: Option<String>,
}

/// ECUs found on the bus during one connection session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EcuRegistry {
    ecus: Vec<Ecu>,
}

impl EcuRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address if not yet known; returns its display number
    pub fn register(&mut self, address: EcuAddress) -> usize {
        if let Some(number) = self.display_number(address) {
            return number;
        }
        let number = self.ecus.len() + 1;
        self.ecus.push(Ecu {
            address,
            number,
            supported: SupportedPids::new(),
            vin: None,
        });
        number
    }

    /// All ECUs in discovery order
    pub fn all_ecus(&self) -> &[Ecu] {
        &self.ecus
    }

    /// Addresses in discovery order
    pub fn addresses(&self) -> impl Iterator<Item = EcuAddress> + '_ {
        self.ecus.iter().map(|e| e.address)
    }

    /// Look up an ECU
    pub fn get(&self, address: EcuAddress) -> Option<&Ecu> {
        self.ecus.iter().find(|e| e.address == address)
    }

    /// ECU with the given display number
    pub fn by_number(&self, number: usize) -> Option<&Ecu> {
        self.ecus.iter().find(|e| e.number == number)
    }

    /// Display number (1, 2, ...) of an ECU
    pub fn display_number(&self, address: EcuAddress) -> Option<usize> {
        self.get(address).map(|e| e.number)
    }

    /// Supported-PID bitmap of an ECU
    pub fn supported_pids(&self, address: EcuAddress) -> Option<&SupportedPids> {
        self.get(address).map(|e| &e.supported)
    }

    /// Whether an address is known
    pub fn contains(&self, address: EcuAddress) -> bool {
        self.get(address).is_some()
    }

    /// Number of ECUs
    pub fn len(&self) -> usize {
        self.ecus.len()
    }

    /// Whether discovery found nothing
    pub fn is_empty(&self) -> bool {
        self.ecus.is_empty()
    }

    /// VINs of all ECUs that reported one, joined with `,`
    pub fn vin_summary(&self) -> String {
        self.ecus
            .iter()
            .filter_map(|e| e.vin.as_deref())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(crate) fn set_supported(&mut self, address: EcuAddress, supported: SupportedPids) {
        if let Some(ecu) = self.ecus.iter_mut().find(|e| e.address == address) {
            ecu.supported = supported;
        }
    }

    pub(crate) fn set_vin(&mut self, address: EcuAddress, vin: String) {
        if let Some(ecu) = self.ecus.iter_mut().find(|e| e.address == address) {
            ecu.vin = Some(vin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbering_in_first_seen_order() {
        let mut registry = EcuRegistry::new();
        assert_eq!(registry.register(EcuAddress(0x7E9)), 1);
        assert_eq!(registry.register(EcuAddress(0x7E8)), 2);
        assert_eq!(registry.register(EcuAddress(0x7E9)), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.addresses().collect::<Vec<_>>(),
            vec![EcuAddress(0x7E9), EcuAddress(0x7E8)]
        );
        assert_eq!(registry.by_number(2).map(|e| e.address), Some(EcuAddress(0x7E8)));
    }

    #[test]
    fn test_vin_summary_skips_missing() {
        let mut registry = EcuRegistry::new();
        registry.register(EcuAddress(0x7E8));
        registry.register(EcuAddress(0x7E9));
        registry.register(EcuAddress(0x7EA));
        registry.set_vin(EcuAddress(0x7E8), "1G1JC5444R7252367".into());
        registry.set_vin(EcuAddress(0x7E9), String::new());
        assert_eq!(registry.vin_summary(), "1G1JC5444R7252367");
    }

    #[test]
    fn test_request_headers() {
        assert_eq!(
            EcuAddress(0x7E8).request_header(HeaderFormat::Can11),
            Some("7E0".to_string())
        );
        assert_eq!(
            EcuAddress(0x10).request_header(HeaderFormat::Can29),
            Some("DA10F1".to_string())
        );
        assert_eq!(EcuAddress(0x10).request_header(HeaderFormat::Legacy), None);
    }
}
