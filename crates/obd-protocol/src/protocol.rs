//! OBD-II Protocol Definitions

use serde::{Deserialize, Serialize};

/// Supported OBD-II protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

/// Layout of the header in front of each reply line when headers are on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    /// Headers off; lines are bare payload
    None,
    /// Three hex digits, e.g. `7E8`
    Can11,
    /// Four bytes, source address in the last byte
    Can29,
    /// Priority, target, source bytes plus a trailing checksum
    Legacy,
}

impl ObdProtocol {
    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "ATSP0",
            ObdProtocol::J1850Pwm => "ATSP1",
            ObdProtocol::J1850Vpw => "ATSP2",
            ObdProtocol::Iso9141_2 => "ATSP3",
            ObdProtocol::Iso14230_4Kwp => "ATSP4",
            ObdProtocol::Iso14230_4KwpFast => "ATSP5",
            ObdProtocol::Iso15765_4Can11bit500 => "ATSP6",
            ObdProtocol::Iso15765_4Can29bit500 => "ATSP7",
            ObdProtocol::Iso15765_4Can11bit250 => "ATSP8",
            ObdProtocol::Iso15765_4Can29bit250 => "ATSP9",
        }
    }

    /// Parse an `ATDPN` reply such as `A6` (auto, protocol 6) or `3`
    pub fn from_elm_number(reply: &str) -> Option<Self> {
        let digit = reply.trim().trim_start_matches(['A', 'a']).chars().next()?;
        let protocol = match digit {
            '0' => ObdProtocol::Auto,
            '1' => ObdProtocol::J1850Pwm,
            '2' => ObdProtocol::J1850Vpw,
            '3' => ObdProtocol::Iso9141_2,
            '4' => ObdProtocol::Iso14230_4Kwp,
            '5' => ObdProtocol::Iso14230_4KwpFast,
            '6' => ObdProtocol::Iso15765_4Can11bit500,
            '7' => ObdProtocol::Iso15765_4Can29bit500,
            '8' => ObdProtocol::Iso15765_4Can11bit250,
            '9' => ObdProtocol::Iso15765_4Can29bit250,
            _ => return None,
        };
        Some(protocol)
    }

    /// Human-readable protocol name as reported in status events
    pub fn description(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "Automatic",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW",
            ObdProtocol::Iso9141_2 => "ISO 9141-2",
            ObdProtocol::Iso14230_4Kwp => "ISO 14230-4 (KWP 5BAUD)",
            ObdProtocol::Iso14230_4KwpFast => "ISO 14230-4 (KWP FAST)",
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 (CAN 11/500)",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 (CAN 29/500)",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 (CAN 11/250)",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 (CAN 29/250)",
        }
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }

    /// Header layout of reply lines once `ATH1` is in effect
    pub fn header_format(&self) -> HeaderFormat {
        match self {
            ObdProtocol::Iso15765_4Can11bit500 | ObdProtocol::Iso15765_4Can11bit250 => {
                HeaderFormat::Can11
            }
            ObdProtocol::Iso15765_4Can29bit500 | ObdProtocol::Iso15765_4Can29bit250 => {
                HeaderFormat::Can29
            }
            ObdProtocol::Auto => HeaderFormat::None,
            _ => HeaderFormat::Legacy,
        }
    }

    /// Header used for bus-wide (functional) requests, if the protocol supports `ATSH`
    pub fn functional_header(&self) -> Option<&'static str> {
        match self.header_format() {
            HeaderFormat::Can11 => Some("7DF"),
            HeaderFormat::Can29 => Some("DB33F1"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_elm_number() {
        assert_eq!(
            ObdProtocol::from_elm_number("A6"),
            Some(ObdProtocol::Iso15765_4Can11bit500)
        );
        assert_eq!(ObdProtocol::from_elm_number("3"), Some(ObdProtocol::Iso9141_2));
        assert_eq!(ObdProtocol::from_elm_number("?"), None);
    }

    #[test]
    fn test_header_formats() {
        assert_eq!(
            ObdProtocol::Iso15765_4Can29bit250.header_format(),
            HeaderFormat::Can29
        );
        assert_eq!(ObdProtocol::J1850Pwm.header_format(), HeaderFormat::Legacy);
        assert_eq!(ObdProtocol::J1850Vpw.functional_header(), None);
        assert_eq!(
            ObdProtocol::Iso15765_4Can11bit500.functional_header(),
            Some("7DF")
        );
    }
}
