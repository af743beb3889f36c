//! Adapter reply parsing
//!
//! Turns the text an ELM327 prints before its `>` prompt into per-ECU
//! payloads: echo and status lines are dropped, adapter error strings are
//! mapped to [`CommError`], headers are split off and CAN ISO-TP frames are
//! reassembled.

use crate::ecu::EcuAddress;
use crate::error::CommError;
use crate::protocol::HeaderFormat;
use std::collections::HashMap;

/// Negative response service id
pub const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Adapter messages that mean the request failed
const ADAPTER_ERRORS: &[&str] = &[
    "?",
    "ACT ALERT",
    "BUFFER FULL",
    "BUS BUSY",
    "BUS ERROR",
    "CAN ERROR",
    "DATA ERROR",
    "ERROR",
    "FB ERROR",
    "LP ALERT",
    "LV RESET",
    "STOPPED",
    "UNABLE TO CONNECT",
];

/// All frames one ECU sent in reply to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuReply {
    /// Source address from the header (`EcuAddress(0)` with headers off)
    pub address: EcuAddress,
    /// Reassembled payloads, starting with the response service byte
    pub frames: Vec<Vec<u8>>,
}

impl EcuReply {
    /// Data bytes following `response_mode, pid` in the first matching frame
    pub fn pid_data(&self, response_mode: u8, pid: u8) -> Option<&[u8]> {
        self.frames
            .iter()
            .find(|f| f.len() >= 2 && f[0] == response_mode && f[1] == pid)
            .map(|f| &f[2..])
    }

    /// Whether the ECU answered with a negative response
    pub fn is_negative(&self) -> bool {
        !self.frames.is_empty() && self.frames.iter().all(|f| f.first() == Some(&NEGATIVE_RESPONSE))
    }
}

#[derive(Default)]
struct Assembly {
    expected: usize,
    data: Vec<u8>,
}

/// Parse the raw text of one reply.
///
/// `command` is the request that produced it, used to strip an echoed line.
pub fn parse_reply(
    raw: &str,
    command: &str,
    format: HeaderFormat,
) -> Result<Vec<EcuReply>, CommError> {
    let mut replies: Vec<EcuReply> = Vec::new();
    let mut pending: HashMap<EcuAddress, Assembly> = HashMap::new();
    let mut adapter_error: Option<String> = None;

    for line in raw.split(['\r', '\n']).map(str::trim).filter(|l| !l.is_empty()) {
        if line.eq_ignore_ascii_case(command) || line.starts_with("SEARCHING") {
            continue;
        }
        if let Some(status) = line.strip_prefix("BUS INIT") {
            if status.contains("ERROR") {
                adapter_error = Some(line.to_string());
            }
            continue;
        }
        if line == "NO DATA" {
            continue;
        }
        if ADAPTER_ERRORS.contains(&line) || line.starts_with('<') {
            adapter_error = Some(line.to_string());
            continue;
        }

        // Headers-off multi-frame output: a byte-count line, then `N: ...` lines
        let line = match line.split_once(':') {
            Some((_, data)) => data,
            None => line,
        };
        let hex: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CommError::MalformedResponse(line.to_string()));
        }
        if format == HeaderFormat::None && hex.len() == 3 {
            continue;
        }

        match format {
            HeaderFormat::None => {
                let bytes = hex_bytes(&hex)?;
                push_frame(&mut replies, EcuAddress(0), bytes);
            }
            HeaderFormat::Can11 => {
                if hex.len() < 5 {
                    return Err(CommError::MalformedResponse(line.to_string()));
                }
                let address = u32::from_str_radix(&hex[..3], 16)
                    .map_err(|_| CommError::MalformedResponse(line.to_string()))?;
                let bytes = hex_bytes(&hex[3..])?;
                reassemble(&mut replies, &mut pending, EcuAddress(address), &bytes, line)?;
            }
            HeaderFormat::Can29 => {
                let bytes = hex_bytes(&hex)?;
                if bytes.len() < 5 {
                    return Err(CommError::MalformedResponse(line.to_string()));
                }
                let address = EcuAddress(bytes[3] as u32);
                reassemble(&mut replies, &mut pending, address, &bytes[4..], line)?;
            }
            HeaderFormat::Legacy => {
                let bytes = hex_bytes(&hex)?;
                if bytes.len() < 5 {
                    return Err(CommError::MalformedResponse(line.to_string()));
                }
                let address = EcuAddress(bytes[2] as u32);
                push_frame(&mut replies, address, bytes[3..bytes.len() - 1].to_vec());
            }
        }
    }

    if !pending.is_empty() {
        return Err(CommError::MalformedResponse(
            "incomplete multi-frame reply".to_string(),
        ));
    }

    if replies.is_empty() {
        return Err(match adapter_error {
            Some(message) => CommError::Adapter(message),
            None => CommError::NoData,
        });
    }

    Ok(replies)
}

fn reassemble(
    replies: &mut Vec<EcuReply>,
    pending: &mut HashMap<EcuAddress, Assembly>,
    address: EcuAddress,
    bytes: &[u8],
    line: &str,
) -> Result<(), CommError> {
    let malformed = || CommError::MalformedResponse(line.to_string());
    let (&pci, rest) = bytes.split_first().ok_or_else(malformed)?;

    match pci >> 4 {
        0x0 => {
            let len = (pci & 0x0F) as usize;
            if len > rest.len() {
                return Err(malformed());
            }
            push_frame(replies, address, rest[..len].to_vec());
        }
        0x1 => {
            let (&low, data) = rest.split_first().ok_or_else(malformed)?;
            let expected = (((pci & 0x0F) as usize) << 8) | low as usize;
            pending.insert(
                address,
                Assembly {
                    expected,
                    data: data.to_vec(),
                },
            );
        }
        0x2 => {
            let assembly = pending.get_mut(&address).ok_or_else(malformed)?;
            assembly.data.extend_from_slice(rest);
            if assembly.data.len() >= assembly.expected {
                if let Some(mut done) = pending.remove(&address) {
                    done.data.truncate(done.expected);
                    push_frame(replies, address, done.data);
                }
            }
        }
        _ => return Err(malformed()),
    }
    Ok(())
}

fn push_frame(replies: &mut Vec<EcuReply>, address: EcuAddress, frame: Vec<u8>) {
    match replies.iter_mut().find(|r| r.address == address) {
        Some(reply) => reply.frames.push(frame),
        None => replies.push(EcuReply {
            address,
            frames: vec![frame],
        }),
    }
}

/// Parse an even-length run of hex digits
pub fn hex_bytes(hex: &str) -> Result<Vec<u8>, CommError> {
    if hex.len() % 2 != 0 {
        return Err(CommError::MalformedResponse(hex.to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| CommError::MalformedResponse(hex.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_off_single_line() {
        let replies = parse_reply("0100\r41 00 BE 3F A8 13\r", "0100", HeaderFormat::None).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0].pid_data(0x41, 0x00),
            Some(&[0xBE, 0x3F, 0xA8, 0x13][..])
        );
    }

    #[test]
    fn test_can11_two_ecus_first_seen_order() {
        let raw = "SEARCHING...\r7E9 06 41 00 98 18 80 11\r7E8 06 41 00 BE 3F A8 13\r";
        let replies = parse_reply(raw, "0100", HeaderFormat::Can11).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].address, EcuAddress(0x7E9));
        assert_eq!(replies[1].address, EcuAddress(0x7E8));
    }

    #[test]
    fn test_can11_multi_frame_vin() {
        let raw = "7E8 10 14 49 02 01 31 47 31\r\
                   7E8 21 4A 43 35 34 34 34 52\r\
                   7E8 22 37 32 35 32 33 36 37\r";
        let replies = parse_reply(raw, "0902", HeaderFormat::Can11).unwrap();
        let frame = &replies[0].frames[0];
        assert_eq!(frame.len(), 0x14);
        assert_eq!(&frame[..3], &[0x49, 0x02, 0x01]);
        assert_eq!(std::str::from_utf8(&frame[3..]).unwrap(), "1G1JC5444R7252367");
    }

    #[test]
    fn test_can29_and_legacy_addresses() {
        let raw = "18 DA F1 10 03 41 0D 37";
        let replies = parse_reply(raw, "010D", HeaderFormat::Can29).unwrap();
        assert_eq!(replies[0].address, EcuAddress(0x10));
        assert_eq!(replies[0].pid_data(0x41, 0x0D), Some(&[0x37][..]));

        let raw = "48 6B 10 41 0D 37 CE";
        let replies = parse_reply(raw, "010D", HeaderFormat::Legacy).unwrap();
        assert_eq!(replies[0].address, EcuAddress(0x10));
        assert_eq!(replies[0].frames[0], vec![0x41, 0x0D, 0x37]);
    }

    #[test]
    fn test_no_data_and_adapter_errors() {
        assert!(matches!(
            parse_reply("NO DATA\r", "0142", HeaderFormat::Can11),
            Err(CommError::NoData)
        ));
        assert!(matches!(
            parse_reply("UNABLE TO CONNECT\r", "0100", HeaderFormat::None),
            Err(CommError::Adapter(_))
        ));
        assert!(matches!(
            parse_reply("BUS INIT: ...ERROR\r", "0100", HeaderFormat::Legacy),
            Err(CommError::Adapter(_))
        ));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_reply("7E8 06 41 0C ZZ\r", "010C", HeaderFormat::Can11),
            Err(CommError::MalformedResponse(_))
        ));
        // single frame claims 6 bytes but carries 3
        assert!(matches!(
            parse_reply("7E8 06 41 0C 1A\r", "010C", HeaderFormat::Can11),
            Err(CommError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_reply("7E8 10 14 49 02 01 31 47 31\r", "0902", HeaderFormat::Can11),
            Err(CommError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_negative_response() {
        let replies = parse_reply("7E8 03 7F 09 12\r", "0902", HeaderFormat::Can11).unwrap();
        assert!(replies[0].is_negative());
    }
}
