//! In-process ELM327 emulator
//!
//! Serves a simulated vehicle over `tokio::io::duplex` so the real client
//! code runs end to end without hardware. The adapter speaks ISO 15765-4
//! CAN 11/500 and honours echo, headers, spaces and `ATSH` targeting.

use crate::link::{PortOpener, SerialIo};
use crate::mode;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

/// Functional request id on CAN 11-bit
const FUNCTIONAL_ID: u32 = 0x7DF;

/// One simulated control unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedEcu {
    /// Response CAN id, e.g. 0x7E8
    pub address: u32,
    /// Mode 01 data bytes per PID
    pub pids: BTreeMap<u8, Vec<u8>>,
    /// PID 01 bytes A..D; `None` if the ECU does not report PID 01
    pub monitor_status: Option<[u8; 4]>,
    /// Stored codes as raw byte pairs
    pub stored_dtcs: Vec<u16>,
    /// Pending codes as raw byte pairs
    pub pending_dtcs: Vec<u16>,
    /// VIN reported through Mode 09 PID 02
    pub vin: Option<String>,
}

impl SimulatedEcu {
    pub fn new(address: u32) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn with_pid(mut self, pid: u8, data: &[u8]) -> Self {
        self.pids.insert(pid, data.to_vec());
        self
    }

    pub fn with_monitor_status(mut self, status: [u8; 4]) -> Self {
        self.monitor_status = Some(status);
        self
    }

    pub fn with_stored_dtc(mut self, raw: u16) -> Self {
        self.stored_dtcs.push(raw);
        self
    }

    pub fn with_pending_dtc(mut self, raw: u16) -> Self {
        self.pending_dtcs.push(raw);
        self
    }

    pub fn with_vin(mut self, vin: &str) -> Self {
        self.vin = Some(vin.to_string());
        self
    }

    fn supports(&self, pid: u8) -> bool {
        (pid == 0x01 && self.monitor_status.is_some()) || self.pids.contains_key(&pid)
    }

    /// Supported-PID mask for the range starting at `base`, if the ECU
    /// answers that range query at all
    fn range_mask(&self, base: u8) -> Option<[u8; 4]> {
        let highest = (1..=u8::MAX).rev().find(|p| self.supports(*p)).unwrap_or(0);
        if base != 0 && highest <= base {
            return None;
        }

        let mut mask = 0u32;
        for offset in 1..=0x20u32 {
            let pid = base as u32 + offset;
            let continuation = offset == 0x20 && (highest as u32) > pid;
            if pid <= 0xFF && (self.supports(pid as u8) || continuation) {
                mask |= 1 << (32 - offset);
            }
        }
        Some(mask.to_be_bytes())
    }

    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let (&service, args) = request.split_first()?;
        let reply_id = service.wrapping_add(0x40);

        match service {
            mode::CURRENT_DATA => {
                let pid = *args.first()?;
                let data = if pid % 0x20 == 0 {
                    self.range_mask(pid)?.to_vec()
                } else if pid == 0x01 {
                    self.monitor_status?.to_vec()
                } else {
                    self.pids.get(&pid)?.clone()
                };
                let mut reply = vec![reply_id, pid];
                reply.extend(data);
                Some(reply)
            }
            mode::READ_DTC | mode::PENDING_DTC => {
                let codes = if service == mode::READ_DTC {
                    &self.stored_dtcs
                } else {
                    &self.pending_dtcs
                };
                let mut reply = vec![reply_id, codes.len() as u8];
                for code in codes {
                    reply.extend(code.to_be_bytes());
                }
                Some(reply)
            }
            mode::CLEAR_DTC => {
                self.stored_dtcs.clear();
                self.pending_dtcs.clear();
                if let Some(status) = self.monitor_status.as_mut() {
                    status[0] = 0;
                }
                Some(vec![reply_id])
            }
            mode::VEHICLE_INFO => {
                let vin = self.vin.as_ref()?;
                match args.first()? {
                    0x00 => Some(vec![reply_id, 0x00, 0x40, 0x00, 0x00, 0x00]),
                    0x02 => {
                        let mut reply = vec![reply_id, 0x02, 0x01];
                        reply.extend(vin.as_bytes());
                        Some(reply)
                    }
                    _ => Some(vec![0x7F, service, 0x12]),
                }
            }
            _ => None,
        }
    }
}

/// A simulated vehicle behind the adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedVehicle {
    /// ECUs in bus order
    pub ecus: Vec<SimulatedEcu>,
    /// Mode 01 PIDs the adapter never answers (forces a timeout)
    pub stalled_pids: BTreeSet<u8>,
    /// Mode 01 PIDs answered only after this many milliseconds
    pub late_pids: BTreeMap<u8, u64>,
    /// Reply `?` to `ATE0`
    pub reject_init: bool,
    /// No ECU answers at all
    pub ignition_off: bool,
}

impl SimulatedVehicle {
    pub fn new(ecus: Vec<SimulatedEcu>) -> Self {
        Self {
            ecus,
            ..Default::default()
        }
    }

    /// Petrol car with an engine and a transmission controller
    pub fn demo() -> Self {
        let engine = SimulatedEcu::new(0x7E8)
            .with_monitor_status([0x82, 0x07, 0x65, 0x21])
            .with_pid(0x03, &[0x02, 0x00])
            .with_pid(0x04, &[0x5A])
            .with_pid(0x05, &[0x7B])
            .with_pid(0x06, &[0x82])
            .with_pid(0x07, &[0x7C])
            .with_pid(0x0B, &[0x21])
            .with_pid(0x0C, &[0x0C, 0x4E])
            .with_pid(0x0D, &[0x32])
            .with_pid(0x0E, &[0x8C])
            .with_pid(0x0F, &[0x46])
            .with_pid(0x10, &[0x01, 0xF4])
            .with_pid(0x11, &[0x33])
            .with_pid(0x14, &[0x5A, 0x80])
            .with_pid(0x1C, &[0x06])
            .with_pid(0x1F, &[0x02, 0x58])
            .with_pid(0x2F, &[0xA0])
            .with_pid(0x33, &[0x65])
            .with_pid(0x42, &[0x35, 0x84])
            .with_pid(0x46, &[0x3C])
            .with_pid(0x51, &[0x01])
            .with_stored_dtc(0x0133)
            .with_stored_dtc(0x0300)
            .with_pending_dtc(0x0171)
            .with_vin("1G1JC5444R7252367");
        let transmission = SimulatedEcu::new(0x7E9)
            .with_monitor_status([0x00, 0x00, 0x00, 0x00])
            .with_pid(0x0D, &[0x32])
            .with_pid(0x1F, &[0x02, 0x58])
            .with_pid(0x5C, &[0x5F]);
        Self::new(vec![engine, transmission])
    }

    pub fn ecu_mut(&mut self, address: u32) -> Option<&mut SimulatedEcu> {
        self.ecus.iter_mut().find(|e| e.address == address)
    }
}

struct Shared {
    vehicle: Mutex<SimulatedVehicle>,
    requests: Mutex<Vec<String>>,
    opens: AtomicU32,
    unreachable: bool,
    unplugged: AtomicBool,
    silent: AtomicBool,
}

/// ELM327 emulator; implements [`PortOpener`]
#[derive(Clone)]
pub struct SimulatedAdapter {
    shared: Arc<Shared>,
}

impl SimulatedAdapter {
    /// Adapter wired to a vehicle
    pub fn new(vehicle: SimulatedVehicle) -> Self {
        Self::build(vehicle, false)
    }

    /// A port that never opens
    pub fn unreachable() -> Self {
        Self::build(SimulatedVehicle::default(), true)
    }

    fn build(vehicle: SimulatedVehicle, unreachable: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                vehicle: Mutex::new(vehicle),
                requests: Mutex::new(Vec::new()),
                opens: AtomicU32::new(0),
                unreachable,
                unplugged: AtomicBool::new(false),
                silent: AtomicBool::new(false),
            }),
        }
    }

    /// Number of times the port was opened (or attempted)
    pub fn open_count(&self) -> u32 {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// OBD requests received so far (AT commands excluded)
    pub fn requests(&self) -> Vec<String> {
        lock(&self.shared.requests).clone()
    }

    pub fn clear_requests(&self) {
        lock(&self.shared.requests).clear();
    }

    /// Change the vehicle while connected
    pub fn update(&self, f: impl FnOnce(&mut SimulatedVehicle)) {
        f(&mut lock(&self.shared.vehicle));
    }

    /// Drop the connection on the next command, as if the cable was pulled
    pub fn unplug(&self) {
        self.shared.unplugged.store(true, Ordering::SeqCst);
    }

    /// Stop answering anything while keeping the stream open, as an
    /// adapter that lost power on the vehicle side does
    pub fn go_silent(&self) {
        self.shared.silent.store(true, Ordering::SeqCst);
    }
}

impl PortOpener for SimulatedAdapter {
    fn open(&self, port: &str, _baud_rate: u32) -> io::Result<Box<dyn SerialIo>> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if self.shared.unreachable {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", port),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let (client, server) = tokio::io::duplex(4096);
        self.shared.unplugged.store(false, Ordering::SeqCst);
        self.shared.silent.store(false, Ordering::SeqCst);
        runtime.spawn(serve(server, self.shared.clone()));
        debug!("Simulated adapter opened on {}", port);
        Ok(Box::new(client))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct AdapterState {
    echo: bool,
    headers: bool,
    spaces: bool,
    searched: bool,
    target: u32,
}

impl Default for AdapterState {
    fn default() -> Self {
        Self {
            echo: true,
            headers: false,
            spaces: true,
            searched: false,
            target: FUNCTIONAL_ID,
        }
    }
}

async fn serve(mut io: DuplexStream, shared: Arc<Shared>) {
    let mut state = AdapterState::default();
    let mut line = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        let n = match io.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte != b'\r' {
                if byte != b'\n' {
                    line.push(byte);
                }
                continue;
            }
            if shared.unplugged.load(Ordering::SeqCst) {
                debug!("Simulated adapter unplugged");
                return;
            }

            let raw = String::from_utf8_lossy(&line).into_owned();
            line.clear();
            if shared.silent.load(Ordering::SeqCst) {
                continue;
            }
            let command: String = raw
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_ascii_uppercase();
            if command.is_empty() {
                continue;
            }

            let delay = late_reply_delay(&shared, &command);
            let Some(body) = handle(&mut state, &shared, &command) else {
                continue;
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut reply = String::new();
            if state.echo || command == "ATE0" {
                reply.push_str(&raw);
                reply.push('\r');
            }
            reply.push_str(&body);
            reply.push_str("\r\r>");
            if io.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Delay before answering a late Mode 01 PID
fn late_reply_delay(shared: &Shared, command: &str) -> Option<Duration> {
    let request = parse_hex(command)?;
    if request.first() != Some(&mode::CURRENT_DATA) {
        return None;
    }
    let vehicle = lock(&shared.vehicle);
    let ms = vehicle.late_pids.get(request.get(1)?)?;
    Some(Duration::from_millis(*ms))
}

/// Reply body for one command; `None` means stay silent
fn handle(state: &mut AdapterState, shared: &Shared, command: &str) -> Option<String> {
    if let Some(at) = command.strip_prefix("AT") {
        return Some(handle_at(state, shared, at));
    }

    lock(&shared.requests).push(command.to_string());

    let Some(request) = parse_hex(command) else {
        return Some("?".to_string());
    };
    let mut vehicle = lock(&shared.vehicle);

    if request.first() == Some(&mode::CURRENT_DATA)
        && request.get(1).is_some_and(|pid| vehicle.stalled_pids.contains(pid))
    {
        return None;
    }
    if vehicle.ignition_off {
        return Some("UNABLE TO CONNECT".to_string());
    }

    let target = state.target;
    let mut lines = Vec::new();
    for ecu in vehicle.ecus.iter_mut() {
        if target != FUNCTIONAL_ID && ecu.address != target + 8 {
            continue;
        }
        if let Some(payload) = ecu.respond(&request) {
            lines.extend(format_payload(state, ecu.address, &payload));
        }
    }

    let mut body = String::new();
    if !state.searched {
        state.searched = true;
        body.push_str("SEARCHING...\r");
    }
    if lines.is_empty() {
        body.push_str("NO DATA");
    } else {
        body.push_str(&lines.join("\r"));
    }
    Some(body)
}

fn handle_at(state: &mut AdapterState, shared: &Shared, at: &str) -> String {
    let ok = "OK".to_string();
    match at {
        "Z" | "WS" => {
            *state = AdapterState::default();
            "\rELM327 v1.5".to_string()
        }
        "I" => "ELM327 v1.5".to_string(),
        "E0" if lock(&shared.vehicle).reject_init => "?".to_string(),
        "E0" | "E1" => {
            state.echo = at == "E1";
            ok
        }
        "H0" | "H1" => {
            state.headers = at == "H1";
            ok
        }
        "S0" | "S1" => {
            state.spaces = at == "S1";
            ok
        }
        "DPN" => "A6".to_string(),
        "DP" => "AUTO, ISO 15765-4 (CAN 11/500)".to_string(),
        "RV" => "12.6V".to_string(),
        _ if at.starts_with("SH") => match u32::from_str_radix(&at[2..], 16) {
            Ok(id) => {
                state.target = id;
                ok
            }
            Err(_) => "?".to_string(),
        },
        _ if at.starts_with('L') || at.starts_with("SP") || at.starts_with("ST") => ok,
        _ if at.starts_with("AT") || at == "PC" || at == "D" => ok,
        _ => "?".to_string(),
    }
}

/// Render one ECU payload the way the adapter prints it
fn format_payload(state: &AdapterState, address: u32, payload: &[u8]) -> Vec<String> {
    let hex = |bytes: &[u8]| -> String {
        let parts: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        parts.join(if state.spaces { " " } else { "" })
    };
    let sep = if state.spaces { " " } else { "" };

    if !state.headers {
        if payload.len() <= 7 {
            return vec![hex(payload)];
        }
        let mut lines = vec![format!("{:03X}", payload.len())];
        for (i, chunk) in payload.chunks(7).enumerate() {
            lines.push(format!("{:X}:{}{}", i % 16, sep, hex(chunk)));
        }
        return lines;
    }

    let header = format!("{:03X}", address);
    if payload.len() <= 7 {
        let mut frame = vec![payload.len() as u8];
        frame.extend_from_slice(payload);
        return vec![format!("{}{}{}", header, sep, hex(&frame))];
    }

    let len = payload.len();
    let mut first = vec![0x10 | ((len >> 8) as u8 & 0x0F), (len & 0xFF) as u8];
    first.extend_from_slice(&payload[..6]);
    let mut lines = vec![format!("{}{}{}", header, sep, hex(&first))];
    for (i, chunk) in payload[6..].chunks(7).enumerate() {
        let mut frame = vec![0x20 | ((i + 1) % 16) as u8];
        frame.extend_from_slice(chunk);
        lines.push(format!("{}{}{}", header, sep, hex(&frame)));
    }
    lines
}

fn parse_hex(command: &str) -> Option<Vec<u8>> {
    if command.len() < 2 || command.len() % 2 != 0 {
        return None;
    }
    (0..command.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&command[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_masks() {
        let ecu = SimulatedEcu::new(0x7E8)
            .with_monitor_status([0; 4])
            .with_pid(0x0C, &[0, 0])
            .with_pid(0x42, &[0, 0]);
        let first = ecu.range_mask(0x00).unwrap();
        // PID 01 and 0C plus the continuation bit for 0x20
        assert_eq!(first, [0x80, 0x10, 0x00, 0x01]);
        let second = ecu.range_mask(0x20).unwrap();
        assert_eq!(second, [0x00, 0x00, 0x00, 0x01]);
        let third = ecu.range_mask(0x40).unwrap();
        assert_eq!(third, [0x40, 0x00, 0x00, 0x00]);
        assert_eq!(ecu.range_mask(0x60), None);
    }

    #[test]
    fn test_multi_frame_format() {
        let state = AdapterState {
            headers: true,
            ..Default::default()
        };
        let mut payload = vec![0x49, 0x02, 0x01];
        payload.extend(b"1G1JC5444R7252367");
        let lines = format_payload(&state, 0x7E8, &payload);
        assert_eq!(lines[0], "7E8 10 14 49 02 01 31 47 31");
        assert_eq!(lines[1], "7E8 21 4A 43 35 34 34 34 52");
        assert_eq!(lines[2], "7E8 22 37 32 35 32 33 36 37");
    }

    #[test]
    fn test_clear_resets_codes_and_mil() {
        let mut ecu = SimulatedEcu::new(0x7E8)
            .with_monitor_status([0x81, 0, 0, 0])
            .with_stored_dtc(0x0133);
        assert_eq!(ecu.respond(&[0x04]), Some(vec![0x44]));
        assert_eq!(ecu.respond(&[0x03]), Some(vec![0x43, 0x00]));
        assert_eq!(ecu.respond(&[0x01, 0x01]), Some(vec![0x41, 0x01, 0, 0, 0, 0]));
    }
}
