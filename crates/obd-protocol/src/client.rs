//! OBD-II Client for ELM327 Adapters
//!
//! Owns the serial link for one connection session: adapter initialization,
//! protocol detection, ECU discovery and the Mode 01/03/04/07/09 requests.

use crate::dtc::{self, DtcEntry, DtcStatus};
use crate::ecu::{EcuAddress, EcuRegistry};
use crate::error::{CommError, ConnectError};
use crate::event::{EventSender, StatusField};
use crate::frame::{hex_bytes, parse_reply, EcuReply, NEGATIVE_RESPONSE};
use crate::link::{ConnectionSettings, ElmLink, PortOpener};
use crate::mode;
use crate::pid::{self, SensorReading, SupportedPids, MONITOR_STATUS_PID};
use crate::protocol::{HeaderFormat, ObdProtocol};
use crate::selftest::SelfTestStatus;
use tracing::{debug, error, info, warn};

/// Mode 09 PID carrying the VIN
const VIN_PID: u8 = 0x02;

/// Highest supported-PID range query (`01E0`)
const LAST_RANGE: u8 = 0xE0;

/// Driver link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Trouble codes reported by one ECU, stored codes first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuDtcs {
    pub ecu: EcuAddress,
    /// Display number of the ECU
    pub number: usize,
    pub entries: Vec<DtcEntry>,
}

/// Why one connect attempt failed
enum AttemptFailure {
    Open(String),
    Init(String),
}

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    port: String,
    link: Option<ElmLink>,
    state: LinkState,
    /// Protocol negotiated by the adapter
    protocol: ObdProtocol,
    adapter_version: String,
    registry: EcuRegistry,
    /// Header last set with `ATSH`
    current_header: Option<String>,
    /// Cleared after a timeout or link failure; skips the goodbye command
    responsive: bool,
    events: EventSender,
}

impl ObdClient {
    /// Open the port, initialize the adapter and discover ECUs.
    ///
    /// Each attempt opens the device afresh; nothing carries over between
    /// attempts. Exactly `settings.attempts()` attempts are made before
    /// giving up.
    pub async fn connect(
        opener: &dyn PortOpener,
        settings: &ConnectionSettings,
        events: EventSender,
    ) -> Result<Self, ConnectError> {
        let attempts = settings.attempts();
        let mut failure = AttemptFailure::Open("no attempt made".to_string());

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(std::time::Duration::from_millis(settings.retry_delay_ms)).await;
            }
            info!(
                "Connecting to OBD adapter on {} at {} baud (attempt {}/{})",
                settings.port, settings.baud_rate, attempt, attempts
            );

            let io = match opener.open(&settings.port, settings.baud_rate) {
                Ok(io) => io,
                Err(e) => {
                    warn!("Failed to open {}: {}", settings.port, e);
                    failure = AttemptFailure::Open(e.to_string());
                    continue;
                }
            };

            let mut client = Self {
                port: settings.port.clone(),
                link: Some(ElmLink::new(io, settings.timeout())),
                state: LinkState::Connecting,
                protocol: ObdProtocol::Auto,
                adapter_version: String::new(),
                registry: EcuRegistry::new(),
                current_header: None,
                responsive: true,
                events: events.clone(),
            };

            match client.initialize().await {
                Ok(()) => {
                    client.state = LinkState::Connected;
                    client.report_connected();
                    return Ok(client);
                }
                Err(e) => {
                    warn!("Adapter initialization failed: {}", e);
                    failure = AttemptFailure::Init(e);
                }
            }
        }

        let err = match failure {
            AttemptFailure::Open(reason) => ConnectError::PortUnavailable {
                port: settings.port.clone(),
                attempts,
                reason,
            },
            AttemptFailure::Init(reason) => ConnectError::ProtocolError(reason),
        };
        error!("Connect failed: {}", err);
        events.status(StatusField::Error, err.to_string());
        Err(err)
    }

    /// Adapter init, protocol detection and ECU discovery
    async fn initialize(&mut self) -> Result<(), String> {
        let reset = self.send("ATZ").await.map_err(|e| format!("ATZ: {}", e))?;
        self.adapter_version = reply_lines(&reset, "ATZ")
            .into_iter()
            .find(|l| l.contains("ELM"))
            .ok_or_else(|| format!("ATZ answered {:?}", reset.trim()))?
            .to_string();
        debug!("Adapter identifies as {}", self.adapter_version);

        for cmd in ["ATE0", "ATL0", "ATH0", ObdProtocol::Auto.to_elm_command()] {
            self.expect_ok(cmd).await?;
        }

        // Auto-detect: the adapter searches protocols on the first request
        let probe = self.send("0100").await.map_err(|e| format!("0100: {}", e))?;
        let detected = parse_reply(&probe, "0100", HeaderFormat::None)
            .map_err(|e| format!("0100: {}", e))?;
        if !detected
            .iter()
            .any(|r| r.pid_data(0x40 + mode::CURRENT_DATA, 0x00).is_some())
        {
            return Err(format!("no 41 00 reply to 0100: {:?}", probe.trim()));
        }

        let number = self.send("ATDPN").await.map_err(|e| format!("ATDPN: {}", e))?;
        self.protocol = reply_lines(&number, "ATDPN")
            .into_iter()
            .find_map(ObdProtocol::from_elm_number)
            .filter(|p| *p != ObdProtocol::Auto)
            .ok_or_else(|| format!("unknown protocol number {:?}", number.trim()))?;
        info!("Detected protocol: {}", self.protocol.description());

        // Discovery: headers on for the rest of the session
        self.expect_ok("ATH1").await?;
        let replies = self
            .request("0100", None)
            .await
            .map_err(|e| format!("ECU discovery: {}", e))?;
        for reply in &replies {
            if reply.pid_data(0x40 + mode::CURRENT_DATA, 0x00).is_some() {
                let number = self.registry.register(reply.address);
                info!("Found ECU {} at {}", number, reply.address);
            }
        }
        if self.registry.is_empty() {
            return Err("no ECU answered discovery".to_string());
        }

        let addresses: Vec<EcuAddress> = self.registry.addresses().collect();
        for address in addresses {
            let supported = self
                .query_supported(address)
                .await
                .map_err(|e| format!("supported PIDs of {}: {}", address, e))?;
            debug!("ECU {} supports {} PIDs", address, supported.count());
            self.registry.set_supported(address, supported);

            match self.query_vin(address).await {
                Ok(vin) => self.registry.set_vin(address, vin),
                Err(e) => warn!("VIN read from {} failed: {}", address, e),
            }
        }

        Ok(())
    }

    fn report_connected(&self) {
        info!(
            "OBD adapter connected: {} via {}, {} ECU(s)",
            self.adapter_version,
            self.protocol.description(),
            self.registry.len()
        );
        self.events.status(StatusField::Link, "Connected");
        self.events.status(StatusField::Protocol, self.protocol.description());
        self.events.status(StatusField::Adapter, self.adapter_version.as_str());
        self.events.status(StatusField::Port, self.port.as_str());
        self.events.status(StatusField::Vin, self.registry.vin_summary());
    }

    /// Raw command on the link, tracking link health
    async fn send(&mut self, cmd: &str) -> Result<String, CommError> {
        let link = self.link.as_mut().ok_or(CommError::NotConnected)?;
        let result = link.command(cmd).await;
        self.responsive = result.is_ok();
        result
    }

    async fn expect_ok(&mut self, cmd: &str) -> Result<(), String> {
        let reply = self.send(cmd).await.map_err(|e| format!("{}: {}", cmd, e))?;
        if reply_lines(&reply, cmd).iter().any(|l| *l == "OK") {
            Ok(())
        } else {
            Err(format!("{} answered {:?}", cmd, reply.trim()))
        }
    }

    /// Point `ATSH` at an ECU, or at the functional address for `None`
    async fn set_target(&mut self, target: Option<EcuAddress>) -> Result<(), CommError> {
        let format = self.protocol.header_format();
        let header = match target {
            Some(ecu) => ecu.request_header(format),
            None => None,
        }
        .or_else(|| self.protocol.functional_header().map(str::to_string));

        let Some(header) = header else {
            return Ok(());
        };
        if self.current_header.as_deref() == Some(header.as_str()) {
            return Ok(());
        }

        let cmd = format!("ATSH{}", header);
        let reply = self.send(&cmd).await?;
        if !reply_lines(&reply, &cmd).iter().any(|l| *l == "OK") {
            return Err(CommError::Adapter(format!("{} answered {:?}", cmd, reply.trim())));
        }
        self.current_header = Some(header);
        Ok(())
    }

    /// Send one OBD request; with a target only that ECU's reply is kept
    async fn request(
        &mut self,
        command: &str,
        target: Option<EcuAddress>,
    ) -> Result<Vec<EcuReply>, CommError> {
        self.set_target(target).await?;
        let raw = self.send(command).await?;
        let replies = match parse_reply(&raw, command, self.protocol.header_format()) {
            Ok(replies) if answers_other_request(command, &replies) => {
                warn!("Reply {:?} does not answer {}, resyncing", raw.trim(), command);
                self.mark_stale();
                return Err(CommError::OutOfStep(format!("{} answered {:?}", command, raw.trim())));
            }
            Ok(replies) => replies,
            Err(CommError::MalformedResponse(text)) => {
                self.mark_stale();
                return Err(CommError::MalformedResponse(text));
            }
            Err(e) => return Err(e),
        };

        match target {
            None => Ok(replies),
            Some(ecu) => {
                let mine: Vec<EcuReply> = replies.into_iter().filter(|r| r.address == ecu).collect();
                if mine.is_empty() || mine.iter().all(EcuReply::is_negative) {
                    Err(CommError::NoData)
                } else {
                    Ok(mine)
                }
            }
        }
    }

    fn mark_stale(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.mark_stale();
        }
    }

    fn ensure_connected(&self) -> Result<(), CommError> {
        if self.state == LinkState::Connected && self.link.is_some() {
            Ok(())
        } else {
            Err(CommError::NotConnected)
        }
    }

    async fn query_supported(&mut self, ecu: EcuAddress) -> Result<SupportedPids, CommError> {
        let mut supported = SupportedPids::new();
        let mut base = 0u8;

        loop {
            let cmd = format!("{:02X}{:02X}", mode::CURRENT_DATA, base);
            let replies = match self.request(&cmd, Some(ecu)).await {
                Ok(replies) => replies,
                // Continuation bit set but the next range is not answered
                Err(CommError::NoData) if base > 0 => break,
                Err(e) => return Err(e),
            };
            let data = replies
                .iter()
                .find_map(|r| r.pid_data(0x40 + mode::CURRENT_DATA, base))
                .ok_or(CommError::NoData)?;
            let mask: [u8; 4] = data
                .get(..4)
                .and_then(|d| d.try_into().ok())
                .ok_or_else(|| CommError::MalformedResponse(format!("{} mask {:02X?}", cmd, data)))?;

            if !supported.merge_range(base, mask) || base == LAST_RANGE {
                break;
            }
            base += 0x20;
        }

        Ok(supported)
    }

    async fn query_vin(&mut self, ecu: EcuAddress) -> Result<String, CommError> {
        let cmd = format!("{:02X}{:02X}", mode::VEHICLE_INFO, VIN_PID);
        let replies = match self.request(&cmd, Some(ecu)).await {
            Ok(replies) => replies,
            Err(CommError::NoData) => return Ok(String::new()),
            Err(e) => return Err(e),
        };

        let mut frames: Vec<&Vec<u8>> = replies
            .iter()
            .flat_map(|r| r.frames.iter())
            .filter(|f| f.len() > 3 && f[0] == 0x40 + mode::VEHICLE_INFO && f[1] == VIN_PID)
            .collect();
        // Legacy protocols send the VIN in sequence-numbered pieces
        frames.sort_by_key(|f| f[2]);

        let vin: String = frames
            .iter()
            .flat_map(|f| f[3..].iter())
            .filter(|b| b.is_ascii_alphanumeric())
            .map(|b| *b as char)
            .collect();
        Ok(vin)
    }

    /// Supported-PID bitmap of one ECU, queried range by range
    pub async fn supported_pids(&mut self, ecu: EcuAddress) -> Result<SupportedPids, CommError> {
        self.ensure_connected()?;
        self.query_supported(ecu).await
    }

    /// Read and decode one live sensor value
    pub async fn sensor_value(&mut self, pid: u8, ecu: EcuAddress) -> Result<SensorReading, CommError> {
        self.ensure_connected()?;
        let spec = pid::sensor(pid).ok_or(CommError::UnknownPid(pid))?;
        let cmd = spec.command();

        let replies = self.request(&cmd, Some(ecu)).await?;
        let data = replies
            .iter()
            .find_map(|r| r.pid_data(0x40 + mode::CURRENT_DATA, pid))
            .ok_or_else(|| CommError::MalformedResponse(format!("no {} data in reply", cmd)))?;
        Ok(spec.decode(data)?)
    }

    /// VIN of one ECU; empty if the ECU does not report one
    pub async fn vin(&mut self, ecu: EcuAddress) -> Result<String, CommError> {
        self.ensure_connected()?;
        self.query_vin(ecu).await
    }

    /// Stored (Mode 03) and pending (Mode 07) codes of every known ECU
    pub async fn dtcs(&mut self) -> Result<Vec<EcuDtcs>, CommError> {
        self.ensure_connected()?;
        let is_can = self.protocol.is_can();
        let mut result: Vec<EcuDtcs> = self
            .registry
            .all_ecus()
            .iter()
            .map(|e| EcuDtcs {
                ecu: e.address,
                number: e.number,
                entries: Vec::new(),
            })
            .collect();

        for (service, status) in [
            (mode::READ_DTC, DtcStatus::Stored),
            (mode::PENDING_DTC, DtcStatus::Pending),
        ] {
            let replies = match self.request(&format!("{:02X}", service), None).await {
                Ok(replies) => replies,
                Err(CommError::NoData) => Vec::new(),
                Err(e) => return Err(e),
            };

            for reply in replies {
                let Some(slot) = result.iter_mut().find(|d| d.ecu == reply.address) else {
                    debug!("Ignoring codes from unknown ECU {}", reply.address);
                    continue;
                };
                for code in dtc::parse_codes(&reply.frames, service + 0x40, is_can) {
                    slot.entries.push(DtcEntry::new(status, code));
                }
            }
        }

        Ok(result)
    }

    /// Clear stored codes on the whole bus (Mode 04)
    pub async fn clear_dtcs(&mut self) -> Result<(), CommError> {
        self.ensure_connected()?;
        let replies = self.request(&format!("{:02X}", mode::CLEAR_DTC), None).await?;
        let acknowledged = replies
            .iter()
            .flat_map(|r| r.frames.iter())
            .any(|f| f.first() == Some(&(mode::CLEAR_DTC + 0x40)));
        if acknowledged {
            info!("Trouble codes cleared");
            Ok(())
        } else {
            warn!("Clear request refused by every ECU");
            Err(CommError::NoData)
        }
    }

    /// Monitor status (Mode 01 PID 01) of one ECU
    pub async fn self_test_status(&mut self, ecu: EcuAddress) -> Result<SelfTestStatus, CommError> {
        self.ensure_connected()?;
        let replies = self
            .request(&format!("{:02X}{:02X}", mode::CURRENT_DATA, MONITOR_STATUS_PID), Some(ecu))
            .await?;
        let data = replies
            .iter()
            .find_map(|r| r.pid_data(0x40 + mode::CURRENT_DATA, MONITOR_STATUS_PID))
            .ok_or(CommError::NoData)?;
        Ok(SelfTestStatus::decode(data)?)
    }

    /// Check that the adapter itself still answers, independent of any ECU.
    ///
    /// Also brings the link back in step after timeouts.
    pub async fn check_adapter(&mut self) -> Result<(), CommError> {
        self.ensure_connected()?;
        let link = self.link.as_mut().ok_or(CommError::NotConnected)?;
        let result = link.resync().await;
        self.responsive = result.is_ok();
        result
    }

    /// Close the link. A no-op when already disconnected.
    pub async fn disconnect(&mut self) {
        let Some(mut link) = self.link.take() else {
            debug!("Disconnect requested with no open link");
            return;
        };

        if self.state == LinkState::Connected && self.responsive {
            // Best effort; the link is dropped either way
            if let Err(e) = link.command("ATPC").await {
                debug!("ATPC on disconnect failed: {}", e);
            }
        }
        drop(link);

        info!("Disconnected from {}", self.port);
        self.state = LinkState::Disconnected;
        self.registry = EcuRegistry::new();
        self.current_header = None;
        self.events.status(StatusField::Link, "Disconnected");
        self.events.status(StatusField::Adapter, "----");
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Check if client is connected
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Get current protocol
    pub fn protocol(&self) -> ObdProtocol {
        self.protocol
    }

    /// Adapter identification from `ATZ`
    pub fn adapter_version(&self) -> &str {
        &self.adapter_version
    }

    /// Serial port of this session
    pub fn port(&self) -> &str {
        &self.port
    }

    /// ECUs found during discovery; empty once disconnected
    pub fn registry(&self) -> &EcuRegistry {
        &self.registry
    }

    /// Event sender shared with the poller
    pub fn events(&self) -> &EventSender {
        &self.events
    }
}

/// Whether any frame answers a different service or PID than `command`
fn answers_other_request(command: &str, replies: &[EcuReply]) -> bool {
    let Ok(request) = hex_bytes(command) else {
        return false;
    };
    let Some(&service) = request.first() else {
        return false;
    };
    let positive = service.wrapping_add(0x40);

    replies
        .iter()
        .flat_map(|r| r.frames.iter())
        .any(|frame| match frame.first() {
            None => false,
            Some(&NEGATIVE_RESPONSE) => frame.get(1).is_some_and(|s| *s != service),
            Some(&id) if id == positive => match request.get(1) {
                Some(pid) => frame.get(1).is_some_and(|p| p != pid),
                None => false,
            },
            Some(_) => true,
        })
}

/// Non-empty reply lines with the echoed command removed
fn reply_lines<'a>(reply: &'a str, cmd: &str) -> Vec<&'a str> {
    reply
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case(cmd))
        .collect()
}
