//! Serial link to the ELM327 adapter
//!
//! One command in flight at a time: write `cmd\r`, read until the `>`
//! prompt under the response timeout.

use crate::error::CommError;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Prompt the adapter prints when it is ready for the next command
const PROMPT: u8 = b'>';

/// Quiet period that ends draining after a resync
const STALE_DRAIN_MS: u64 = 20;

/// Identification request used to bring the link back in step; every
/// ELM327 answers it without touching the vehicle bus
const SYNC_COMMAND: &str = "ATI";

/// `ATI` rounds before the adapter counts as unresponsive
const SYNC_ATTEMPTS: u32 = 2;

/// Baud rates offered for ELM327 adapters
pub const BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Byte stream to the adapter
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialIo for T {}

/// Opens the serial device; swapped out for the simulator in tests
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialIo>>;
}

/// Opens real serial devices through `tokio-serial`
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

impl PortOpener for SerialPortOpener {
    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialIo>> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()?;
        Ok(Box::new(stream))
    }
}

/// List serial ports present on this machine
pub fn available_ports() -> io::Result<Vec<String>> {
    let ports = tokio_serial::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Parameters for `ObdClient::connect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,
    /// Baud rate for serial communication
    pub baud_rate: u32,
    /// Response timeout per command in milliseconds
    pub timeout_ms: u64,
    /// Attempts to open and initialize the adapter
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
            timeout_ms: 2000,
            max_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

impl ConnectionSettings {
    /// Settings for a port with the remaining fields at their defaults
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    /// Response timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Attempt budget, at least one
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Open command/response channel to the adapter
pub struct ElmLink {
    io: Box<dyn SerialIo>,
    timeout: Duration,
    buffer: Vec<u8>,
    stale: bool,
}

impl ElmLink {
    /// Wrap an opened stream
    pub fn new(io: Box<dyn SerialIo>, timeout: Duration) -> Self {
        Self {
            io,
            timeout,
            buffer: Vec::with_capacity(256),
            stale: false,
        }
    }

    /// Response timeout in effect
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one command and return the text printed before the prompt.
    ///
    /// After a timeout or an out-of-step reply the link resyncs first, so a
    /// late answer to an earlier request is never taken for this one.
    pub async fn command(&mut self, cmd: &str) -> Result<String, CommError> {
        if self.stale {
            self.resync().await?;
        }

        debug!("-> {}", cmd);
        self.write_command(cmd).await?;

        match tokio::time::timeout(self.timeout, self.read_until_prompt()).await {
            Ok(Ok(reply)) => {
                debug!("<- {:?}", reply);
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("No prompt after {:?} for {}", self.timeout, cmd);
                self.stale = true;
                Err(CommError::Timeout(self.timeout.as_millis() as u64))
            }
        }
    }

    /// Flag the link as out of step; the next command resyncs first
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Whether the next command will resync first
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Bring the link back in step with the adapter.
    ///
    /// Sends `ATI` and discards every reply up to the one carrying the
    /// adapter identification. A busy adapter aborts its request on the
    /// first byte and prints `STOPPED`, so a second round is allowed before
    /// giving up with [`CommError::Timeout`].
    pub async fn resync(&mut self) -> Result<(), CommError> {
        self.buffer.clear();

        for round in 1..=SYNC_ATTEMPTS {
            debug!("-> {} (resync {}/{})", SYNC_COMMAND, round, SYNC_ATTEMPTS);
            self.write_command(SYNC_COMMAND).await?;

            let deadline = tokio::time::Instant::now() + self.timeout;
            loop {
                match tokio::time::timeout_at(deadline, self.read_until_prompt()).await {
                    Ok(Ok(reply)) if reply.contains("ELM") => {
                        self.drain_quiet().await;
                        self.stale = false;
                        debug!("Link back in step");
                        return Ok(());
                    }
                    Ok(Ok(reply)) => debug!("Discarding out-of-step reply {:?}", reply.trim()),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => break,
                }
            }
        }

        warn!("Adapter did not answer {} after {} rounds", SYNC_COMMAND, SYNC_ATTEMPTS);
        Err(CommError::Timeout(self.timeout.as_millis() as u64))
    }

    async fn write_command(&mut self, cmd: &str) -> Result<(), CommError> {
        self.io.write_all(cmd.as_bytes()).await?;
        self.io.write_all(b"\r").await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn read_until_prompt(&mut self) -> Result<String, CommError> {
        let mut chunk = [0u8; 128];
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == PROMPT) {
                let reply: Vec<u8> = self.buffer.drain(..=pos).take(pos).collect();
                return Ok(String::from_utf8_lossy(&reply).into_owned());
            }

            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                return Err(CommError::LinkLost("adapter closed the stream".to_string()));
            }
            // ELM327 may emit NUL bytes after a reset
            self.buffer.extend(chunk[..n].iter().filter(|b| **b != 0));
        }
    }

    /// Discard bytes until the adapter has been quiet for a moment
    async fn drain_quiet(&mut self) {
        let mut chunk = [0u8; 128];
        let wait = Duration::from_millis(STALE_DRAIN_MS);
        while let Ok(Ok(n)) = tokio::time::timeout(wait, self.io.read(&mut chunk)).await {
            if n == 0 {
                break;
            }
        }
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn read_command(adapter: &mut DuplexStream, expected: &str) {
        let mut seen = Vec::new();
        let mut buf = [0u8; 32];
        while !String::from_utf8_lossy(&seen).contains(expected) {
            let n = adapter.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.baud_rate, 38400);
        assert_eq!(settings.timeout(), Duration::from_millis(2000));

        let zero = ConnectionSettings {
            max_attempts: 0,
            ..ConnectionSettings::for_port("COM3")
        };
        assert_eq!(zero.attempts(), 1);
        assert_eq!(zero.port, "COM3");
    }

    #[tokio::test]
    async fn test_command_reads_until_prompt() {
        let (client, mut adapter) = duplex(256);
        let mut link = ElmLink::new(Box::new(client), Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            read_command(&mut adapter, "ATE0\r").await;
            adapter.write_all(b"OK\r\r").await.unwrap();
            adapter.write_all(b">").await.unwrap();
            adapter
        });

        let reply = link.command("ATE0").await.unwrap();
        assert_eq!(reply.trim(), "OK");
        drop(responder.await.unwrap());
    }

    #[tokio::test]
    async fn test_late_reply_does_not_shift_later_replies() {
        let (client, mut adapter) = duplex(256);
        let mut link = ElmLink::new(Box::new(client), Duration::from_millis(50));

        let responder = tokio::spawn(async move {
            read_command(&mut adapter, "0105\r").await;
            tokio::time::sleep(Duration::from_millis(80)).await;
            adapter.write_all(b"41 05 7B\r\r>").await.unwrap();
            read_command(&mut adapter, "ATI\r").await;
            adapter.write_all(b"ELM327 v1.5\r\r>").await.unwrap();
            read_command(&mut adapter, "0106\r").await;
            adapter.write_all(b"41 06 80\r\r>").await.unwrap();
            read_command(&mut adapter, "0107\r").await;
            adapter.write_all(b"41 07 7C\r\r>").await.unwrap();
            adapter
        });

        let first = link.command("0105").await;
        assert!(matches!(first, Err(CommError::Timeout(50))));
        assert!(link.is_stale());

        assert_eq!(link.command("0106").await.unwrap().trim(), "41 06 80");
        assert_eq!(link.command("0107").await.unwrap().trim(), "41 07 7C");
        assert!(!link.is_stale());
        drop(responder.await.unwrap());
    }

    #[tokio::test]
    async fn test_resync_fails_on_silent_adapter() {
        let (client, _adapter) = duplex(256);
        let mut link = ElmLink::new(Box::new(client), Duration::from_millis(30));

        assert!(matches!(link.command("0100").await, Err(CommError::Timeout(30))));
        assert!(matches!(link.command("0100").await, Err(CommError::Timeout(30))));
        assert!(link.is_stale());
    }

    #[tokio::test]
    async fn test_closed_stream_is_link_lost() {
        let (client, adapter) = duplex(64);
        drop(adapter);
        let mut link = ElmLink::new(Box::new(client), Duration::from_millis(100));
        assert!(link.command("0100").await.unwrap_err().is_link_failure());
    }
}
