//! Session Error Types

use obd_protocol::{CommError, ConnectError, EcuAddress};
use thiserror::Error;

/// Errors returned by [`crate::Session`] operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Comm(#[from] CommError),

    /// No session is open
    #[error("Not connected")]
    NotConnected,

    /// The ECU does not report the PID, or the PID has no decoder
    #[error("PID {pid:02X} is not available on ECU {ecu}")]
    UnsupportedPid { pid: u8, ecu: EcuAddress },

    #[error("Unknown ECU {0}")]
    UnknownEcu(EcuAddress),

    /// The poller exited (link lost) before handling the request
    #[error("Live-data poller has stopped")]
    PollerStopped,
}
