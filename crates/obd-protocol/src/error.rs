//! OBD-II Error Types

use thiserror::Error;

/// Errors that abort `ObdClient::connect`
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Serial device could not be opened within the attempt budget
    #[error("Serial port {port} unavailable after {attempts} attempt(s): {reason}")]
    PortUnavailable {
        port: String,
        attempts: u32,
        reason: String,
    },

    /// Adapter did not answer initialization as expected
    #[error("Adapter protocol error: {0}")]
    ProtocolError(String),
}

/// Errors from a single request/response exchange
#[derive(Debug, Error)]
pub enum CommError {
    /// No prompt from the adapter within the response timeout
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// The ECU has no data for the request
    #[error("No data")]
    NoData,

    /// Request issued while the link is not connected
    #[error("OBD adapter not connected")]
    NotConnected,

    /// Reply could not be parsed
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Reply answers a different request; the link resyncs before the next one
    #[error("Reply out of step with request: {0}")]
    OutOfStep(String),

    /// Adapter reported an error (`?`, `CAN ERROR`, `UNABLE TO CONNECT`, ...)
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Serial stream closed or failed underneath us
    #[error("Serial link lost: {0}")]
    LinkLost(String),

    /// PID has no entry in the sensor table
    #[error("PID {0:02X} has no decoder")]
    UnknownPid(u8),

    /// Reply bytes did not decode
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl CommError {
    /// Whether this error means the serial link is gone
    pub fn is_link_failure(&self) -> bool {
        matches!(self, CommError::LinkLost(_) | CommError::NotConnected)
    }
}

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        CommError::LinkLost(err.to_string())
    }
}

/// Errors while decoding raw PID bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Wrong number of data bytes for the PID
    #[error("PID {pid:02X} expects {expected} data byte(s), got {actual}")]
    BadLength {
        pid: u8,
        expected: usize,
        actual: usize,
    },

    /// PID is not in the sensor table
    #[error("PID {0:02X} not supported by decoder")]
    Unsupported(u8),
}
