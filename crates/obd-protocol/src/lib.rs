//! OBD-II Protocol Implementation
//!
//! This crate provides async serial communication with ELM327-compatible
//! OBD-II adapters. It supports ISO 15765-4 (CAN) and legacy protocols.
//!
//! [`ObdClient`] owns the serial link for one session and exposes the
//! request primitives; the [`pid`] table decodes live values, [`dtc`]
//! decodes trouble codes and [`sim`] provides an in-process adapter for
//! running without hardware.

mod client;
pub mod dtc;
mod ecu;
mod error;
mod event;
mod frame;
mod link;
pub mod pid;
mod protocol;
pub mod selftest;
pub mod sim;

pub use client::{EcuDtcs, LinkState, ObdClient};
pub use dtc::{DtcEntry, DtcStatus};
pub use ecu::{Ecu, EcuAddress, EcuRegistry};
pub use error::{CommError, ConnectError, DecodeError};
pub use event::{event_channel, ClearStatus, DtcRows, EventReceiver, EventSender, ObdEvent, StatusField};
pub use frame::{parse_reply, EcuReply};
pub use link::{available_ports, ConnectionSettings, ElmLink, PortOpener, SerialIo, SerialPortOpener, BAUD_RATES};
pub use pid::{SensorReading, SensorSpec, SupportedPids};
pub use protocol::{HeaderFormat, ObdProtocol};
pub use selftest::{MonitorTest, SelfTestStatus, TestOutcome};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
}
