//! Events delivered to the consumer
//!
//! Driver and poller push events into an unbounded channel so emission
//! never blocks the serial request loop; the consumer drains them in order.

use crate::dtc::DtcEntry;
use crate::ecu::EcuAddress;
use crate::pid::SensorReading;
use crate::selftest::{MonitorTest, TestOutcome};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Status line a [`ObdEvent::Status`] updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatusField {
    /// Link state: Connecting, Connected, Disconnected, ...
    Link,
    /// Negotiated OBD protocol name
    Protocol,
    /// Adapter version string
    Adapter,
    /// Serial port in use
    Port,
    /// VINs reported by the ECUs
    Vin,
    /// Number of stored DTCs reported by PID 01
    DtcCount,
    /// Malfunction indicator lamp state
    Mil,
    /// Last recoverable error
    Error,
}

/// Outcome of a clear-codes request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClearStatus {
    Cleared,
    Failed(String),
}

/// Trouble codes of one ECU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DtcRows {
    /// The ECU has no stored or pending codes
    NoCodes,
    Codes(Vec<DtcEntry>),
}

/// Event emitted by the driver, poller or session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ObdEvent {
    Status {
        field: StatusField,
        value: String,
    },
    Result {
        ecu: EcuAddress,
        reading: SensorReading,
    },
    Test {
        ecu: EcuAddress,
        test: MonitorTest,
        outcome: TestOutcome,
    },
    Dtc {
        ecu: EcuAddress,
        ecu_number: usize,
        rows: DtcRows,
    },
    DtcClear {
        status: ClearStatus,
    },
}

impl ObdEvent {
    /// Shorthand for a status event
    pub fn status(field: StatusField, value: impl Into<String>) -> Self {
        ObdEvent::Status {
            field,
            value: value.into(),
        }
    }
}

/// Receiving half of the event channel
pub type EventReceiver = mpsc::UnboundedReceiver<ObdEvent>;

/// Sending half of the event channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ObdEvent>,
}

impl EventSender {
    /// Queue an event; a dropped consumer is not an error
    pub fn emit(&self, event: ObdEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped, discarding event");
        }
    }

    /// Queue a status event
    pub fn status(&self, field: StatusField, value: impl Into<String>) {
        self.emit(ObdEvent::status(field, value));
    }
}

/// Create an event channel
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_in_order() {
        let (tx, mut rx) = event_channel();
        tx.status(StatusField::Link, "Connecting");
        tx.status(StatusField::Link, "Connected");
        assert_eq!(rx.try_recv().unwrap(), ObdEvent::status(StatusField::Link, "Connecting"));
        assert_eq!(rx.try_recv().unwrap(), ObdEvent::status(StatusField::Link, "Connected"));
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (tx, rx) = event_channel();
        drop(rx);
        tx.status(StatusField::Error, "ignored");
    }
}
