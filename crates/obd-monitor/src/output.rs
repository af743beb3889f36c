//! Plain-text rendering of events

use obd_protocol::{pid, ClearStatus, DtcRows, ObdEvent};

/// One or more display lines for an event
pub fn render(event: &ObdEvent) -> String {
    match event {
        ObdEvent::Status { field, value } => format!("{:?}: {}", field, value),
        ObdEvent::Result { ecu, reading } => {
            let name = pid::sensor(reading.pid).map(|s| s.name).unwrap_or("Unknown");
            format!("[{}] {:02X} {:<34} {}", ecu, reading.pid, name, reading)
        }
        ObdEvent::Test { ecu, test, outcome } => {
            format!("[{}] {:<36} {}", ecu, test.description(), outcome)
        }
        ObdEvent::Dtc {
            ecu,
            ecu_number,
            rows,
        } => match rows {
            DtcRows::NoCodes => format!("ECU {} ({}): no trouble codes", ecu_number, ecu),
            DtcRows::Codes(entries) => entries
                .iter()
                .map(|e| {
                    format!(
                        "ECU {} ({}): {:<8} {} {}",
                        ecu_number, ecu, e.status.to_string(), e.code, e.description
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
        },
        ObdEvent::DtcClear { status } => match status {
            ClearStatus::Cleared => "Trouble codes cleared".to_string(),
            ClearStatus::Failed(reason) => format!("Clearing trouble codes failed: {}", reason),
        },
    }
}
