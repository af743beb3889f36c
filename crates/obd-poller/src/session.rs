//! Controller facade over one connection session

use crate::error::SessionError;
use crate::poller::{LivePoller, PollerConfig, PollerHandle};
use obd_protocol::{
    ClearStatus, CommError, ConnectionSettings, DtcRows, EcuAddress, EcuDtcs, EcuRegistry,
    EventSender, ObdClient, ObdEvent, PortOpener, SelfTestStatus, StatusField,
};
use tracing::{debug, info, warn};

/// One connection session: the registry snapshot plus the running poller.
///
/// Every operation that needs the serial link is routed through the
/// poller, so the controller can call these from any task.
pub struct Session {
    registry: EcuRegistry,
    events: EventSender,
    poller: Option<PollerHandle>,
}

impl Session {
    /// Connect, refresh the self-test status once and start polling
    pub async fn connect(
        opener: &dyn PortOpener,
        settings: &ConnectionSettings,
        config: PollerConfig,
        events: EventSender,
    ) -> Result<Self, SessionError> {
        let mut client = ObdClient::connect(opener, settings, events.clone()).await?;

        let addresses: Vec<EcuAddress> = client.registry().addresses().collect();
        for ecu in addresses {
            match client.self_test_status(ecu).await {
                Ok(status) => emit_self_test(&events, ecu, &status),
                Err(CommError::NoData) => debug!("ECU {} has no monitor status", ecu),
                Err(e) => warn!("Self-test read from ECU {} failed: {}", ecu, e),
            }
        }

        let registry = client.registry().clone();
        info!("Session open with {} ECU(s)", registry.len());
        Ok(Self {
            registry,
            events,
            poller: Some(LivePoller::spawn(client, config)),
        })
    }

    /// ECUs discovered at connect
    pub fn registry(&self) -> &EcuRegistry {
        &self.registry
    }

    /// Whether the poller is still running (false after a link drop)
    pub fn is_connected(&self) -> bool {
        self.poller.as_ref().is_some_and(PollerHandle::is_running)
    }

    fn poller(&self) -> Result<&PollerHandle, SessionError> {
        self.poller.as_ref().ok_or(SessionError::NotConnected)
    }

    fn known(&self, ecu: EcuAddress) -> Result<(), SessionError> {
        if self.registry.contains(ecu) {
            Ok(())
        } else {
            Err(SessionError::UnknownEcu(ecu))
        }
    }

    /// Start polling a PID on an ECU.
    ///
    /// The ECU must report the PID as supported and the PID must have a decoder.
    pub fn enable_sensor(&self, pid: u8, ecu: EcuAddress) -> Result<(), SessionError> {
        let poller = self.poller()?;
        let supported = self
            .registry
            .supported_pids(ecu)
            .ok_or(SessionError::UnknownEcu(ecu))?;
        if !supported.is_live_data(pid) {
            return Err(SessionError::UnsupportedPid { pid, ecu });
        }
        poller.enable(ecu, pid)
    }

    pub fn disable_sensor(&self, pid: u8, ecu: EcuAddress) -> Result<(), SessionError> {
        let poller = self.poller()?;
        self.known(ecu)?;
        poller.disable(ecu, pid)
    }

    pub fn disable_all_sensors(&self, ecu: EcuAddress) -> Result<(), SessionError> {
        let poller = self.poller()?;
        self.known(ecu)?;
        poller.disable_all(ecu)
    }

    /// Choose the ECU whose subscriptions are polled; `None` pauses polling
    pub fn select_active_ecu(&self, ecu: Option<EcuAddress>) -> Result<(), SessionError> {
        let poller = self.poller()?;
        if let Some(ecu) = ecu {
            self.known(ecu)?;
        }
        poller.select(ecu)
    }

    /// Read trouble codes; emits one `Dtc` event per ECU, `NoCodes` when empty
    pub async fn get_dtcs(&self) -> Result<Vec<EcuDtcs>, SessionError> {
        let codes = self.poller()?.read_dtcs().await?;
        for ecu in &codes {
            let rows = if ecu.entries.is_empty() {
                DtcRows::NoCodes
            } else {
                DtcRows::Codes(ecu.entries.clone())
            };
            self.events.emit(ObdEvent::Dtc {
                ecu: ecu.ecu,
                ecu_number: ecu.number,
                rows,
            });
        }
        Ok(codes)
    }

    /// Clear trouble codes; the outcome is also emitted as a `DtcClear` event
    pub async fn clear_dtcs(&self) -> Result<(), SessionError> {
        let result = self.poller()?.clear_dtcs().await;
        let status = match &result {
            Ok(()) => ClearStatus::Cleared,
            Err(e) => ClearStatus::Failed(e.to_string()),
        };
        self.events.emit(ObdEvent::DtcClear { status });
        result
    }

    /// Read the monitor status of one ECU and emit it as `Test` events
    pub async fn get_self_test_status(&self, ecu: EcuAddress) -> Result<SelfTestStatus, SessionError> {
        let poller = self.poller()?;
        self.known(ecu)?;
        let status = poller.self_test(ecu).await?;
        emit_self_test(&self.events, ecu, &status);
        Ok(status)
    }

    /// Stop the poller and close the link. A no-op when already disconnected.
    pub async fn disconnect(&mut self) {
        let Some(poller) = self.poller.take() else {
            debug!("Session already disconnected");
            return;
        };
        match poller.shutdown().await {
            Ok(mut client) => client.disconnect().await,
            Err(e) => {
                warn!("Poller did not stop cleanly: {}", e);
                self.events.status(StatusField::Link, "Disconnected");
                self.events.status(StatusField::Adapter, "----");
            }
        }
        self.registry = EcuRegistry::new();
    }
}

fn emit_self_test(events: &EventSender, ecu: EcuAddress, status: &SelfTestStatus) {
    for (test, outcome) in &status.tests {
        events.emit(ObdEvent::Test {
            ecu,
            test: *test,
            outcome: *outcome,
        });
    }
    events.status(StatusField::DtcCount, status.dtc_count.to_string());
    events.status(StatusField::Mil, if status.mil_on { "On" } else { "Off" });
}
