//! Live-Data Poller Implementation
//!
//! The poller task owns the [`ObdClient`] for the whole session. The
//! controller never touches the client or the subscriptions directly: it
//! queues [`PollerCommand`]s, which are applied between poll cycles, so every
//! cycle sees one consistent subscription snapshot and only one request is
//! ever on the serial link.

use crate::error::SessionError;
use crate::subscription::Subscriptions;
use obd_protocol::{
    CommError, EcuAddress, EcuDtcs, EventSender, ObdClient, ObdEvent, SelfTestStatus, StatusField,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for the live-data poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Wait when there is nothing to poll, in milliseconds (default: 50)
    pub idle_wait_ms: u64,
    /// Consecutive request timeouts before the adapter itself is checked;
    /// the link counts as dropped only if the adapter is silent too (default: 5)
    pub link_loss_timeouts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: 50,
            link_loss_timeouts: 5,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, CommError>>;

/// Intent queued by the controller, applied at the next cycle boundary
#[derive(Debug)]
pub enum PollerCommand {
    Enable { ecu: EcuAddress, pid: u8 },
    Disable { ecu: EcuAddress, pid: u8 },
    DisableAll { ecu: EcuAddress },
    Select(Option<EcuAddress>),
    ReadDtcs(Reply<Vec<EcuDtcs>>),
    ClearDtcs(Reply<()>),
    SelfTest { ecu: EcuAddress, reply: Reply<SelfTestStatus> },
}

enum Wake {
    Command(Option<PollerCommand>),
    Timer,
}

/// Background polling loop over one connected client
pub struct LivePoller {
    client: ObdClient,
    config: PollerConfig,
    subscriptions: Subscriptions,
    commands: mpsc::UnboundedReceiver<PollerCommand>,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    events: EventSender,
    consecutive_timeouts: u32,
    link_lost: bool,
}

impl LivePoller {
    /// Start polling on a connected client
    pub fn spawn(client: ObdClient, config: PollerConfig) -> PollerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let poller = Self {
            events: client.events().clone(),
            client,
            config,
            subscriptions: Subscriptions::new(),
            commands: rx,
            stop: stop.clone(),
            wake: wake.clone(),
            consecutive_timeouts: 0,
            link_lost: false,
        };

        PollerHandle {
            commands: tx,
            stop,
            wake,
            task: tokio::spawn(poller.run()),
        }
    }

    async fn run(mut self) -> ObdClient {
        info!(
            "Starting live-data poller ({} ECU(s))",
            self.client.registry().len()
        );

        while !self.should_stop() {
            self.drain_commands().await;
            if self.should_stop() {
                break;
            }

            match self.subscriptions.snapshot() {
                Some((ecu, pids)) => {
                    self.poll_cycle(ecu, &pids).await;
                    tokio::task::yield_now().await;
                }
                None => self.idle().await,
            }
        }

        if self.link_lost {
            warn!("Link to adapter lost, stopping poller");
            self.events.status(StatusField::Error, "Link to adapter lost");
            self.client.disconnect().await;
        }
        info!("Live-data poller stopped");
        self.client
    }

    fn should_stop(&self) -> bool {
        self.link_lost || self.stop.load(Ordering::SeqCst)
    }

    /// Apply everything queued since the last boundary
    async fn drain_commands(&mut self) {
        while !self.link_lost {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command).await,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Poller handle dropped");
                    self.stop.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    /// One pass over the active ECU's PIDs, in ascending order
    async fn poll_cycle(&mut self, ecu: EcuAddress, pids: &[u8]) {
        for &pid in pids {
            if self.should_stop() {
                break;
            }

            let result = self.client.sensor_value(pid, ecu).await;
            self.track(&result).await;
            match result {
                Ok(reading) => self.events.emit(ObdEvent::Result { ecu, reading }),
                Err(e) => {
                    warn!("PID {:02X} on ECU {} failed: {}", pid, ecu, e);
                    self.events
                        .status(StatusField::Error, format!("PID {:02X} on ECU {}: {}", pid, ecu, e));
                }
            }
        }
    }

    /// Nothing to poll: wait for a command, a stop request or the idle timer
    async fn idle(&mut self) {
        let wait = Duration::from_millis(self.config.idle_wait_ms);
        let woken = tokio::select! {
            command = self.commands.recv() => Wake::Command(command),
            _ = self.wake.notified() => Wake::Timer,
            _ = tokio::time::sleep(wait) => Wake::Timer,
        };

        match woken {
            Wake::Command(Some(command)) => self.apply(command).await,
            Wake::Command(None) => {
                debug!("Poller handle dropped");
                self.stop.store(true, Ordering::SeqCst);
            }
            Wake::Timer => {}
        }
    }

    async fn apply(&mut self, command: PollerCommand) {
        match command {
            PollerCommand::Enable { ecu, pid } => {
                if self.subscriptions.enable(ecu, pid) {
                    debug!("Enabled PID {:02X} on ECU {}", pid, ecu);
                }
            }
            PollerCommand::Disable { ecu, pid } => {
                if self.subscriptions.disable(ecu, pid) {
                    debug!("Disabled PID {:02X} on ECU {}", pid, ecu);
                }
            }
            PollerCommand::DisableAll { ecu } => {
                debug!("Disabled all PIDs on ECU {}", ecu);
                self.subscriptions.disable_all(ecu);
            }
            PollerCommand::Select(ecu) => {
                match ecu {
                    Some(ecu) => info!("Polling ECU {}", ecu),
                    None => info!("Polling paused, no ECU selected"),
                }
                self.subscriptions.select(ecu);
            }
            PollerCommand::ReadDtcs(reply) => {
                let result = self.client.dtcs().await;
                self.track(&result).await;
                let _ = reply.send(result);
            }
            PollerCommand::ClearDtcs(reply) => {
                let result = self.client.clear_dtcs().await;
                self.track(&result).await;
                let _ = reply.send(result);
            }
            PollerCommand::SelfTest { ecu, reply } => {
                let result = self.client.self_test_status(ecu).await;
                self.track(&result).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Watch request outcomes for a dropped link
    async fn track<T>(&mut self, result: &Result<T, CommError>) {
        match result {
            Err(CommError::Timeout(_)) => {
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= self.config.link_loss_timeouts.max(1) {
                    self.check_link().await;
                }
            }
            Err(e) if e.is_link_failure() => {
                warn!("Serial link failure: {}", e);
                self.link_lost = true;
            }
            _ => self.consecutive_timeouts = 0,
        }
    }

    /// Repeated timeouts: ask the adapter whether it is still there
    async fn check_link(&mut self) {
        let timeouts = std::mem::take(&mut self.consecutive_timeouts);
        match self.client.check_adapter().await {
            Ok(()) => {
                info!("Adapter still answering after {} timeouts", timeouts);
                self.events.status(
                    StatusField::Error,
                    format!("{} consecutive timeouts, adapter still answering", timeouts),
                );
            }
            Err(e) => {
                warn!(
                    "Adapter silent after {} timeouts, treating link as dropped: {}",
                    timeouts, e
                );
                self.link_lost = true;
            }
        }
    }
}

/// Controller side of a running poller
pub struct PollerHandle {
    commands: mpsc::UnboundedSender<PollerCommand>,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<ObdClient>,
}

impl PollerHandle {
    /// Queue a command for the next cycle boundary
    pub fn send(&self, command: PollerCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::PollerStopped)
    }

    pub fn enable(&self, ecu: EcuAddress, pid: u8) -> Result<(), SessionError> {
        self.send(PollerCommand::Enable { ecu, pid })
    }

    pub fn disable(&self, ecu: EcuAddress, pid: u8) -> Result<(), SessionError> {
        self.send(PollerCommand::Disable { ecu, pid })
    }

    pub fn disable_all(&self, ecu: EcuAddress) -> Result<(), SessionError> {
        self.send(PollerCommand::DisableAll { ecu })
    }

    pub fn select(&self, ecu: Option<EcuAddress>) -> Result<(), SessionError> {
        self.send(PollerCommand::Select(ecu))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> PollerCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        Ok(rx.await.map_err(|_| SessionError::PollerStopped)??)
    }

    /// Stored and pending codes of every ECU
    pub async fn read_dtcs(&self) -> Result<Vec<EcuDtcs>, SessionError> {
        self.request(PollerCommand::ReadDtcs).await
    }

    pub async fn clear_dtcs(&self) -> Result<(), SessionError> {
        self.request(PollerCommand::ClearDtcs).await
    }

    pub async fn self_test(&self, ecu: EcuAddress) -> Result<SelfTestStatus, SessionError> {
        self.request(|reply| PollerCommand::SelfTest { ecu, reply })
            .await
    }

    /// Whether the poller task is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop after the in-flight request and hand the client back
    pub async fn shutdown(self) -> Result<ObdClient, SessionError> {
        info!("Stopping live-data poller");
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.task.await.map_err(|e| {
            error!("Poller task failed: {}", e);
            SessionError::PollerStopped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PollerConfig::default();
        assert_eq!(config.idle_wait_ms, 50);
        assert_eq!(config.link_loss_timeouts, 5);
    }

    #[test]
    fn test_partial_config_deserializes() {
        let config: PollerConfig = serde_json::from_str(r#"{"idle_wait_ms": 10}"#).unwrap();
        assert_eq!(config.idle_wait_ms, 10);
        assert_eq!(config.link_loss_timeouts, 5);
    }
}
