use obd_poller::{PollerConfig, Session, SessionError};
use obd_protocol::sim::{SimulatedAdapter, SimulatedEcu, SimulatedVehicle};
use obd_protocol::{
    event_channel, ClearStatus, ConnectError, ConnectionSettings, DtcRows, EcuAddress,
    EventReceiver, ObdEvent, StatusField,
};
use std::time::Duration;

const ENGINE: EcuAddress = EcuAddress(0x7E8);
const TRANSMISSION: EcuAddress = EcuAddress(0x7E9);

fn settings() -> ConnectionSettings {
    ConnectionSettings {
        timeout_ms: 100,
        retry_delay_ms: 1,
        ..ConnectionSettings::for_port("sim")
    }
}

fn config() -> PollerConfig {
    PollerConfig {
        idle_wait_ms: 10,
        ..PollerConfig::default()
    }
}

async fn open(vehicle: SimulatedVehicle) -> (Session, SimulatedAdapter, EventReceiver) {
    open_with(vehicle, config()).await
}

async fn open_with(
    vehicle: SimulatedVehicle,
    config: PollerConfig,
) -> (Session, SimulatedAdapter, EventReceiver) {
    let adapter = SimulatedAdapter::new(vehicle);
    let (tx, rx) = event_channel();
    let session = Session::connect(&adapter, &settings(), config, tx)
        .await
        .unwrap();
    (session, adapter, rx)
}

fn quick_link_check() -> PollerConfig {
    PollerConfig {
        link_loss_timeouts: 2,
        ..config()
    }
}

/// Skip events until one matches
async fn wait_for(rx: &mut EventReceiver, matches: impl Fn(&ObdEvent) -> bool) -> ObdEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn drain(rx: &mut EventReceiver) -> Vec<ObdEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn result_pid(event: &ObdEvent) -> Option<(EcuAddress, u8)> {
    match event {
        ObdEvent::Result { ecu, reading } => Some((*ecu, reading.pid)),
        _ => None,
    }
}

#[tokio::test]
async fn test_only_subscribed_pid_is_polled() {
    let vehicle = SimulatedVehicle::new(vec![SimulatedEcu::new(0x7E8)
        .with_pid(0x0C, &[0x1A, 0xF8])
        .with_pid(0x0D, &[0x3C])]);
    let (mut session, adapter, mut rx) = open(vehicle).await;

    session.enable_sensor(12, ENGINE).unwrap();
    session.select_active_ecu(Some(ENGINE)).unwrap();

    let first = wait_for(&mut rx, |e| result_pid(e).is_some()).await;
    assert_eq!(result_pid(&first), Some((ENGINE, 0x0C)));
    if let ObdEvent::Result { reading, .. } = &first {
        assert_eq!(reading.value, 1726.0);
    }

    session.disconnect().await;
    for event in drain(&mut rx) {
        if let Some((_, pid)) = result_pid(&event) {
            assert_eq!(pid, 0x0C);
        }
    }
    assert!(adapter.requests().iter().all(|r| r != "010D"));
}

#[tokio::test]
async fn test_results_come_from_active_ecu_only() {
    let (mut session, _adapter, mut rx) = open(SimulatedVehicle::demo()).await;

    session.enable_sensor(0x0C, ENGINE).unwrap();
    session.enable_sensor(0x0D, TRANSMISSION).unwrap();
    session.select_active_ecu(Some(TRANSMISSION)).unwrap();

    let first = wait_for(&mut rx, |e| result_pid(e).is_some()).await;
    assert_eq!(result_pid(&first), Some((TRANSMISSION, 0x0D)));

    session.disconnect().await;
    for event in drain(&mut rx) {
        if let Some(result) = result_pid(&event) {
            assert_eq!(result, (TRANSMISSION, 0x0D));
        }
    }
}

#[tokio::test]
async fn test_select_none_stops_requests() {
    let (mut session, adapter, mut rx) = open(SimulatedVehicle::demo()).await;

    session.enable_sensor(0x0C, ENGINE).unwrap();
    session.select_active_ecu(Some(ENGINE)).unwrap();
    wait_for(&mut rx, |e| result_pid(e).is_some()).await;

    session.select_active_ecu(None).unwrap();
    // commands apply in order, so once this returns the selection is cleared
    session.get_self_test_status(ENGINE).await.unwrap();
    adapter.clear_requests();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(adapter.requests().is_empty());

    session.select_active_ecu(Some(ENGINE)).unwrap();
    wait_for(&mut rx, |e| result_pid(e).is_some()).await;
    assert!(!adapter.requests().is_empty());
    session.disconnect().await;
}

#[tokio::test]
async fn test_timeout_does_not_stop_the_cycle() {
    let mut vehicle = SimulatedVehicle::demo();
    vehicle.stalled_pids.insert(0x05);
    let (mut session, adapter, mut rx) = open(vehicle).await;

    for pid in [0x05, 0x06, 0x07] {
        session.enable_sensor(pid, ENGINE).unwrap();
    }
    session.select_active_ecu(Some(ENGINE)).unwrap();

    wait_for(&mut rx, |e| {
        matches!(e, ObdEvent::Status { field: StatusField::Error, value } if value.contains("PID 05"))
    })
    .await;
    wait_for(&mut rx, |e| result_pid(e) == Some((ENGINE, 0x06))).await;
    wait_for(&mut rx, |e| result_pid(e) == Some((ENGINE, 0x07))).await;
    assert!(session.is_connected());

    let requests = adapter.requests();
    let first = requests.iter().position(|r| r == "0105").unwrap();
    assert_eq!(requests[first + 1], "0106");
    assert_eq!(requests[first + 2], "0107");
    session.disconnect().await;
}

#[tokio::test]
async fn test_stalled_pid_alone_keeps_the_link() {
    let mut vehicle = SimulatedVehicle::demo();
    vehicle.stalled_pids.insert(0x05);
    let (mut session, _adapter, mut rx) = open_with(vehicle, quick_link_check()).await;

    session.enable_sensor(0x05, ENGINE).unwrap();
    session.select_active_ecu(Some(ENGINE)).unwrap();

    for _ in 0..2 {
        wait_for(&mut rx, |e| {
            matches!(e, ObdEvent::Status { field: StatusField::Error, value } if value.contains("adapter still answering"))
        })
        .await;
    }
    assert!(session.is_connected());

    session.enable_sensor(0x06, ENGINE).unwrap();
    wait_for(&mut rx, |e| result_pid(e) == Some((ENGINE, 0x06))).await;
    session.disconnect().await;
    assert!(drain(&mut rx).contains(&ObdEvent::status(StatusField::Link, "Disconnected")));
}

#[tokio::test]
async fn test_late_reply_does_not_shift_the_cycle() {
    let mut vehicle = SimulatedVehicle::demo();
    vehicle.late_pids.insert(0x05, 150);
    let (mut session, _adapter, mut rx) = open(vehicle).await;

    for pid in [0x05, 0x06, 0x07] {
        session.enable_sensor(pid, ENGINE).unwrap();
    }
    session.select_active_ecu(Some(ENGINE)).unwrap();

    let mut seen = Vec::new();
    while seen.len() < 4 {
        if let Some((_, pid)) = result_pid(&wait_for(&mut rx, |e| result_pid(e).is_some()).await) {
            seen.push(pid);
        }
    }
    assert_eq!(seen, vec![0x06, 0x07, 0x06, 0x07]);
    session.disconnect().await;
}

#[tokio::test]
async fn test_disable_all_leaves_other_ecus() {
    let (mut session, adapter, mut rx) = open(SimulatedVehicle::demo()).await;

    session.enable_sensor(0x0C, ENGINE).unwrap();
    session.enable_sensor(0x0D, TRANSMISSION).unwrap();
    session.disable_all_sensors(ENGINE).unwrap();
    session.select_active_ecu(Some(ENGINE)).unwrap();
    session.get_self_test_status(ENGINE).await.unwrap();
    adapter.clear_requests();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(adapter.requests().is_empty());

    session.select_active_ecu(Some(TRANSMISSION)).unwrap();
    let event = wait_for(&mut rx, |e| result_pid(e).is_some()).await;
    assert_eq!(result_pid(&event), Some((TRANSMISSION, 0x0D)));
    session.disconnect().await;
}

#[tokio::test]
async fn test_clear_then_read_reports_no_codes() {
    let (mut session, _adapter, mut rx) = open(SimulatedVehicle::demo()).await;

    let before = session.get_dtcs().await.unwrap();
    assert_eq!(before[0].entries.len(), 3);
    let event = wait_for(&mut rx, |e| matches!(e, ObdEvent::Dtc { .. })).await;
    assert!(matches!(event, ObdEvent::Dtc { ecu: ENGINE, ecu_number: 1, rows: DtcRows::Codes(_) }));

    session.clear_dtcs().await.unwrap();
    let event = wait_for(&mut rx, |e| matches!(e, ObdEvent::DtcClear { .. })).await;
    assert_eq!(event, ObdEvent::DtcClear { status: ClearStatus::Cleared });

    session.get_dtcs().await.unwrap();
    let mut markers = Vec::new();
    for _ in 0..2 {
        match wait_for(&mut rx, |e| matches!(e, ObdEvent::Dtc { .. })).await {
            ObdEvent::Dtc { ecu, rows, .. } => markers.push((ecu, rows)),
            _ => unreachable!(),
        }
    }
    assert_eq!(
        markers,
        vec![(ENGINE, DtcRows::NoCodes), (TRANSMISSION, DtcRows::NoCodes)]
    );
    // clearing codes does not touch subscriptions or the registry
    assert_eq!(session.registry().len(), 2);
    session.enable_sensor(0x0C, ENGINE).unwrap();
    session.disconnect().await;
}

#[tokio::test]
async fn test_connect_reports_self_test_once() {
    let (mut session, _adapter, mut rx) = open(SimulatedVehicle::demo()).await;

    let events = drain(&mut rx);
    let tests = events
        .iter()
        .filter(|e| matches!(e, ObdEvent::Test { ecu: ENGINE, .. }))
        .count();
    assert_eq!(tests, 11);
    assert!(events.contains(&ObdEvent::status(StatusField::DtcCount, "2")));
    assert!(events.contains(&ObdEvent::status(StatusField::Mil, "On")));
    assert!(events.contains(&ObdEvent::status(StatusField::Link, "Connected")));

    // no further self-test events while idle
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!drain(&mut rx).iter().any(|e| matches!(e, ObdEvent::Test { .. })));
    session.disconnect().await;
}

#[tokio::test]
async fn test_enable_validation() {
    let (mut session, _adapter, _rx) = open(SimulatedVehicle::demo()).await;

    assert!(matches!(
        session.enable_sensor(0x5C, ENGINE),
        Err(SessionError::UnsupportedPid { pid: 0x5C, .. })
    ));
    assert!(matches!(
        session.enable_sensor(0x01, ENGINE),
        Err(SessionError::UnsupportedPid { .. })
    ));
    assert!(matches!(
        session.enable_sensor(0x0C, EcuAddress(0x7EA)),
        Err(SessionError::UnknownEcu(_))
    ));
    assert!(matches!(
        session.select_active_ecu(Some(EcuAddress(0x7EA))),
        Err(SessionError::UnknownEcu(_))
    ));
    // disabling something never enabled is fine
    session.disable_sensor(0x0C, ENGINE).unwrap();
    session.disconnect().await;
}

#[tokio::test]
async fn test_unreachable_port() {
    let adapter = SimulatedAdapter::unreachable();
    let (tx, mut rx) = event_channel();
    let settings = ConnectionSettings {
        max_attempts: 2,
        ..settings()
    };

    let err = Session::connect(&adapter, &settings, config(), tx)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SessionError::Connect(ConnectError::PortUnavailable { attempts: 2, .. })
    ));
    assert_eq!(adapter.open_count(), 2);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], ObdEvent::Status { field: StatusField::Error, .. }));
}

#[tokio::test]
async fn test_disconnect_reports_status_and_is_idempotent() {
    let (mut session, _adapter, mut rx) = open(SimulatedVehicle::demo()).await;
    drain(&mut rx);

    session.disconnect().await;
    assert_eq!(
        drain(&mut rx),
        vec![
            ObdEvent::status(StatusField::Link, "Disconnected"),
            ObdEvent::status(StatusField::Adapter, "----"),
        ]
    );

    session.disconnect().await;
    assert!(drain(&mut rx).is_empty());
    assert!(!session.is_connected());
    assert!(matches!(
        session.enable_sensor(0x0C, ENGINE),
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(session.get_dtcs().await, Err(SessionError::NotConnected)));
}

#[tokio::test]
async fn test_link_drop_looks_like_disconnect() {
    let (mut session, adapter, mut rx) = open(SimulatedVehicle::demo()).await;

    session.enable_sensor(0x0C, ENGINE).unwrap();
    session.select_active_ecu(Some(ENGINE)).unwrap();
    wait_for(&mut rx, |e| result_pid(e).is_some()).await;

    adapter.unplug();
    wait_for(&mut rx, |e| *e == ObdEvent::status(StatusField::Link, "Disconnected")).await;
    let next = wait_for(&mut rx, |e| matches!(e, ObdEvent::Status { .. })).await;
    assert_eq!(next, ObdEvent::status(StatusField::Adapter, "----"));

    tokio::time::timeout(Duration::from_secs(1), async {
        while session.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        session.enable_sensor(0x0C, ENGINE),
        Err(SessionError::PollerStopped)
    ));

    // the poller already closed the link; no second report
    session.disconnect().await;
    assert!(!drain(&mut rx).iter().any(|e| matches!(e, ObdEvent::Status { field: StatusField::Link, .. })));
}

#[tokio::test]
async fn test_silent_adapter_is_detected_by_timeout() {
    let (mut session, adapter, mut rx) = open_with(SimulatedVehicle::demo(), quick_link_check()).await;

    session.enable_sensor(0x0C, ENGINE).unwrap();
    session.select_active_ecu(Some(ENGINE)).unwrap();
    wait_for(&mut rx, |e| result_pid(e).is_some()).await;

    adapter.go_silent();
    wait_for(&mut rx, |e| *e == ObdEvent::status(StatusField::Error, "Link to adapter lost")).await;
    let next = wait_for(&mut rx, |e| matches!(e, ObdEvent::Status { field: StatusField::Link | StatusField::Adapter, .. })).await;
    assert_eq!(next, ObdEvent::status(StatusField::Link, "Disconnected"));
    let next = wait_for(&mut rx, |e| matches!(e, ObdEvent::Status { .. })).await;
    assert_eq!(next, ObdEvent::status(StatusField::Adapter, "----"));

    tokio::time::timeout(Duration::from_secs(1), async {
        while session.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        session.get_dtcs().await,
        Err(SessionError::PollerStopped)
    ));
}
