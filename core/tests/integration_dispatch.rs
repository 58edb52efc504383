// Integration tests for the request dispatcher
//
// Drives the four external commands end to end against the loopback radio
// and checks the structured records that come back.

use bluelink_core::{
    ConnectBehavior, DeviceAddress, DeviceClass, Dispatcher, LinkConfig, LinkStatus,
    ListenerKind, LoopbackRadio, Peer, Request, Response, ScanState, StopOutcome,
};
use std::sync::Arc;
use std::time::Duration;

const TARGET: &str = "00:11:22:33:44:55";

fn addr(s: &str) -> DeviceAddress {
    DeviceAddress::parse(s).expect("valid address")
}

fn setup() -> (Dispatcher, Arc<LoopbackRadio>) {
    let radio = Arc::new(LoopbackRadio::new());
    let dispatcher = Dispatcher::new(radio.clone(), LinkConfig::default());
    (dispatcher, radio)
}

fn attack(address: &str) -> Request {
    Request::Attack {
        address: address.to_string(),
        psm: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_scan_toggle_cycle() {
    let (dispatcher, radio) = setup();

    let first = dispatcher.handle(Request::Scan).await;
    assert_eq!(
        first,
        Response::message("Scanning for 30 seconds... Run the command again to see results.")
    );
    assert!(radio.is_discovering());

    radio.discover(Peer::new(addr(TARGET), DeviceClass::Classic).with_name("Speaker"));
    radio.discover(Peer::unknown(addr("00:11:22:33:44:66")));

    let second = dispatcher.handle(Request::Scan).await;
    match second {
        Response::Peers(peers) => {
            assert_eq!(peers.len(), 2);
            assert_eq!(peers[0].address, TARGET);
            assert_eq!(peers[0].name, "Speaker");
            assert_eq!(peers[1].name, "null");
        }
        other => panic!("expected peer list, got {:?}", other),
    }
    assert_eq!(dispatcher.registry().scan_state(), ScanState::Idle);
    assert_eq!(radio.listener_count(ListenerKind::DeviceFound), 0);

    let third = dispatcher.handle(Request::Scan).await;
    assert!(matches!(third, Response::Message { .. }));

    println!("✓ scan toggles start / harvest / start");
}

#[tokio::test(start_paused = true)]
async fn test_scan_harvest_after_timeout() {
    let (dispatcher, radio) = setup();

    dispatcher.handle(Request::Scan).await;
    radio.discover(Peer::unknown(addr(TARGET)));
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(!radio.is_discovering());

    match dispatcher.handle(Request::Scan).await {
        Response::Peers(peers) => assert_eq!(peers.len(), 1),
        other => panic!("expected peer list, got {:?}", other),
    }

    println!("✓ results survive the scan window");
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_discovery_yields_one_entry() {
    let (dispatcher, radio) = setup();
    dispatcher.handle(Request::Scan).await;

    radio.discover(Peer::unknown(addr(TARGET)));
    radio.discover(Peer::new(addr(TARGET), DeviceClass::Classic).with_name("Keyboard"));

    match dispatcher.handle(Request::Scan).await {
        Response::Peers(peers) => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].name, "Keyboard");
        }
        other => panic!("expected peer list, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalid_addresses_create_nothing() {
    let (dispatcher, radio) = setup();
    let expected = Response::error("Invalid MAC address provided.");

    let connect = dispatcher
        .handle(Request::Connect {
            address: "not-a-mac".to_string(),
        })
        .await;
    assert_eq!(connect, expected);
    assert!(dispatcher.link().current().is_none());

    assert_eq!(dispatcher.handle(attack("not-a-mac")).await, expected);
    assert!(dispatcher.flood().current().is_none());
    assert_eq!(radio.channels_opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_acknowledges_immediately() {
    let (dispatcher, radio) = setup();
    radio.add_device(Peer::new(addr(TARGET), DeviceClass::Classic));
    radio.set_serial_behavior(ConnectBehavior::Hang);

    let response = dispatcher
        .handle(Request::Connect {
            address: TARGET.to_string(),
        })
        .await;
    assert_eq!(response, Response::message(format!("Connecting to {}", TARGET)));
    assert_eq!(
        dispatcher.link().current().expect("attempt").status,
        LinkStatus::Connecting
    );

    dispatcher.shutdown().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(radio.open_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_two_connects_leave_one_attempt() {
    let (dispatcher, radio) = setup();
    radio.add_device(Peer::new(addr(TARGET), DeviceClass::Classic));
    radio.set_serial_behavior(ConnectBehavior::Hang);

    for _ in 0..2 {
        let response = dispatcher
            .handle(Request::Connect {
                address: TARGET.to_string(),
            })
            .await;
        assert!(!response.is_error());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(radio.channels_opened(), 2);
    assert_eq!(radio.open_channels(), 1);
    assert_eq!(
        dispatcher.link().current().expect("attempt").status,
        LinkStatus::Connecting
    );

    println!("✓ second connect released the first channel");
}

#[tokio::test(start_paused = true)]
async fn test_two_attacks_then_stop_twice() {
    let (dispatcher, radio) = setup();
    radio.set_l2cap_behavior(ConnectBehavior::Hang);

    assert!(!dispatcher.handle(attack(TARGET)).await.is_error());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(!dispatcher.handle(attack(TARGET)).await.is_error());
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(radio.open_channels(), 1);

    assert_eq!(
        dispatcher.handle(Request::AttackStop).await,
        Response::Status {
            status: StopOutcome::Stopped
        }
    );
    assert_eq!(
        dispatcher.handle(Request::AttackStop).await,
        Response::Status {
            status: StopOutcome::NotRunning
        }
    );

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(radio.open_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_flood_survives_repeated_failures() {
    let (dispatcher, radio) = setup();
    radio.set_l2cap_behavior(ConnectBehavior::Refuse);

    dispatcher.handle(attack(TARGET)).await;
    tokio::time::sleep(Duration::from_millis(260)).await;

    let job = dispatcher.flood().current().expect("job");
    assert!(job.running);
    assert!(job.stats.failed >= 5);

    assert_eq!(
        dispatcher.handle(Request::AttackStop).await,
        Response::Status {
            status: StopOutcome::Stopped
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_json_lines_round() {
    let (dispatcher, _radio) = setup();

    let out = dispatcher
        .handle_json(r#"{"command":"attack","address":"00:11:22:33:44:55","psm":25}"#)
        .await;
    assert_eq!(
        out,
        r#"{"message":"Connection spam started against 00:11:22:33:44:55 with PSM 25"}"#
    );

    let out = dispatcher.handle_json(r#"{"command":"attackStop"}"#).await;
    assert_eq!(out, r#"{"status":"stopped"}"#);

    let out = dispatcher
        .handle_json(r#"{"command":"connect","address":"00:11:22:33:44:zz"}"#)
        .await;
    assert_eq!(out, r#"{"error":"Invalid MAC address provided."}"#);
}
