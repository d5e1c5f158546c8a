use std::time::Duration;

use canmotion_master::Dispatched;
use integration_tests::prelude::*;
use serial_test::serial;
use tokio::time::timeout;

const NODE: u8 = 6;

fn config() -> MasterConfig {
    MasterConfig::new(node_id(127)).with_node(NodeConfig::new(node_id(NODE)))
}

#[tokio::test]
#[serial]
async fn test_emergency_is_reported() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let mut events = net.master.subscribe();

    net.drive(NODE).send_emergency(0x2310, 0x03);
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    let MasterEvent::Fault(fault) = event else {
        panic!("Expected a fault, got {event:?}");
    };
    assert_eq!(ErrorClass::Drive, fault.class());
    assert_eq!(Some(0x2310), fault.raw_code());
    assert_eq!(
        MasterError::Drive {
            node: NODE,
            error_code: 0x2310,
            error_register: 0x03,
            vendor: [0; 5],
        },
        fault
    );

    net.drive(NODE).send_emergency(0, 0);
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(MasterEvent::EmergencyCleared { node: NODE }, event);
}

#[tokio::test]
#[serial]
async fn test_frames_from_unknown_nodes_are_dropped() {
    let bus = SimBus::new();
    let master = Master::new(config(), bus.new_sender()).unwrap();
    let mut events = master.subscribe();
    let emcy = canmotion_common::messages::EmergencyMessage {
        node: NODE + 1,
        error_code: 0x5000,
        error_register: 0x01,
        vendor: [0; 5],
    };

    assert_eq!(
        Dispatched::Dropped,
        master.dispatcher().handle_message(emcy.into())
    );
    assert!(events.try_recv().is_err());
}
