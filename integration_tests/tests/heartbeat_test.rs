use std::time::Duration;

use canmotion_common::messages::Heartbeat;
use integration_tests::prelude::*;
use serial_test::serial;
use tokio::time::{advance, sleep};

const NODE: u8 = 4;
const TIMEOUT: Duration = Duration::from_millis(1500);

fn config() -> MasterConfig {
    MasterConfig::new(node_id(127))
        .with_node(NodeConfig::new(node_id(NODE)).with_heartbeat_timeout(TIMEOUT))
}

fn heartbeat(state: NmtState) -> canmotion_common::CanMessage {
    Heartbeat {
        node: NODE,
        toggle: false,
        state,
    }
    .into()
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_liveness_boundary() {
    let bus = SimBus::new();
    let master = Master::new(config(), bus.new_sender()).unwrap();
    let dispatcher = master.dispatcher();
    let id = node_id(NODE);

    assert_eq!(Liveness::Pending, master.liveness(id));
    assert!(!master.is_alive(id));

    dispatcher.handle_message(heartbeat(NmtState::PreOperational));
    assert!(master.is_alive(id));

    advance(TIMEOUT - Duration::from_millis(1)).await;
    assert!(master.is_alive(id));
    advance(Duration::from_millis(2)).await;
    assert!(!master.is_alive(id));
    assert_eq!(Liveness::Lost, master.liveness(id));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_unmonitored_node() {
    let bus = SimBus::new();
    let config = MasterConfig::new(node_id(127)).with_node(NodeConfig::new(node_id(NODE)));
    let master = Master::new(config, bus.new_sender()).unwrap();

    master
        .dispatcher()
        .handle_message(heartbeat(NmtState::Operational));
    assert_eq!(Liveness::Unmonitored, master.liveness(node_id(NODE)));
    assert!(!master.is_alive(node_id(NODE)));
    assert!(master.last_heartbeat(node_id(NODE)).is_some());

    master.set_consumer(node_id(NODE), TIMEOUT).unwrap();
    assert!(master.is_alive(node_id(NODE)));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_producer_keeps_node_alive_until_it_stops() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let node = net.master.node(node_id(NODE)).unwrap();
    let mut events = net.master.subscribe();

    node.set_heartbeat_producer_time(900).await.unwrap();
    sleep(Duration::from_millis(950)).await;
    for _ in 0..5 {
        assert!(node.is_alive());
        sleep(Duration::from_millis(900)).await;
    }
    assert!(node.is_alive());

    // The last heartbeat was 50ms ago
    net.drive(NODE).set_silent(true);
    sleep(Duration::from_millis(1400)).await;
    assert!(node.is_alive());
    assert!(net.master.check_liveness().is_empty());
    sleep(Duration::from_millis(100)).await;
    assert!(!node.is_alive());

    assert_eq!(vec![node_id(NODE)], net.master.check_liveness());
    // Reported once
    assert!(net.master.check_liveness().is_empty());
    assert_eq!(
        MasterEvent::LivenessLost { node: NODE },
        events.recv().await.unwrap()
    );

    net.drive(NODE).set_silent(false);
    net.drive(NODE).send_heartbeat();
    assert_eq!(
        MasterEvent::LivenessRestored { node: NODE },
        events.recv().await.unwrap()
    );
    assert!(node.is_alive());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_startup_heartbeat_outpaces_consumer_timeout() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let node = net.master.node(node_id(NODE)).unwrap();

    // Producer period well below the 1.5s consumer timeout, set before any confirmed transition
    node.set_heartbeat_producer_time(500).await.unwrap();
    net.master.enter_preop(NmtTarget::All).await.unwrap();
    assert_eq!(Some(NmtState::PreOperational), node.nmt_state());

    sleep(Duration::from_secs(1)).await;
    net.master.start(NmtTarget::All).await.unwrap();
    for _ in 0..6 {
        sleep(Duration::from_millis(500)).await;
        assert!(node.is_alive());
    }
    assert!(net.master.check_liveness().is_empty());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_master_heartbeat_producer() {
    let _ = env_logger::try_init();
    let config = config().with_heartbeat_period(Duration::from_millis(200));
    let net = TestNetwork::new(config);
    let mut listener = net.bus.new_receiver();

    net.master.set_own_state(NmtState::Operational);
    let producer = net.master.spawn_heartbeat_producer();
    sleep(Duration::from_millis(450)).await;
    producer.abort();

    let expected: canmotion_common::CanMessage = Heartbeat {
        node: 127,
        toggle: false,
        state: NmtState::Operational,
    }
    .into();
    let frames = listener.drain();
    // Ticks at 0, 200 and 400ms
    assert_eq!(vec![expected; 3], frames);
}

#[tokio::test]
#[serial]
async fn test_remote_consumer_configuration() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let node = net.master.node(node_id(NODE)).unwrap();

    node.set_remote_heartbeat_consumer(node_id(127), 1000)
        .await
        .unwrap();
    assert_eq!(
        Some(ObjectValue::from((127u32 << 16) | 1000)),
        net.drive(NODE).get(0x1016, 1)
    );
}
