use std::time::Duration;

use canmotion_master::error::LocalError;
use integration_tests::{prelude::*, sim_drive::TARGET_POSITION};
use serial_test::serial;

fn config(nodes: &[u8]) -> MasterConfig {
    nodes.iter().fold(
        MasterConfig::new(node_id(127)).with_nmt_timeout(Duration::from_millis(300)),
        |config, id| config.with_node(NodeConfig::new(node_id(*id))),
    )
}

#[tokio::test]
#[serial]
async fn test_confirmed_transitions() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config(&[1]));
    let _logger = BusLogger::new(net.bus.new_receiver());
    let target = NmtTarget::Node(node_id(1));

    net.master.start(target).await.unwrap();
    assert_eq!(NmtState::Operational, net.drive(1).nmt_state());
    assert_eq!(Some(NmtState::Operational), net.master.nmt_state(node_id(1)));

    net.master.enter_preop(target).await.unwrap();
    assert_eq!(NmtState::PreOperational, net.drive(1).nmt_state());

    net.master.stop(target).await.unwrap();
    assert_eq!(Some(NmtState::Stopped), net.master.nmt_state(node_id(1)));

    net.master
        .transition(target, NmtState::PreOperational)
        .await
        .unwrap();
    assert_eq!(NmtState::PreOperational, net.drive(1).nmt_state());
}

#[tokio::test]
#[serial]
async fn test_broadcast_waits_for_every_node() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config(&[1, 2, 3]));

    net.master.start(NmtTarget::All).await.unwrap();
    for id in [1, 2, 3] {
        assert_eq!(NmtState::Operational, net.drive(id).nmt_state());
        assert_eq!(Some(NmtState::Operational), net.master.nmt_state(node_id(id)));
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_silent_node_times_out() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config(&[1, 2]));
    net.drive(2).set_silent(true);

    let err = net.master.start(NmtTarget::All).await.unwrap_err();
    assert_eq!(
        Some(&LocalError::NmtConfirmationTimeout {
            node: 2,
            state: NmtState::Operational
        }),
        err.as_local()
    );
    // The node which answered still made the transition
    assert_eq!(NmtState::Operational, net.drive(1).nmt_state());
    assert_eq!(NmtState::PreOperational, net.drive(2).nmt_state());
}

#[tokio::test]
#[serial]
async fn test_unknown_node_is_rejected() {
    let net = TestNetwork::new(config(&[1]));
    let err = net
        .master
        .start(NmtTarget::Node(node_id(42)))
        .await
        .unwrap_err();
    assert_eq!(Some(&LocalError::UnknownNode { node: 42 }), err.as_local());
}

#[tokio::test]
#[serial]
async fn test_reset_invalidates_node_state() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config(&[1]));
    let node = net.master.node(node_id(1)).unwrap();
    let mut events = net.master.subscribe();

    node.write_i32(TARGET_POSITION, 0, 77).await.unwrap();
    assert!(node.cached(TARGET_POSITION, 0).unwrap().valid);

    net.master.reset_node(NmtTarget::Node(node_id(1))).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(MasterEvent::BootUp { node: 1 }, event);
    assert!(!node.cached(TARGET_POSITION, 0).unwrap().valid);
    // The drive restored its defaults, and a read goes to the drive again
    assert_eq!(0, node.read_i32(TARGET_POSITION, 0).await.unwrap());
    assert_eq!(NmtState::PreOperational, net.drive(1).nmt_state());
}
