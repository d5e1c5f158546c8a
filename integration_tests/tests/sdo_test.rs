use std::time::Duration;

use canmotion_master::error::LocalError;
use integration_tests::{
    prelude::*,
    sim_drive::{CONTROLWORD, POSITION_ACTUAL, PROFILE_VELOCITY, STATUSWORD, TARGET_POSITION},
};
use serial_test::serial;

const NODE: u8 = 5;

fn config() -> MasterConfig {
    MasterConfig::new(node_id(127)).with_node(NodeConfig::new(node_id(NODE)))
}

#[tokio::test]
#[serial]
async fn test_write_then_read() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let _logger = BusLogger::new(net.bus.new_receiver());
    let node = net.master.node(node_id(NODE)).unwrap();

    node.write_i32(TARGET_POSITION, 0, -40000).await.unwrap();
    assert_eq!(
        Some(ObjectValue::from(-40000i32)),
        net.drive(NODE).get(TARGET_POSITION, 0)
    );
    assert_eq!(-40000, node.read_fresh_i32(TARGET_POSITION, 0).await.unwrap());

    let entry = node.cached(TARGET_POSITION, 0).unwrap();
    assert!(entry.valid);
    assert_eq!(-40000, entry.value.as_i32());

    node.write_u32(PROFILE_VELOCITY, 0, 2500).await.unwrap();
    assert_eq!(2500, node.read_fresh_u32(PROFILE_VELOCITY, 0).await.unwrap());
}

#[tokio::test]
#[serial]
async fn test_write_then_read_all_widths() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let node = net.master.node(node_id(NODE)).unwrap();
    let drive = net.drive(NODE);
    drive.insert(0x2000, 1, 0u8.into(), true);
    drive.insert(0x2000, 2, 0i8.into(), true);
    drive.insert(0x2000, 3, 0u16.into(), true);
    drive.insert(0x2000, 4, 0i16.into(), true);
    drive.insert(0x2000, 5, 0u32.into(), true);
    drive.insert(0x2000, 6, 0i32.into(), true);

    for value in [0, 1, 0x7F, u8::MAX] {
        node.write_u8(0x2000, 1, value).await.unwrap();
        assert_eq!(value, node.read_fresh_u8(0x2000, 1).await.unwrap());
    }
    for value in [i8::MIN, -1, 0, i8::MAX] {
        node.write_i8(0x2000, 2, value).await.unwrap();
        assert_eq!(value, node.read_fresh_i8(0x2000, 2).await.unwrap());
    }
    for value in [0, 0x00FF, 0x8000, u16::MAX] {
        node.write_u16(0x2000, 3, value).await.unwrap();
        assert_eq!(value, node.read_fresh_u16(0x2000, 3).await.unwrap());
    }
    for value in [i16::MIN, -256, 0, i16::MAX] {
        node.write_i16(0x2000, 4, value).await.unwrap();
        assert_eq!(value, node.read_fresh_i16(0x2000, 4).await.unwrap());
    }
    for value in [0, 0x8000_0000, u32::MAX] {
        node.write_u32(0x2000, 5, value).await.unwrap();
        assert_eq!(value, node.read_fresh_u32(0x2000, 5).await.unwrap());
    }
    for value in [i32::MIN, -1, i32::MAX] {
        node.write_i32(0x2000, 6, value).await.unwrap();
        assert_eq!(value, node.read_fresh_i32(0x2000, 6).await.unwrap());
    }
}

#[tokio::test]
#[serial]
async fn test_abort_is_classified() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let node = net.master.node(node_id(NODE)).unwrap();

    let err = node.read_fresh(0x2000, 0).await.unwrap_err();
    assert_eq!(ErrorClass::Sdo, err.class());
    assert_eq!(
        MasterError::SdoAbort {
            node: NODE,
            index: 0x2000,
            sub: 0,
            abort_code: RawAbortCode::Valid(AbortCode::NoSuchObject),
        },
        err
    );

    let err = node.write_u16(STATUSWORD, 0, 0).await.unwrap_err();
    assert_eq!(Some(AbortCode::ReadOnly as u32), err.raw_code());
    // A rejected write leaves the cache alone
    assert!(node.cached(STATUSWORD, 0).is_none());

    let err = node.write_u32(CONTROLWORD, 0, 6).await.unwrap_err();
    assert_eq!(Some(AbortCode::DataTypeMismatch as u32), err.raw_code());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_timeout_leaves_cache_unchanged() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let node = net.master.node(node_id(NODE)).unwrap();

    node.write_i32(TARGET_POSITION, 0, 100).await.unwrap();
    net.drive(NODE).set_silent(true);

    let start = tokio::time::Instant::now();
    let err = node.write_i32(TARGET_POSITION, 0, 200).await.unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert_eq!(ErrorClass::Master, err.class());
    assert_eq!(
        Some(&LocalError::SdoTimeout {
            node: NODE,
            index: TARGET_POSITION,
            sub: 0
        }),
        err.as_local()
    );
    assert_eq!(100, node.cached(TARGET_POSITION, 0).unwrap().value.as_i32());

    // The failed read falls back to the cached value, flagged invalid
    let entry = node.read_entry(POSITION_ACTUAL, 0).await;
    assert!(!entry.valid);
    let entry = node.read_entry(TARGET_POSITION, 0).await;
    assert!(!entry.valid);
    assert_eq!(100, entry.value.as_i32());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_late_response_is_discarded() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let node = net.master.node(node_id(NODE)).unwrap();
    let drive = net.drive(NODE);

    drive.set_sdo_delay(Duration::from_millis(600));
    let err = node.read_fresh(POSITION_ACTUAL, 0).await.unwrap_err();
    assert!(matches!(
        err.as_local(),
        Some(LocalError::SdoTimeout { .. })
    ));

    // Let the late response arrive with nothing waiting for it
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node.cached(POSITION_ACTUAL, 0).is_none());

    drive.set_sdo_delay(Duration::ZERO);
    drive.set(POSITION_ACTUAL, 0, 4321i32.into());
    assert_eq!(4321, node.read_fresh_i32(POSITION_ACTUAL, 0).await.unwrap());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_late_confirmation_does_not_answer_next_request() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let node = net.master.node(node_id(NODE)).unwrap();
    let drive = net.drive(NODE);
    drive.clear_events();

    // The drive applies the write, but confirms it after the timeout
    drive.set_sdo_delay(Duration::from_millis(600));
    let err = node.write_u16(CONTROLWORD, 0, 6).await.unwrap_err();
    assert!(matches!(
        err.as_local(),
        Some(LocalError::SdoTimeout { .. })
    ));
    assert!(drive.events().contains(&SimEvent::SdoAbort {
        index: CONTROLWORD,
        sub: 0,
        abort_code: AbortCode::SdoTimeout as u32,
    }));

    // A second write to the same object, which the drive refuses
    drive.set_sdo_delay(Duration::from_millis(200));
    let err = node.write_u32(CONTROLWORD, 0, 0x1F).await.unwrap_err();
    assert_eq!(Some(AbortCode::DataTypeMismatch as u32), err.raw_code());

    assert!(node.cached(CONTROLWORD, 0).is_none());
    assert_eq!(Some(ObjectValue::from(6u16)), drive.get(CONTROLWORD, 0));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_concurrent_transactions_are_not_interleaved() {
    let _ = env_logger::try_init();
    let net = TestNetwork::new(config());
    let node = net.master.node(node_id(NODE)).unwrap();
    let drive = net.drive(NODE);
    drive.set_sdo_delay(Duration::from_millis(20));
    drive.clear_events();

    let a = node.clone();
    let b = node.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.write_i32(TARGET_POSITION, 0, 1).await }),
        tokio::spawn(async move { b.write_u32(PROFILE_VELOCITY, 0, 2).await }),
    );
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();

    let sdo_events: Vec<SimEvent> = drive
        .events()
        .into_iter()
        .filter(|e| matches!(e, SimEvent::SdoRequest { .. } | SimEvent::SdoResponse { .. }))
        .collect();
    assert_eq!(4, sdo_events.len());
    for pair in sdo_events.chunks(2) {
        match (&pair[0], &pair[1]) {
            (
                SimEvent::SdoRequest { index, sub },
                SimEvent::SdoResponse {
                    index: resp_index,
                    sub: resp_sub,
                },
            ) => assert_eq!((index, sub), (resp_index, resp_sub)),
            other => panic!("Interleaved SDO traffic: {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_cache_max_age() {
    let _ = env_logger::try_init();
    let config = MasterConfig::new(node_id(127)).with_node(
        NodeConfig::new(node_id(NODE)).with_cache_max_age(Duration::from_millis(100)),
    );
    let net = TestNetwork::new(config);
    let node = net.master.node(node_id(NODE)).unwrap();
    let drive = net.drive(NODE);

    drive.set(POSITION_ACTUAL, 0, 10i32.into());
    assert_eq!(10, node.read_i32(POSITION_ACTUAL, 0).await.unwrap());

    // Within the max age, the cache answers
    drive.set(POSITION_ACTUAL, 0, 20i32.into());
    drive.clear_events();
    assert_eq!(10, node.read_i32(POSITION_ACTUAL, 0).await.unwrap());
    assert!(drive.events().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(20, node.read_i32(POSITION_ACTUAL, 0).await.unwrap());
}

#[tokio::test]
#[serial]
async fn test_unknown_node() {
    let net = TestNetwork::new(config());
    let err = net.master.node(node_id(9)).unwrap_err();
    assert_eq!(
        Some(&LocalError::UnknownNode { node: 9 }),
        err.as_local()
    );
}
