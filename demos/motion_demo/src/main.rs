//! Motion demo: **the motor will move!**
//!
//! Safe profile velocity, acceleration and deceleration should be configured on the drive before
//! running this.

use std::{convert::Infallible, path::PathBuf, time::Duration};

use canmotion_master::{
    common::{open_socketcan, pdo::PdoMapping, traits::AsyncCanSender, NodeId, ObjectSize},
    Master, MasterConfig, NmtTarget, NodeConfig, PdoChannel, PdoChannelConfig, TransmissionMode,
};
use clap::Parser;
use tokio::time::sleep;

mod drive;

use drive::{
    cw, set_bits, Drive, MotionError, OperationMode, CONTROLWORD, POSITION_ACTUAL,
    PROFILE_ACCELERATION, PROFILE_DECELERATION, PROFILE_VELOCITY, STATUSWORD, TARGET_POSITION,
};

const CONTROLWORD_SYNC: &str = "CWS";
const PROFILE_VELOCITY_PDO: &str = "PV";
const STATUS_POSITION: &str = "SP";

const MOVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
struct Args {
    /// The socketcan interface, e.g. can0
    socket: String,
    /// Node ID of the drive
    #[clap(long, short, default_value = "1")]
    node_id: u8,
    /// Node ID used for the master's heartbeat
    #[clap(long, short, default_value = "127")]
    master_id: u8,
    /// Load the master configuration from a TOML file instead of using the built in one
    #[clap(long, short)]
    config: Option<PathBuf>,
}

/// RxPDO1 carries the controlword, applied on SYNC. RxPDO2 the profile velocity. TxPDO1 sends
/// statusword and position whenever they change, at most every 10ms.
fn default_config(master: NodeId, drive: NodeId) -> MasterConfig {
    let node = NodeConfig::new(drive)
        .with_heartbeat_timeout(Duration::from_millis(1500))
        .with_pdo(PdoChannelConfig::new(
            CONTROLWORD_SYNC,
            PdoChannel::RX1,
            TransmissionMode::Sync,
            vec![PdoMapping::new(CONTROLWORD, 0, ObjectSize::Bits16)],
        ))
        .with_pdo(PdoChannelConfig::new(
            PROFILE_VELOCITY_PDO,
            PdoChannel::RX2,
            TransmissionMode::Async,
            vec![PdoMapping::new(PROFILE_VELOCITY, 0, ObjectSize::Bits32)],
        ))
        .with_pdo(
            PdoChannelConfig::new(
                STATUS_POSITION,
                PdoChannel::TX1,
                TransmissionMode::Async,
                vec![
                    PdoMapping::new(STATUSWORD, 0, ObjectSize::Bits16),
                    PdoMapping::new(POSITION_ACTUAL, 0, ObjectSize::Bits32),
                ],
            )
            .with_inhibit_time(100),
        );
    MasterConfig::new(master)
        .with_heartbeat_period(Duration::from_secs(1))
        .with_node(node)
}

/// Bring the network up and configure the drive
async fn setup<S: AsyncCanSender>(
    master: &Master<S>,
    drive: &Drive<S>,
) -> Result<(), MotionError> {
    // Known starting state
    drive.disable().await?;
    drive.clear_error().await?;

    // NMT transitions are confirmed by the drive's heartbeat
    drive.node().set_heartbeat_producer_time(500).await?;
    log::info!("Drive heartbeat set to 500ms");

    master.enter_preop(NmtTarget::All).await?;
    log::info!("Set to Pre-Operational");
    sleep(Duration::from_secs(1)).await;

    drive.node().setup_pdos().await?;
    log::info!("PDO configuration finished");

    // The drive faults if the master's heartbeat is missing for 1.5s
    drive
        .node()
        .set_remote_heartbeat_consumer(master.node_id(), 1500)
        .await?;
    sleep(Duration::from_secs(1)).await;

    master.start(NmtTarget::All).await?;
    log::info!("Set to Operational");
    sleep(Duration::from_secs(1)).await;
    Ok(())
}

/// A move configured ahead of time and started by the SYNC, as several drives would be
async fn sync_move<S: AsyncCanSender>(
    master: &Master<S>,
    drive: &Drive<S>,
) -> Result<(), MotionError> {
    let node = drive.node();

    // Save the current profile, to restore afterwards
    let saved = [
        node.read_entry(PROFILE_VELOCITY, 0).await,
        node.read_entry(PROFILE_ACCELERATION, 0).await,
        node.read_entry(PROFILE_DECELERATION, 0).await,
    ];

    node.write_pdo(PROFILE_VELOCITY_PDO, &[120u32.into()]).await?;
    node.write_u32(PROFILE_ACCELERATION, 0, 60).await?;
    node.write_u32(PROFILE_DECELERATION, 0, 60).await?;
    node.write_i32(TARGET_POSITION, 0, 4000).await?;

    let word = set_bits(
        cw::ENABLE,
        &[
            (cw::NEW_SET_POINT, true),
            (cw::RELATIVE, true),
            (cw::HALT, false),
        ],
    );
    node.write_pdo(CONTROLWORD_SYNC, &[word.into()]).await?;
    log::info!("Move configured, waiting for SYNC...");
    sleep(Duration::from_secs(5)).await;

    master.broadcast_sync().await?;
    log::info!("Sent SYNC, motion started");
    sleep(Duration::from_millis(50)).await;
    drive
        .write_controlword(set_bits(word, &[(cw::NEW_SET_POINT, false)]))
        .await?;

    drive.wait_for_target(MOVE_TIMEOUT).await?;
    log::info!("Motion complete");

    if saved.iter().all(|entry| entry.valid) {
        log::info!("Returning to the previous profile");
        let [velocity, acceleration, deceleration] = saved.map(|entry| entry.value);
        node.write_pdo(PROFILE_VELOCITY_PDO, &[velocity]).await?;
        node.write(PROFILE_ACCELERATION, 0, acceleration).await?;
        node.write(PROFILE_DECELERATION, 0, deceleration).await?;
    } else {
        log::warn!("Previous profile was not read, leaving the demo profile in place");
    }
    Ok(())
}

/// Run the demo sequence. Only returns on failure.
async fn run<S: AsyncCanSender>(
    master: &Master<S>,
    drive: &Drive<S>,
) -> Result<Infallible, MotionError> {
    setup(master, drive).await?;

    log::info!("Enabling...");
    drive.halt().await?;
    drive.enable().await?;

    drive.set_mode(OperationMode::ProfileVelocity).await?;
    log::info!("Profile velocity: starting motion");
    drive.move_at_velocity(120).await?;
    sleep(Duration::from_secs(1)).await;
    drive.halt().await?;
    log::info!("Profile velocity: stopping");
    sleep(Duration::from_secs(1)).await;

    drive.set_mode(OperationMode::ProfilePosition).await?;
    log::info!("Profile position: starting motion");
    drive
        .move_to_position(1000, true, true, MOVE_TIMEOUT)
        .await?;
    log::info!("Profile position: motion complete");
    sleep(Duration::from_secs(1)).await;

    sync_move(master, drive).await?;

    loop {
        sleep(Duration::from_secs(3)).await;
        log::info!("Moving...");
        drive.move_to_position(500, true, true, MOVE_TIMEOUT).await?;
        log::info!("Moved");
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let (master_id, drive_id) = match (NodeId::new(args.master_id), NodeId::new(args.node_id)) {
        (Ok(master), Ok(drive)) => (master, drive),
        _ => {
            log::error!("Node IDs must be in 1..=127");
            std::process::exit(1);
        }
    };
    let config = match &args.config {
        Some(path) => match MasterConfig::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("{e}");
                std::process::exit(1);
            }
        },
        None => default_config(master_id, drive_id),
    };

    let (tx, rx) = match open_socketcan(&args.socket) {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("Failed to open {}: {e}", args.socket);
            std::process::exit(1);
        }
    };
    let master = match Master::new(config, tx) {
        Ok(master) => master,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };
    master.spawn_dispatcher(rx);
    master.spawn_heartbeat_producer();

    let mut events = master.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log::warn!("{event:?}");
        }
    });

    let drive = match master.node(drive_id) {
        Ok(node) => Drive::new(node),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let err = match run(&master, &drive).await {
        Ok(never) => match never {},
        Err(e) => e,
    };
    log::error!("Demo failed: {err}");
    if let Err(e) = drive.disable().await {
        log::error!("Could not disable the drive: {e}");
    }
    loop {
        sleep(Duration::from_secs(1)).await;
    }
}
