#![allow(dead_code)]
use canmotion_common::{messages::CanOpenMessage, traits::AsyncCanReceiver, NodeId};
use canmotion_master::{Master, MasterConfig};
use tokio::task::JoinHandle;

use crate::sim_bus::{SimBus, SimBusReceiver, SimBusSender};
use crate::sim_drive::SimDrive;

pub fn node_id(id: u8) -> NodeId {
    NodeId::new(id).unwrap()
}

/// A master and one simulated drive for each node in its configuration, on a shared bus
///
/// The master's dispatcher runs on a background task until the network is dropped.
pub struct TestNetwork {
    pub bus: SimBus,
    pub master: Master<SimBusSender>,
    pub drives: Vec<SimDrive>,
    dispatcher: JoinHandle<()>,
}

impl TestNetwork {
    pub fn new(config: MasterConfig) -> Self {
        let bus = SimBus::new();
        let drives = config
            .nodes
            .iter()
            .map(|n| SimDrive::spawn(&bus, n.node_id.raw()))
            .collect();
        let (sender, receiver) = bus.connect();
        let master = Master::new(config, sender).unwrap();
        let dispatcher = master.spawn_dispatcher(receiver);
        Self {
            bus,
            master,
            drives,
            dispatcher,
        }
    }

    pub fn drive(&self, id: u8) -> &SimDrive {
        self.drives
            .iter()
            .find(|d| d.node_id() == id)
            .expect("no drive with that ID")
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

pub struct BusLogger {
    rx: SimBusReceiver,
}

impl BusLogger {
    pub fn new(rx: SimBusReceiver) -> Self {
        Self { rx }
    }

    pub fn print(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        while let Some(msg) = self.rx.try_recv() {
            let parsed_msg: Result<CanOpenMessage, _> = msg.try_into();

            if let Ok(msg) = parsed_msg {
                println!("{:?}", msg);
            } else {
                println!("{:?}", msg);
            }
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        self.print();
    }
}
