use std::sync::{Arc, Mutex};

use canmotion_common::messages::CanMessage;
use canmotion_common::traits::{AsyncCanReceiver, AsyncCanSender};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// An in-process CAN bus
///
/// Every frame sent by a participant is delivered to all other participants, and to all
/// listeners.
#[derive(Clone, Default)]
pub struct SimBus {
    channels: Arc<Mutex<Vec<UnboundedSender<CanMessage>>>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a participant. It does not receive its own frames.
    pub fn connect(&self) -> (SimBusSender, SimBusReceiver) {
        let (tx, rx) = unbounded_channel();
        let mut channels = self.channels.lock().unwrap();
        let index = channels.len();
        channels.push(tx);
        (
            SimBusSender {
                index: Some(index),
                channels: self.channels.clone(),
            },
            SimBusReceiver { channel_rx: rx },
        )
    }

    /// Attach a listener, which receives every frame
    pub fn new_receiver(&self) -> SimBusReceiver {
        let (tx, rx) = unbounded_channel();
        self.channels.lock().unwrap().push(tx);
        SimBusReceiver { channel_rx: rx }
    }

    /// Get a sender which is not a participant, e.g. to inject frames from a test
    pub fn new_sender(&self) -> SimBusSender {
        SimBusSender {
            index: None,
            channels: self.channels.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimBusSender {
    index: Option<usize>,
    channels: Arc<Mutex<Vec<UnboundedSender<CanMessage>>>>,
}

impl SimBusSender {
    /// Deliver a frame immediately
    pub fn send_now(&self, msg: CanMessage) {
        for (i, ch) in self.channels.lock().unwrap().iter().enumerate() {
            if Some(i) != self.index {
                // A closed channel is a participant which has gone away
                ch.send(msg).ok();
            }
        }
    }
}

impl AsyncCanSender for SimBusSender {
    type Error = CanMessage;

    async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        self.send_now(msg);
        Ok(())
    }
}

pub struct SimBusReceiver {
    channel_rx: UnboundedReceiver<CanMessage>,
}

impl SimBusReceiver {
    /// Take all frames received so far
    pub fn drain(&mut self) -> Vec<CanMessage> {
        let mut frames = Vec::new();
        while let Ok(msg) = self.channel_rx.try_recv() {
            frames.push(msg);
        }
        frames
    }
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = ();

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        self.channel_rx.recv().await.ok_or(())
    }

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.try_recv().ok()
    }

    fn flush(&mut self) {
        while self.channel_rx.try_recv().is_ok() {}
    }
}
