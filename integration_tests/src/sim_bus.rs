//! An in-memory CAN bus for wiring devices and clients together in tests

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Arc, Mutex};

use dyncan_common::messages::CanMessage;
use dyncan_common::traits::{AsyncCanReceiver, AsyncCanSender, CanSendError};
use dyncan_node::Device;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
struct BusInner {
    /// Frames sent by client-side senders, awaiting delivery to devices
    pending_from_clients: VecDeque<CanMessage>,
    /// Channels of external listeners (client receivers)
    listeners: Vec<UnboundedSender<CanMessage>>,
}

/// A simulated bus
///
/// Devices are attached by passing them to [`SimBus::process`]; async clients
/// attach through [`SimBus::new_sender`] / [`SimBus::new_receiver`]. Every
/// frame is delivered to everything on the bus except its sender.
#[derive(Clone, Default)]
pub struct SimBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sender half for a client
    pub fn new_sender(&self) -> SimBusSender {
        SimBusSender {
            inner: self.inner.clone(),
        }
    }

    /// Create a receiver half for a client
    ///
    /// The receiver observes every frame on the bus, including frames sent by
    /// other clients.
    pub fn new_receiver(&self) -> SimBusReceiver {
        let (tx, rx) = unbounded_channel();
        self.inner.lock().unwrap().listeners.push(tx);
        SimBusReceiver { channel_rx: rx }
    }

    /// Run one bus cycle at the given time
    ///
    /// Delivers client frames to every device, processes each device, and fans
    /// device output out to the other devices and all external listeners.
    pub fn process(&self, devices: &mut [&mut Device], now_us: u64) {
        let client_frames: Vec<CanMessage> = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending_from_clients.drain(..).collect()
        };
        for frame in &client_frames {
            for device in devices.iter_mut() {
                device.handle_frame(*frame);
            }
        }

        let mut outbox = Vec::new();
        for (i, device) in devices.iter_mut().enumerate() {
            device.process(now_us, &mut |msg| outbox.push((i, msg)));
        }

        for (sender_idx, msg) in outbox {
            for (i, device) in devices.iter_mut().enumerate() {
                if i != sender_idx {
                    device.handle_frame(msg);
                }
            }
            self.deliver_to_listeners(msg);
        }
    }

    fn deliver_to_listeners(&self, msg: CanMessage) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|tx| tx.send(msg).is_ok());
    }
}

/// The sending half of a client attachment
#[derive(Clone)]
pub struct SimBusSender {
    inner: Arc<Mutex<BusInner>>,
}

impl AsyncCanSender for SimBusSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        let mut inner = self.inner.lock().unwrap();
        // Queue for the devices; they consume it on the next bus cycle
        inner.pending_from_clients.push_back(msg);
        // Other external listeners on the bus see it immediately
        inner.listeners.retain(|tx| tx.send(msg).is_ok());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SimBusReceiverError {}

impl Display for SimBusReceiverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimBusReceiverError")
    }
}

impl std::error::Error for SimBusReceiverError {}

/// The receiving half of a client attachment
pub struct SimBusReceiver {
    channel_rx: UnboundedReceiver<CanMessage>,
}

impl SimBusReceiver {
    /// Discard any frames received so far
    pub fn flush(&mut self) {
        while self.channel_rx.try_recv().is_ok() {}
    }
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = SimBusReceiverError;

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        self.channel_rx.recv().await.ok_or(SimBusReceiverError {})
    }

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.try_recv().ok()
    }
}
