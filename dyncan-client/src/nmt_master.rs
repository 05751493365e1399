//! Simple interface for sending NMT commands to a bus
use std::time::Instant;

use snafu::Snafu;

use dyncan_common::{
    messages::{CanMessage, DyncanMessage, NmtCommand, NmtCommandSpecifier, NmtState},
    traits::{AsyncCanReceiver, AsyncCanSender},
};

/// Represents the information about a single node detected on the bus by the
/// [NmtMaster]
#[derive(Copy, Clone, Debug)]
pub struct Node {
    /// The ID of the node
    pub id: u8,
    /// The last NMT state reported by the node
    pub state: NmtState,
    /// The time when the last heartbeat message was received from the node
    pub last_status: Instant,
}

/// Error returned by [`NmtMaster`] methods
#[derive(Clone, Copy, Debug, PartialEq, Snafu)]
pub enum NmtMasterError {
    /// Failed to send a message to the bus
    SendFailed,
}

/// An NMT master which allows monitoring the bus for heartbeats and commanding
/// state changes
#[derive(Debug)]
pub struct NmtMaster<S, R> {
    sender: S,
    receiver: R,
    nodes: Vec<Node>,
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> NmtMaster<S, R> {
    /// Create a new NmtMaster
    ///
    /// # Arguments
    /// - `sender`: An object which implements [`AsyncCanSender`] to be used
    ///   for sending messages to the bus
    /// - `receiver`: An object which implements [`AsyncCanReceiver`] to be
    ///   used for receiving messages from the bus
    pub fn new(sender: S, receiver: R) -> Self {
        Self {
            sender,
            receiver,
            nodes: Vec::new(),
        }
    }

    /// Receive and process all messages available from the message receiver
    pub fn process_rx(&mut self) {
        while let Some(msg) = self.receiver.try_recv() {
            self.handle_message(msg);
        }
    }

    fn handle_message(&mut self, msg: CanMessage) {
        // Attempt to convert the raw message. This may fail, e.g. if non
        // CANopen messages are received, and that's OK; those are ignored.
        let parsed: DyncanMessage = match msg.try_into() {
            Ok(m) => m,
            Err(_) => return,
        };

        if let DyncanMessage::Heartbeat(heartbeat) = parsed {
            self.handle_heartbeat(heartbeat.node, heartbeat.state)
        }
    }

    /// Get a list of all nodes detected on the bus via heartbeat messages
    pub fn get_nodes(&mut self) -> &[Node] {
        self.process_rx();
        &self.nodes
    }

    fn handle_heartbeat(&mut self, node: u8, state: NmtState) {
        match self.nodes.binary_search_by_key(&node, |n| n.id) {
            Ok(pos) => {
                self.nodes[pos].state = state;
                self.nodes[pos].last_status = Instant::now();
            }
            Err(pos) => {
                self.nodes.insert(
                    pos,
                    Node {
                        id: node,
                        state,
                        last_status: Instant::now(),
                    },
                );
            }
        }
    }

    /// Send start operation command
    ///
    /// # Arguments
    ///
    /// - `node`: The node ID to command, or 0 to broadcast to all nodes
    pub async fn nmt_start(&mut self, node: u8) -> Result<(), NmtMasterError> {
        self.send_nmt_cmd(NmtCommandSpecifier::Start, node).await
    }

    /// Send stop command
    ///
    /// # Arguments
    ///
    /// - `node`: The node ID to command, or 0 to broadcast to all nodes
    pub async fn nmt_stop(&mut self, node: u8) -> Result<(), NmtMasterError> {
        self.send_nmt_cmd(NmtCommandSpecifier::Stop, node).await
    }

    /// Send enter pre-operational command
    ///
    /// # Arguments
    ///
    /// - `node`: The node ID to command, or 0 to broadcast to all nodes
    pub async fn nmt_enter_pre_operational(&mut self, node: u8) -> Result<(), NmtMasterError> {
        self.send_nmt_cmd(NmtCommandSpecifier::EnterPreOp, node)
            .await
    }

    /// Send application reset command
    ///
    /// # Arguments
    ///
    /// - `node`: The node ID to command, or 0 to broadcast to all nodes
    pub async fn nmt_reset_node(&mut self, node: u8) -> Result<(), NmtMasterError> {
        self.send_nmt_cmd(NmtCommandSpecifier::ResetNode, node).await
    }

    /// Send communications reset command
    ///
    /// # Arguments
    ///
    /// - `node`: The node ID to command, or 0 to broadcast to all nodes
    pub async fn nmt_reset_comms(&mut self, node: u8) -> Result<(), NmtMasterError> {
        self.send_nmt_cmd(NmtCommandSpecifier::ResetComm, node).await
    }

    async fn send_nmt_cmd(
        &mut self,
        cmd: NmtCommandSpecifier,
        node: u8,
    ) -> Result<(), NmtMasterError> {
        let message = NmtCommand { cs: cmd, node };
        self.sender
            .send(message.into())
            .await
            .map_err(|_| NmtMasterError::SendFailed)
    }
}
