//! Shared types for the dyncan CANopen stack
//!
//! This crate holds the pieces used by both [dyncan-node] and [dyncan-client]:
//! the CAN message model, the frame codecs for each protocol, the CANopen data
//! type table and value codec, and the sender/receiver traits which abstract
//! the CAN transport.

pub mod constants;
pub mod lss;
pub mod messages;
pub mod node_id;
pub mod objects;
pub mod sdo;
pub mod traits;
pub mod types;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
pub use socketcan::{open_socketcan, SocketCanReceiver, SocketCanSender};

pub use node_id::NodeId;

pub use messages::{CanError, CanId, CanMessage};
