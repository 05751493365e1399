//! A CANopen device with a runtime-built object dictionary
//!
//! This crate implements the node side of the dyncan stack. A [`Device`] owns
//! an [`ObjectDictionary`] and speaks NMT (with heartbeat production and
//! supervision), SYNC, TIME, EMCY, SDO (server), PDO and LSS (slave)
//! concurrently.
//!
//! # Operation
//!
//! The device is run by polling [`Device::process`] from your application.
//! Received CAN frames are queued with [`Device::handle_frame`] and consumed
//! by the next process call; outbound frames are passed to the send callback.
//! All timing derives from the monotonic microsecond argument, so there are no
//! hidden clocks and tests can drive virtual time.
//!
//! Protocol configuration lives in the dictionary itself (COB-IDs, heartbeat
//! times, PDO communication and mapping parameters). The engines re-read
//! their entries whenever they change, including changes performed over the
//! bus through the SDO server.
#![warn(missing_docs, missing_debug_implementations)]

mod device;
mod emcy;
mod error;
mod lss_slave;
mod nmt;
pub mod object_dict;
mod pdo;
mod sdo_server;
mod sync;
mod time;

pub use device::{Device, DeviceEvent};
pub use error::ConfigError;
pub use lss_slave::{LssConfig, LssEvent};
pub use nmt::HeartbeatConsumer;
pub use object_dict::{
    DataObject, EntryInfo, ObjectDictError, ObjectDictionary, SdoClientEndpoint,
};
pub use pdo::{PdoMap, PdoMapEntry};

pub use dyncan_common as common;
