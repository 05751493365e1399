//! A client for communicating with CANopen nodes
//!
//! The crate provides the master-side services of the dyncan stack:
//!
//! - An [SDO client](SdoClient) for reading/writing a node's object dictionary
//!   via its SDO server
//! - An [NMT master](NmtMaster) for commanding node states and monitoring the
//!   bus for heartbeats
//! - An [LSS master](LssMaster) for discovering and configuring un-configured
//!   nodes with IDs, including the fastscan protocol
//! - A [NodeConfig] TOML file format, which allows for storing and loading PDO
//!   configuration to be written over SDO
//!
//! This library is based on tokio/async. Requests are futures which resolve
//! when the matching response frame arrives, or reject on timeout.
#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod lss_master;
mod nmt_master;
mod node_configuration;
mod sdo_client;

pub use dyncan_common as common;

pub use lss_master::{LssError, LssMaster};
pub use nmt_master::{NmtMaster, NmtMasterError, Node};
pub use node_configuration::{NodeConfig, PdoConfig, PdoMapping};
pub use sdo_client::{RawAbortCode, SdoClient, SdoClientError, DEFAULT_RESPONSE_TIMEOUT};
