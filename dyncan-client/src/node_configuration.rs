//! Declarative PDO configuration
//!
//! A [`PdoConfig`] describes one PDO (COB-ID, transmission type, and mapped
//! objects) and can be written to a device with
//! [`SdoClient::configure_tpdo`](crate::SdoClient::configure_tpdo) /
//! [`configure_rpdo`](crate::SdoClient::configure_rpdo). Configurations can be
//! stored in TOML files.

use serde::{Deserialize, Serialize};

/// A single object mapped into a PDO
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct PdoMapping {
    /// Object index
    pub index: u16,
    /// Object sub index
    pub sub: u8,
    /// Mapped size in bytes
    pub size: u8,
}

impl PdoMapping {
    /// Pack into the u32 stored in a mapping parameter entry
    ///
    /// The layout is `[data index u16 LE | sub index u8 | bit length u8]`.
    pub fn to_mapping_value(&self) -> u32 {
        self.index as u32 | ((self.sub as u32) << 16) | ((self.size as u32 * 8) << 24)
    }
}

/// Configuration for one PDO
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PdoConfig {
    /// The COB-ID the PDO is sent or received on
    pub cob: u32,
    /// Whether the PDO is enabled
    pub enabled: bool,
    /// The transmission type byte
    pub transmission_type: u8,
    /// The mapped objects, in payload order
    pub mappings: Vec<PdoMapping>,
}

/// A set of PDO configurations for one node, loadable from a TOML file
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NodeConfig {
    /// Transmit PDO configurations, by PDO number
    #[serde(default)]
    pub tpdo: Vec<PdoConfig>,
    /// Receive PDO configurations, by PDO number
    #[serde(default)]
    pub rpdo: Vec<PdoConfig>,
}

impl NodeConfig {
    /// Parse a NodeConfig from TOML text
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Serialize to TOML text
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).expect("NodeConfig serialization cannot fail")
    }
}
