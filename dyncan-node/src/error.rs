//! Device configuration errors

use snafu::Snafu;

/// Errors raised when a protocol engine's configuration entries are missing or
/// inconsistent
///
/// These surface either when a [`Device`](crate::Device) is created or started,
/// or at the offending operation (e.g. queueing an emergency without an EMCY
/// COB-ID configured). Per-transfer protocol errors do not use this type; they
/// are carried on the initiating call instead.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A required object dictionary entry is absent
    #[snafu(display("Required object {index:04X} is missing from the dictionary"))]
    MissingRequiredEntry {
        /// The missing index
        index: u16,
    },
    /// A configuration bitfield requests something unsupported (extended
    /// frames, dynamic COB-ID allocation)
    #[snafu(display("Object {index:04X} requests an unsupported bitfield option"))]
    InvalidBitfield {
        /// The offending entry
        index: u16,
    },
    /// A configured COB-ID resolves to zero
    #[snafu(display("Object {index:04X} resolves to a zero COB-ID"))]
    ZeroCobId {
        /// The offending entry
        index: u16,
    },
    /// The SYNC producer is enabled but the communication cycle period is zero
    ZeroCyclePeriod,
    /// The requested producer is disabled by its configuration entry
    #[snafu(display("{what} production is disabled by configuration"))]
    ProducerDisabled {
        /// Which producer was requested
        what: &'static str,
    },
    /// Emergency info data is limited to 5 bytes
    #[snafu(display("EMCY info field is limited to 5 bytes, got {len}"))]
    EmcyInfoTooLong {
        /// Length of the rejected info field
        len: usize,
    },
    /// A PDO communication entry specifies a transmission type the stack does
    /// not implement
    #[snafu(display("Unsupported PDO transmission type {value:#04X} on {index:04X}"))]
    UnsupportedTransmissionType {
        /// The PDO communication parameter index
        index: u16,
        /// The rejected transmission type
        value: u8,
    },
    /// The node has no valid node ID assigned
    NodeIdUnconfigured,
}
