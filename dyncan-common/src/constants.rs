//! Constants defining standard object indexes and index regions
//!
//!

/// Object indices for standard objects
pub mod object_ids {
    /// The Device type object index
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// The Error register object index
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// The Pre-defined error field object index
    pub const PREDEFINED_ERROR_FIELD: u16 = 0x1003;
    /// The COB-ID SYNC object index
    pub const COB_ID_SYNC: u16 = 0x1005;
    /// The Communication cycle period object index
    pub const COMM_CYCLE_PERIOD: u16 = 0x1006;
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// The software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// The COB-ID TIME object index
    pub const COB_ID_TIME: u16 = 0x1012;
    /// The COB-ID EMCY object index
    pub const COB_ID_EMCY: u16 = 0x1014;
    /// The EMCY inhibit time object index (units of 100us)
    pub const INHIBIT_TIME_EMCY: u16 = 0x1015;
    /// The consumer heartbeat time object index
    pub const HEARTBEAT_CONSUMER_TIME: u16 = 0x1016;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// The SYNC counter overflow object index
    pub const SYNC_COUNTER_OVERFLOW: u16 = 0x1019;
}

/// Index regions for the configurable communication objects
pub mod index_regions {
    use core::ops::RangeInclusive;

    /// SDO server parameter records
    pub const SDO_SERVER: RangeInclusive<u16> = 0x1200..=0x127F;
    /// SDO client parameter records
    pub const SDO_CLIENT: RangeInclusive<u16> = 0x1280..=0x12FF;
    /// RPDO communication parameter records
    pub const RPDO_COMM: RangeInclusive<u16> = 0x1400..=0x15FF;
    /// RPDO mapping parameter arrays
    pub const RPDO_MAPPING: RangeInclusive<u16> = 0x1600..=0x17FF;
    /// TPDO communication parameter records
    pub const TPDO_COMM: RangeInclusive<u16> = 0x1800..=0x19FF;
    /// TPDO mapping parameter arrays
    pub const TPDO_MAPPING: RangeInclusive<u16> = 0x1A00..=0x1BFF;

    /// Offset from a PDO communication index to its mapping index
    pub const PDO_MAPPING_OFFSET: u16 = 0x200;
}

/// The canonical PDO base COB-IDs which have the node ID OR-ed in when the low
/// four bits of a configured COB-ID are zero
pub const PDO_BASE_COB_IDS: [u16; 8] = [
    0x180, 0x200, 0x280, 0x300, 0x380, 0x400, 0x480, 0x500,
];
