//! Object model enums shared by the dictionary, the SDO server, and EDS files

/// The CANopen object codes, identifying the shape of a dictionary entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectCode {
    /// An entry with no data
    Null = 0,
    /// A large variable-length block of data
    Domain = 2,
    /// A type definition entry
    DefType = 5,
    /// A structure definition entry
    DefStruct = 6,
    /// A single value
    #[default]
    Var = 7,
    /// An array of values sharing one data type
    Array = 8,
    /// A structure of values with per-member data types
    Record = 9,
}

impl ObjectCode {
    /// Returns true for the object codes which hold a single scalar value
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Var | Self::DefType | Self::Domain)
    }

    /// Returns true for the object codes which hold sub-objects
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Array | Self::Record | Self::DefStruct)
    }
}

impl TryFrom<u8> for ObjectCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectCode::Null),
            2 => Ok(ObjectCode::Domain),
            5 => Ok(ObjectCode::DefType),
            6 => Ok(ObjectCode::DefStruct),
            7 => Ok(ObjectCode::Var),
            8 => Ok(ObjectCode::Array),
            9 => Ok(ObjectCode::Record),
            _ => Err(()),
        }
    }
}

/// Specifies what accesses are allowed on an object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and also will never be changed, even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if the object may be read over the bus
    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Ro | Self::Rw | Self::Const)
    }

    /// Returns true if the object may be written over the bus
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Rw | Self::Wo)
    }

    /// The lower-case string form used in EDS files
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ro => "ro",
            Self::Wo => "wo",
            Self::Rw => "rw",
            Self::Const => "const",
        }
    }

    /// Parse the string form used in EDS files (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ro" => Some(Self::Ro),
            "wo" => Some(Self::Wo),
            "rw" => Some(Self::Rw),
            "const" => Some(Self::Const),
            _ => None,
        }
    }
}

/// Identifies a sub-object in the dictionary by index and sub-index
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    /// The object index
    pub index: u16,
    /// The sub index
    pub sub: u8,
}

impl ObjectId {
    /// Create a new ObjectId
    pub fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }
}
