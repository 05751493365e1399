//! CANopen data types and the value codec
//!
//! Defines the full CiA 306 data type table and the conversion between typed
//! values and the little-endian byte strings that live in the object
//! dictionary and on the wire.

use snafu::Snafu;

/// The standardized CANopen data types
///
/// The discriminants are the type codes used in the object dictionary DEFTYPE
/// region and in EDS files.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DataType {
    Boolean = 0x01,
    Integer8 = 0x02,
    Integer16 = 0x03,
    Integer32 = 0x04,
    #[default]
    Unsigned8 = 0x05,
    Unsigned16 = 0x06,
    Unsigned32 = 0x07,
    Real32 = 0x08,
    VisibleString = 0x09,
    OctetString = 0x0A,
    UnicodeString = 0x0B,
    TimeOfDay = 0x0C,
    TimeDifference = 0x0D,
    Domain = 0x0F,
    Integer24 = 0x10,
    Real64 = 0x11,
    Integer40 = 0x12,
    Integer48 = 0x13,
    Integer56 = 0x14,
    Integer64 = 0x15,
    Unsigned24 = 0x16,
    Unsigned40 = 0x18,
    Unsigned48 = 0x19,
    Unsigned56 = 0x1A,
    Unsigned64 = 0x1B,
    PdoParameter = 0x20,
    PdoMapping = 0x21,
    SdoParameter = 0x22,
    Identity = 0x23,
}

#[allow(missing_docs)]
impl DataType {
    /// Attempt to create a DataType from its standardized code
    pub fn from_code(value: u16) -> Option<Self> {
        use DataType::*;
        match value {
            0x01 => Some(Boolean),
            0x02 => Some(Integer8),
            0x03 => Some(Integer16),
            0x04 => Some(Integer32),
            0x05 => Some(Unsigned8),
            0x06 => Some(Unsigned16),
            0x07 => Some(Unsigned32),
            0x08 => Some(Real32),
            0x09 => Some(VisibleString),
            0x0A => Some(OctetString),
            0x0B => Some(UnicodeString),
            0x0C => Some(TimeOfDay),
            0x0D => Some(TimeDifference),
            0x0F => Some(Domain),
            0x10 => Some(Integer24),
            0x11 => Some(Real64),
            0x12 => Some(Integer40),
            0x13 => Some(Integer48),
            0x14 => Some(Integer56),
            0x15 => Some(Integer64),
            0x16 => Some(Unsigned24),
            0x18 => Some(Unsigned40),
            0x19 => Some(Unsigned48),
            0x1A => Some(Unsigned56),
            0x1B => Some(Unsigned64),
            0x20 => Some(PdoParameter),
            0x21 => Some(PdoMapping),
            0x22 => Some(SdoParameter),
            0x23 => Some(Identity),
            _ => None,
        }
    }

    /// Get the standardized code for this data type
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Returns true if data type is one of the string types
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            Self::VisibleString | Self::OctetString | Self::UnicodeString
        )
    }

    /// Returns true for the signed integer types
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Self::Integer8
                | Self::Integer16
                | Self::Integer24
                | Self::Integer32
                | Self::Integer40
                | Self::Integer48
                | Self::Integer56
                | Self::Integer64
        )
    }

    /// Returns true for the unsigned integer types (including Boolean)
    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            Self::Boolean
                | Self::Unsigned8
                | Self::Unsigned16
                | Self::Unsigned24
                | Self::Unsigned32
                | Self::Unsigned40
                | Self::Unsigned48
                | Self::Unsigned56
                | Self::Unsigned64
        )
    }

    /// Returns true for the aggregate defstruct types, which hold no scalar value
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            Self::PdoParameter | Self::PdoMapping | Self::SdoParameter | Self::Identity
        )
    }

    /// The encoded width in bytes, for the fixed-width types
    ///
    /// Strings and domains have no fixed width and return None.
    pub fn fixed_size(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Boolean | Integer8 | Unsigned8 => Some(1),
            Integer16 | Unsigned16 => Some(2),
            Integer24 | Unsigned24 => Some(3),
            Integer32 | Unsigned32 | Real32 => Some(4),
            Integer40 | Unsigned40 => Some(5),
            Integer48 | Unsigned48 | TimeOfDay | TimeDifference => Some(6),
            Integer56 | Unsigned56 => Some(7),
            Integer64 | Unsigned64 | Real64 => Some(8),
            VisibleString | OctetString | UnicodeString | Domain | PdoParameter | PdoMapping
            | SdoParameter | Identity => None,
        }
    }
}

/// Milliseconds per day
const MS_PER_DAY: u64 = 86_400_000;

/// The CANopen TIME_OF_DAY / TIME_DIFFERENCE value
///
/// Six bytes on the wire: a 28-bit millisecond-of-day count in a u32 LE,
/// followed by a u16 LE day count. Days are counted from 1984-01-01.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeOfDay {
    /// Milliseconds since midnight
    pub millis: u32,
    /// Days since January 1, 1984
    pub days: u16,
}

impl TimeOfDay {
    /// Create a TimeOfDay from a total millisecond count since the 1984-01-01 epoch
    pub fn from_millis(total_ms: u64) -> Self {
        Self {
            millis: (total_ms % MS_PER_DAY) as u32,
            days: (total_ms / MS_PER_DAY) as u16,
        }
    }

    /// Get the total millisecond count since the 1984-01-01 epoch
    pub fn total_millis(&self) -> u64 {
        self.days as u64 * MS_PER_DAY + self.millis as u64
    }

    /// Encode to the 6-byte wire representation
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0..4].copy_from_slice(&self.millis.to_le_bytes());
        buf[4..6].copy_from_slice(&self.days.to_le_bytes());
        buf
    }

    /// Decode from the 6-byte wire representation
    pub fn from_le_bytes(bytes: [u8; 6]) -> Self {
        Self {
            millis: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            days: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
        }
    }
}

/// A typed CANopen value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A boolean value
    Boolean(bool),
    /// Any of the signed integer types
    Integer(i64),
    /// Any of the unsigned integer types
    Unsigned(u64),
    /// A 32-bit IEEE float
    Real32(f32),
    /// A 64-bit IEEE float
    Real64(f64),
    /// A VISIBLE_STRING or UNICODE_STRING value
    String(String),
    /// An OCTET_STRING or DOMAIN value
    Bytes(Vec<u8>),
    /// A TIME_OF_DAY or TIME_DIFFERENCE value
    Time(TimeOfDay),
}

impl Value {
    /// Get the value as a u64, if it is an integer type
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Value::Boolean(b) => Some(*b as u64),
            Value::Unsigned(v) => Some(*v),
            Value::Integer(v) => (*v >= 0).then_some(*v as u64),
            _ => None,
        }
    }

    /// Get the value as an i64, if it is an integer type
    pub fn as_signed(&self) -> Option<i64> {
        match self {
            Value::Boolean(b) => Some(*b as i64),
            Value::Integer(v) => Some(*v),
            Value::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::Unsigned(value as u64)
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Unsigned(value as u64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Unsigned(value as u64)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Unsigned(value)
    }
}

impl From<i8> for Value {
    fn from(value: i8) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

/// An error from [`encode`] or [`decode`]
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum CodecError {
    /// The value variant does not fit the requested data type
    #[snafu(display("Value {value:?} cannot be encoded as {data_type:?}"))]
    WrongValueKind {
        /// The requested data type
        data_type: DataType,
        /// The offending value
        value: Value,
    },
    /// The byte buffer length does not match the fixed width of the type
    #[snafu(display("Expected {expected} bytes for {data_type:?}, got {actual}"))]
    WrongLength {
        /// The requested data type
        data_type: DataType,
        /// The width of the type
        expected: usize,
        /// The provided buffer length
        actual: usize,
    },
    /// The data type holds no scalar value
    #[snafu(display("{data_type:?} is an aggregate type and has no scalar encoding"))]
    AggregateType {
        /// The requested data type
        data_type: DataType,
    },
    /// The bytes are not valid UTF-8 for a string type
    InvalidString,
}

/// Encode a typed value to its little-endian byte representation
///
/// Integer values are truncated to the declared width.
pub fn encode(value: &Value, data_type: DataType) -> Result<Vec<u8>, CodecError> {
    use DataType::*;

    if data_type.is_aggregate() {
        return AggregateTypeSnafu { data_type }.fail();
    }

    let wrong_kind = || {
        WrongValueKindSnafu {
            data_type,
            value: value.clone(),
        }
        .fail()
    };

    match data_type {
        Boolean => match value.as_unsigned() {
            Some(v) => Ok(vec![(v != 0) as u8]),
            None => wrong_kind(),
        },
        Integer8 | Integer16 | Integer24 | Integer32 | Integer40 | Integer48 | Integer56
        | Integer64 => match value.as_signed() {
            Some(v) => Ok(v.to_le_bytes()[..data_type.fixed_size().unwrap()].to_vec()),
            None => wrong_kind(),
        },
        Unsigned8 | Unsigned16 | Unsigned24 | Unsigned32 | Unsigned40 | Unsigned48 | Unsigned56
        | Unsigned64 => match value.as_unsigned() {
            Some(v) => Ok(v.to_le_bytes()[..data_type.fixed_size().unwrap()].to_vec()),
            None => wrong_kind(),
        },
        Real32 => match value {
            Value::Real32(v) => Ok(v.to_le_bytes().to_vec()),
            _ => wrong_kind(),
        },
        Real64 => match value {
            Value::Real64(v) => Ok(v.to_le_bytes().to_vec()),
            _ => wrong_kind(),
        },
        VisibleString | UnicodeString => match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            _ => wrong_kind(),
        },
        OctetString | Domain => match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            _ => wrong_kind(),
        },
        TimeOfDay | TimeDifference => match value {
            Value::Time(t) => Ok(t.to_le_bytes().to_vec()),
            _ => wrong_kind(),
        },
        PdoParameter | PdoMapping | SdoParameter | Identity => unreachable!(),
    }
}

/// Decode a little-endian byte string into a typed value
///
/// For fixed-width types the buffer length must match exactly. VISIBLE_STRING
/// values are trimmed at the first NUL byte.
pub fn decode(bytes: &[u8], data_type: DataType) -> Result<Value, CodecError> {
    use DataType::*;

    if data_type.is_aggregate() {
        return AggregateTypeSnafu { data_type }.fail();
    }

    if let Some(expected) = data_type.fixed_size() {
        if bytes.len() != expected {
            return WrongLengthSnafu {
                data_type,
                expected,
                actual: bytes.len(),
            }
            .fail();
        }
    }

    match data_type {
        Boolean => Ok(Value::Boolean(bytes[0] != 0)),
        Unsigned8 | Unsigned16 | Unsigned24 | Unsigned32 | Unsigned40 | Unsigned48 | Unsigned56
        | Unsigned64 => {
            let mut buf = [0u8; 8];
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(Value::Unsigned(u64::from_le_bytes(buf)))
        }
        Integer8 | Integer16 | Integer24 | Integer32 | Integer40 | Integer48 | Integer56
        | Integer64 => {
            let width = bytes.len();
            let mut buf = [0u8; 8];
            buf[..width].copy_from_slice(bytes);
            // Sign-extend from the declared width
            if bytes[width - 1] & 0x80 != 0 {
                for b in buf.iter_mut().skip(width) {
                    *b = 0xFF;
                }
            }
            Ok(Value::Integer(i64::from_le_bytes(buf)))
        }
        Real32 => Ok(Value::Real32(f32::from_le_bytes(bytes.try_into().unwrap()))),
        Real64 => Ok(Value::Real64(f64::from_le_bytes(bytes.try_into().unwrap()))),
        VisibleString => {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            let s = core::str::from_utf8(&bytes[..end]).map_err(|_| CodecError::InvalidString)?;
            Ok(Value::String(s.to_string()))
        }
        UnicodeString => {
            let s = core::str::from_utf8(bytes).map_err(|_| CodecError::InvalidString)?;
            Ok(Value::String(s.to_string()))
        }
        OctetString | Domain => Ok(Value::Bytes(bytes.to_vec())),
        TimeOfDay | TimeDifference => Ok(Value::Time(self::TimeOfDay::from_le_bytes(
            bytes.try_into().unwrap(),
        ))),
        PdoParameter | PdoMapping | SdoParameter | Identity => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_round_trip() {
        for dt in [
            DataType::Unsigned8,
            DataType::Unsigned16,
            DataType::Unsigned24,
            DataType::Unsigned32,
            DataType::Unsigned40,
            DataType::Unsigned48,
            DataType::Unsigned56,
            DataType::Unsigned64,
        ] {
            let width = dt.fixed_size().unwrap();
            let max = if width == 8 {
                u64::MAX
            } else {
                (1u64 << (width * 8)) - 1
            };
            for v in [0u64, 1, max / 2, max] {
                let bytes = encode(&Value::Unsigned(v), dt).unwrap();
                assert_eq!(bytes.len(), width);
                assert_eq!(decode(&bytes, dt).unwrap(), Value::Unsigned(v));
            }
        }
    }

    #[test]
    fn test_signed_round_trip() {
        for dt in [
            DataType::Integer8,
            DataType::Integer16,
            DataType::Integer24,
            DataType::Integer32,
            DataType::Integer40,
            DataType::Integer48,
            DataType::Integer56,
            DataType::Integer64,
        ] {
            let width = dt.fixed_size().unwrap();
            let max: i64 = if width == 8 {
                i64::MAX
            } else {
                (1i64 << (width * 8 - 1)) - 1
            };
            for v in [0i64, 1, -1, max, -max - 1] {
                let bytes = encode(&Value::Integer(v), dt).unwrap();
                assert_eq!(bytes.len(), width);
                assert_eq!(decode(&bytes, dt).unwrap(), Value::Integer(v));
            }
        }
    }

    #[test]
    fn test_integer_truncation() {
        let bytes = encode(&Value::Unsigned(0x1_0000_0001), DataType::Unsigned32).unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_visible_string_nul_trim() {
        let decoded = decode(b"abc\0def", DataType::VisibleString).unwrap();
        assert_eq!(decoded, Value::String("abc".to_string()));
    }

    #[test]
    fn test_time_of_day_layout() {
        // 2 days, 3ms
        let t = TimeOfDay::from_millis(2 * 86_400_000 + 3);
        assert_eq!(t.days, 2);
        assert_eq!(t.millis, 3);
        let bytes = t.to_le_bytes();
        assert_eq!(bytes, [3, 0, 0, 0, 2, 0]);
        assert_eq!(TimeOfDay::from_le_bytes(bytes), t);
    }

    #[test]
    fn test_float_round_trip() {
        let bytes = encode(&Value::Real32(1.5), DataType::Real32).unwrap();
        assert_eq!(decode(&bytes, DataType::Real32).unwrap(), Value::Real32(1.5));

        let bytes = encode(&Value::Real64(-0.25), DataType::Real64).unwrap();
        assert_eq!(
            decode(&bytes, DataType::Real64).unwrap(),
            Value::Real64(-0.25)
        );
    }

    #[test]
    fn test_aggregate_types_reject_scalar_codec() {
        assert!(encode(&Value::Unsigned(0), DataType::Identity).is_err());
        assert!(decode(&[0, 0, 0, 0], DataType::PdoMapping).is_err());
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(decode(&[0, 0, 0], DataType::Unsigned32).is_err());
    }
}
