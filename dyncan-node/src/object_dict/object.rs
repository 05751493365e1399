//! The DataObject entry type

use dyncan_common::{
    objects::{AccessType, ObjectCode},
    types::{decode, encode, DataType, Value},
};

use super::{InvalidArgsSnafu, ObjectDictError};

/// Describes an entry to be added to the dictionary
///
/// This is the argument bag for [`ObjectDictionary::add_entry`] and
/// [`ObjectDictionary::add_sub_entry`]. Which fields are required or allowed
/// depends on `object_type`; validation happens when the entry is built.
///
/// [`ObjectDictionary::add_entry`]: super::ObjectDictionary::add_entry
/// [`ObjectDictionary::add_sub_entry`]: super::ObjectDictionary::add_sub_entry
#[derive(Clone, Debug, Default)]
pub struct EntryInfo {
    /// Human readable name for the entry. Must not be empty.
    pub parameter_name: String,
    /// The object code determining the shape of the entry
    pub object_type: ObjectCode,
    /// Data type. Required for scalar object types, disallowed for aggregates.
    pub data_type: Option<DataType>,
    /// Access type. Required for scalar object types, disallowed for aggregates.
    pub access_type: Option<AccessType>,
    /// Optional lower value limit
    pub low_limit: Option<Value>,
    /// Optional upper value limit
    pub high_limit: Option<Value>,
    /// Whether the entry may be mapped into a PDO
    pub pdo_mapping: bool,
    /// Initial value for the entry
    pub default_value: Option<Value>,
    /// Number of sub-objects, including sub 0. Required for aggregate object
    /// types, disallowed for scalars.
    pub sub_number: Option<u8>,
}

impl EntryInfo {
    /// Describe a VAR entry
    pub fn var<S: Into<String>>(name: S, data_type: DataType, access_type: AccessType) -> Self {
        Self {
            parameter_name: name.into(),
            object_type: ObjectCode::Var,
            data_type: Some(data_type),
            access_type: Some(access_type),
            ..Default::default()
        }
    }

    /// Describe a DOMAIN entry
    pub fn domain<S: Into<String>>(name: S, access_type: AccessType) -> Self {
        Self {
            parameter_name: name.into(),
            object_type: ObjectCode::Domain,
            data_type: Some(DataType::Domain),
            access_type: Some(access_type),
            ..Default::default()
        }
    }

    /// Describe an ARRAY entry with `sub_number` sub-objects (including sub 0)
    pub fn array<S: Into<String>>(name: S, sub_number: u8) -> Self {
        Self {
            parameter_name: name.into(),
            object_type: ObjectCode::Array,
            sub_number: Some(sub_number),
            ..Default::default()
        }
    }

    /// Describe a RECORD entry with `sub_number` sub-objects (including sub 0)
    pub fn record<S: Into<String>>(name: S, sub_number: u8) -> Self {
        Self {
            parameter_name: name.into(),
            object_type: ObjectCode::Record,
            sub_number: Some(sub_number),
            ..Default::default()
        }
    }

    /// Set the initial value
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Set value limits
    pub fn with_limits(mut self, low: Option<Value>, high: Option<Value>) -> Self {
        self.low_limit = low;
        self.high_limit = high;
        self
    }

    /// Mark the entry as mappable into PDOs
    pub fn mappable(mut self) -> Self {
        self.pdo_mapping = true;
        self
    }
}

/// The scalar payload of a VAR, DEFTYPE or DOMAIN entry
#[derive(Clone, Debug)]
pub struct ScalarData {
    /// The data type of the stored value
    pub data_type: DataType,
    /// Allowed accesses via the SDO surface
    pub access_type: AccessType,
    /// Whether the entry may be mapped into a PDO
    pub pdo_mapping: bool,
    /// Optional lower value limit
    pub low_limit: Option<Value>,
    /// Optional upper value limit
    pub high_limit: Option<Value>,
    /// The configured initial value
    pub default_value: Option<Value>,
    raw: Vec<u8>,
}

/// The payload of a dictionary entry: either a scalar value or a table of
/// sub-objects
#[derive(Clone, Debug)]
pub enum ObjectData {
    /// A single stored value
    Scalar(ScalarData),
    /// A dense table of sub-objects. Slot 0 is the auto-generated
    /// "Max sub-index" entry; other slots may be unpopulated.
    Aggregate(Vec<Option<DataObject>>),
}

/// A single entry (or sub-entry) of the object dictionary
///
/// A DataObject exclusively owns its raw value buffer (scalars) or its
/// sub-object table (aggregates).
#[derive(Clone, Debug)]
pub struct DataObject {
    /// The object index
    pub index: u16,
    /// The sub index, for sub-entries of an aggregate
    pub sub_index: Option<u8>,
    /// Human readable name
    pub parameter_name: String,
    /// The object code describing the entry shape
    pub object_type: ObjectCode,
    data: ObjectData,
}

impl DataObject {
    /// Build an entry from an [`EntryInfo`], validating the field rules for
    /// its object type
    pub fn build(
        index: u16,
        sub_index: Option<u8>,
        info: EntryInfo,
    ) -> Result<Self, ObjectDictError> {
        if info.parameter_name.is_empty() {
            return InvalidArgsSnafu {
                reason: "parameter_name must not be empty",
            }
            .fail();
        }

        let data = if info.object_type.is_scalar() {
            if info.sub_number.is_some() {
                return InvalidArgsSnafu {
                    reason: "sub_number is not allowed on scalar objects",
                }
                .fail();
            }
            let data_type = info.data_type.ok_or_else(|| {
                InvalidArgsSnafu {
                    reason: "data_type is required for scalar objects",
                }
                .build()
            })?;
            let access_type = info.access_type.ok_or_else(|| {
                InvalidArgsSnafu {
                    reason: "access_type is required for scalar objects",
                }
                .build()
            })?;
            if let (Some(low), Some(high)) = (&info.low_limit, &info.high_limit) {
                if let (Some(low), Some(high)) = (low.as_signed(), high.as_signed()) {
                    if high < low {
                        return InvalidArgsSnafu {
                            reason: "high_limit must not be below low_limit",
                        }
                        .fail();
                    }
                }
            }
            let raw = match &info.default_value {
                Some(value) => encode(value, data_type).map_err(|e| {
                    InvalidArgsSnafu {
                        reason: format!("default_value does not fit data_type: {e}"),
                    }
                    .build()
                })?,
                None => vec![0; data_type.fixed_size().unwrap_or(0)],
            };
            ObjectData::Scalar(ScalarData {
                data_type,
                access_type: access_type,
                pdo_mapping: info.pdo_mapping,
                low_limit: info.low_limit,
                high_limit: info.high_limit,
                default_value: info.default_value,
                raw,
            })
        } else if info.object_type.is_aggregate() {
            if info.data_type.is_some()
                || info.access_type.is_some()
                || info.low_limit.is_some()
                || info.high_limit.is_some()
                || info.default_value.is_some()
            {
                return InvalidArgsSnafu {
                    reason: "scalar fields are not allowed on aggregate objects",
                }
                .fail();
            }
            let sub_number = info.sub_number.ok_or_else(|| {
                InvalidArgsSnafu {
                    reason: "sub_number is required for aggregate objects",
                }
                .build()
            })?;
            if sub_number == 0 {
                return InvalidArgsSnafu {
                    reason: "sub_number must be at least 1",
                }
                .fail();
            }
            let mut subs: Vec<Option<DataObject>> = vec![None; sub_number as usize];
            subs[0] = Some(DataObject {
                index,
                sub_index: Some(0),
                parameter_name: "Max sub-index".to_string(),
                object_type: ObjectCode::Var,
                data: ObjectData::Scalar(ScalarData {
                    data_type: DataType::Unsigned8,
                    access_type: AccessType::Ro,
                    pdo_mapping: false,
                    low_limit: None,
                    high_limit: None,
                    default_value: Some(Value::Unsigned(sub_number as u64 - 1)),
                    raw: vec![sub_number - 1],
                }),
            });
            ObjectData::Aggregate(subs)
        } else {
            // NULL object: no payload
            ObjectData::Aggregate(Vec::new())
        };

        Ok(DataObject {
            index,
            sub_index,
            parameter_name: info.parameter_name,
            object_type: info.object_type,
            data,
        })
    }

    /// Access the entry payload
    pub fn data(&self) -> &ObjectData {
        &self.data
    }

    /// Returns true if this entry holds a scalar value
    pub fn is_scalar(&self) -> bool {
        matches!(self.data, ObjectData::Scalar(_))
    }

    /// Get the scalar payload, if this entry holds one
    pub fn scalar(&self) -> Option<&ScalarData> {
        match &self.data {
            ObjectData::Scalar(s) => Some(s),
            ObjectData::Aggregate(_) => None,
        }
    }

    pub(crate) fn scalar_mut(&mut self) -> Option<&mut ScalarData> {
        match &mut self.data {
            ObjectData::Scalar(s) => Some(s),
            ObjectData::Aggregate(_) => None,
        }
    }

    /// Number of sub-object slots (including sub 0). Zero for scalars.
    pub fn sub_number(&self) -> u8 {
        match &self.data {
            ObjectData::Scalar(_) => 0,
            ObjectData::Aggregate(subs) => subs.len() as u8,
        }
    }

    /// Get a sub-object
    ///
    /// For scalar entries sub 0 resolves to the entry itself.
    pub fn sub(&self, sub: u8) -> Option<&DataObject> {
        match &self.data {
            ObjectData::Scalar(_) => (sub == 0).then_some(self),
            ObjectData::Aggregate(subs) => subs.get(sub as usize)?.as_ref(),
        }
    }

    pub(crate) fn sub_mut(&mut self, sub: u8) -> Option<&mut DataObject> {
        if matches!(self.data, ObjectData::Scalar(_)) {
            return (sub == 0).then_some(self);
        }
        match &mut self.data {
            ObjectData::Aggregate(subs) => subs.get_mut(sub as usize)?.as_mut(),
            ObjectData::Scalar(_) => unreachable!(),
        }
    }

    pub(crate) fn insert_sub(&mut self, sub: u8, obj: DataObject) {
        if let ObjectData::Aggregate(subs) = &mut self.data {
            subs[sub as usize] = Some(obj);
        }
    }

    pub(crate) fn clear_sub(&mut self, sub: u8) {
        if let ObjectData::Aggregate(subs) = &mut self.data {
            subs[sub as usize] = None;
        }
    }

    /// The raw value bytes, for scalar entries
    pub fn raw(&self) -> Option<&[u8]> {
        self.scalar().map(|s| s.raw.as_slice())
    }

    /// The decoded value, for scalar entries
    pub fn value(&self) -> Option<Value> {
        let scalar = self.scalar()?;
        decode(&scalar.raw, scalar.data_type).ok()
    }

    /// The data type, for scalar entries
    pub fn data_type(&self) -> Option<DataType> {
        self.scalar().map(|s| s.data_type)
    }

    /// The access type, for scalar entries
    pub fn access_type(&self) -> Option<AccessType> {
        self.scalar().map(|s| s.access_type)
    }

    /// Replace the raw value bytes
    ///
    /// Returns true if the stored bytes actually changed. This is the internal
    /// mutation surface; access type is not enforced here.
    pub(crate) fn set_raw(&mut self, bytes: &[u8]) -> Result<bool, ObjectDictError> {
        let index = self.index;
        let scalar = self.scalar_mut().ok_or_else(|| {
            InvalidArgsSnafu {
                reason: format!("object {index:04X} holds no scalar value"),
            }
            .build()
        })?;
        if scalar.raw == bytes {
            return Ok(false);
        }
        scalar.raw.clear();
        scalar.raw.extend_from_slice(bytes);
        Ok(true)
    }

    /// Encode and store a typed value
    ///
    /// Returns true if the stored bytes actually changed.
    pub(crate) fn set_value(&mut self, value: &Value) -> Result<bool, ObjectDictError> {
        let index = self.index;
        let data_type = self
            .data_type()
            .ok_or_else(|| {
                InvalidArgsSnafu {
                    reason: format!("object {index:04X} holds no scalar value"),
                }
                .build()
            })?;
        let bytes = encode(value, data_type)?;
        self.set_raw(&bytes)
    }
}
