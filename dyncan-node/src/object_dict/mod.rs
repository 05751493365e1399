//! The runtime-built object dictionary
//!
//! The dictionary is an indexed table of [`DataObject`] entries constructed at
//! runtime, either programmatically or from an EDS file. It underlies every
//! protocol engine: communication parameters are plain entries, and the
//! engines re-read them whenever they change.
//!
//! Mutations go through the dictionary so that changes can be observed: every
//! write which actually changes stored bytes is recorded in an update journal,
//! which [`Device::process`](crate::Device::process) drains once per cycle to
//! re-parse configuration and trigger event-driven PDOs.

mod object;

use std::collections::{BTreeMap, HashMap};

use snafu::Snafu;

use dyncan_common::{
    constants::{index_regions, object_ids},
    lss::LssIdentity,
    messages::{SDO_REQ_BASE, SDO_RESP_BASE},
    objects::{AccessType, ObjectCode, ObjectId},
    sdo::AbortCode,
    types::{CodecError, DataType, Value},
};

pub use object::{DataObject, EntryInfo, ObjectData, ScalarData};

/// The COB-ID pair an SDO client uses to reach a server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdoClientEndpoint {
    /// COB-ID for requests (client to server)
    pub cob_req: u16,
    /// COB-ID for responses (server to client)
    pub cob_resp: u16,
}

/// Errors returned by dictionary operations
#[derive(Debug, Snafu)]
pub enum ObjectDictError {
    /// An entry already exists at the target index
    #[snafu(display("Object {index:04X} already exists"))]
    AlreadyExists {
        /// The conflicting index
        index: u16,
    },
    /// No entry exists at the target index
    #[snafu(display("Object {index:04X} does not exist"))]
    DoesNotExist {
        /// The missing index
        index: u16,
    },
    /// The entry does not hold sub-objects
    #[snafu(display("Object {index:04X} does not support sub-objects"))]
    SubNotSupported {
        /// The target index
        index: u16,
    },
    /// The sub index is outside the entry's sub-object table
    #[snafu(display("Sub index {sub} is out of range for object {index:04X}"))]
    SubOutOfRange {
        /// The target index
        index: u16,
        /// The offending sub index
        sub: u8,
    },
    /// The entry description is inconsistent with its object type
    #[snafu(display("Invalid arguments: {reason}"))]
    InvalidArgs {
        /// What was wrong
        reason: String,
    },
    /// The object cannot be written through the external access surface
    #[snafu(display("Object {index:04X}sub{sub} is not writable"))]
    ReadOnly {
        /// The target index
        index: u16,
        /// The target sub index
        sub: u8,
    },
    /// The written value violates the entry's limits
    #[snafu(display("Value out of range for object {index:04X}sub{sub}"))]
    OutOfRange {
        /// The target index
        index: u16,
        /// The target sub index
        sub: u8,
    },
    /// A value could not be converted to or from its byte representation
    #[snafu(context(false))]
    Codec {
        /// The underlying codec error
        source: CodecError,
    },
}

/// The object dictionary
///
/// Construction always populates the mandatory entries: 0x1000 (Device type),
/// 0x1001 (Error register) and the 0x1018 identity record, plus DEFTYPE
/// entries for the standard fixed-width data types.
#[derive(Debug, Default)]
pub struct ObjectDictionary {
    entries: BTreeMap<u16, DataObject>,
    name_lookup: HashMap<String, Vec<ObjectId>>,
    updates: Vec<ObjectId>,
}

impl ObjectDictionary {
    /// Create a dictionary holding the mandatory entries
    pub fn new() -> Self {
        let mut od = Self {
            entries: BTreeMap::new(),
            name_lookup: HashMap::new(),
            updates: Vec::new(),
        };

        od.add_entry(
            object_ids::DEVICE_TYPE,
            EntryInfo::var("Device type", DataType::Unsigned32, AccessType::Ro),
        )
        .unwrap();
        od.add_entry(
            object_ids::ERROR_REGISTER,
            EntryInfo::var("Error register", DataType::Unsigned8, AccessType::Ro),
        )
        .unwrap();
        od.add_entry(object_ids::IDENTITY, EntryInfo::record("Identity object", 5))
            .unwrap();
        for (sub, name) in [
            (1, "Vendor-ID"),
            (2, "Product code"),
            (3, "Revision number"),
            (4, "Serial number"),
        ] {
            od.add_sub_entry(
                object_ids::IDENTITY,
                sub,
                EntryInfo::var(name, DataType::Unsigned32, AccessType::Ro),
            )
            .unwrap();
        }

        // Type definition entries live at the index matching their type code
        for dt in [
            DataType::Boolean,
            DataType::Integer8,
            DataType::Integer16,
            DataType::Integer32,
            DataType::Unsigned8,
            DataType::Unsigned16,
            DataType::Unsigned32,
            DataType::Real32,
            DataType::VisibleString,
            DataType::OctetString,
            DataType::UnicodeString,
            DataType::TimeOfDay,
            DataType::TimeDifference,
            DataType::Domain,
            DataType::Integer24,
            DataType::Real64,
            DataType::Integer40,
            DataType::Integer48,
            DataType::Integer56,
            DataType::Integer64,
            DataType::Unsigned24,
            DataType::Unsigned40,
            DataType::Unsigned48,
            DataType::Unsigned56,
            DataType::Unsigned64,
        ] {
            let bits = dt.fixed_size().map(|s| s * 8).unwrap_or(0) as u64;
            let mut info = EntryInfo::var(
                format!("{dt:?}"),
                DataType::Unsigned32,
                AccessType::Ro,
            )
            .with_default(Value::Unsigned(bits));
            info.object_type = ObjectCode::DefType;
            od.add_entry(dt.code(), info).unwrap();
        }

        // Journal entries from construction are not interesting to anyone
        od.updates.clear();
        od
    }

    /// Add a new entry to the dictionary
    pub fn add_entry(
        &mut self,
        index: u16,
        info: EntryInfo,
    ) -> Result<&mut DataObject, ObjectDictError> {
        if self.entries.contains_key(&index) {
            return AlreadyExistsSnafu { index }.fail();
        }
        let obj = DataObject::build(index, None, info)?;
        self.name_lookup
            .entry(obj.parameter_name.clone())
            .or_default()
            .push(ObjectId::new(index, 0));
        self.entries.insert(index, obj);
        Ok(self.entries.get_mut(&index).unwrap())
    }

    /// Add a sub-entry to an existing aggregate entry
    ///
    /// Sub 0 is owned by the dictionary (the auto-generated "Max sub-index"
    /// entry) and cannot be replaced.
    pub fn add_sub_entry(
        &mut self,
        index: u16,
        sub: u8,
        info: EntryInfo,
    ) -> Result<&mut DataObject, ObjectDictError> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or_else(|| DoesNotExistSnafu { index }.build())?;
        if !entry.object_type.is_aggregate() {
            return SubNotSupportedSnafu { index }.fail();
        }
        if sub == 0 || sub >= entry.sub_number() {
            return SubOutOfRangeSnafu { index, sub }.fail();
        }
        if entry.sub(sub).is_some() {
            return AlreadyExistsSnafu { index }.fail();
        }
        if !info.object_type.is_scalar() {
            return InvalidArgsSnafu {
                reason: "sub-entries must hold scalar values",
            }
            .fail();
        }
        let obj = DataObject::build(index, Some(sub), info)?;
        self.name_lookup
            .entry(obj.parameter_name.clone())
            .or_default()
            .push(ObjectId::new(index, sub));
        entry.insert_sub(sub, obj);
        Ok(entry.sub_mut(sub).unwrap())
    }

    /// Remove an entry, returning it
    pub fn remove_entry(&mut self, index: u16) -> Result<DataObject, ObjectDictError> {
        let obj = self
            .entries
            .remove(&index)
            .ok_or_else(|| DoesNotExistSnafu { index }.build())?;
        self.unregister_name(&obj.parameter_name, index, 0);
        for sub in 0..obj.sub_number() {
            if let Some(sub_obj) = obj.sub(sub) {
                self.unregister_name(&sub_obj.parameter_name, index, sub);
            }
        }
        Ok(obj)
    }

    /// Remove a sub-entry from an aggregate entry
    pub fn remove_sub_entry(&mut self, index: u16, sub: u8) -> Result<(), ObjectDictError> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or_else(|| DoesNotExistSnafu { index }.build())?;
        if !entry.object_type.is_aggregate() {
            return SubNotSupportedSnafu { index }.fail();
        }
        if sub == 0 || sub >= entry.sub_number() {
            return SubOutOfRangeSnafu { index, sub }.fail();
        }
        let name = match entry.sub(sub) {
            Some(obj) => obj.parameter_name.clone(),
            None => return Ok(()),
        };
        entry.clear_sub(sub);
        self.unregister_name(&name, index, sub);
        Ok(())
    }

    fn unregister_name(&mut self, name: &str, index: u16, sub: u8) {
        if let Some(ids) = self.name_lookup.get_mut(name) {
            ids.retain(|id| !(id.index == index && id.sub == sub));
            if ids.is_empty() {
                self.name_lookup.remove(name);
            }
        }
    }

    /// Get an entry by index
    pub fn get(&self, index: u16) -> Option<&DataObject> {
        self.entries.get(&index)
    }

    /// Get a mutable reference to an entry by index
    ///
    /// Note that mutations made directly through this reference bypass the
    /// update journal; prefer [`Self::set_raw`] / [`Self::set_value`].
    pub fn get_mut(&mut self, index: u16) -> Option<&mut DataObject> {
        self.entries.get_mut(&index)
    }

    /// Get the first entry registered under a parameter name
    pub fn get_by_name(&self, name: &str) -> Option<&DataObject> {
        let id = self.name_lookup.get(name)?.first()?;
        let entry = self.entries.get(&id.index)?;
        if id.sub == 0 && entry.sub_index.is_none() {
            Some(entry)
        } else {
            entry.sub(id.sub)
        }
    }

    /// Get all object ids registered under a parameter name
    pub fn lookup_name(&self, name: &str) -> &[ObjectId] {
        self.name_lookup
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Get a sub-object
    ///
    /// For scalar entries, sub 0 resolves to the entry itself.
    pub fn get_sub(&self, index: u16, sub: u8) -> Option<&DataObject> {
        self.get(index)?.sub(sub)
    }

    /// Iterate over all entries in index order
    pub fn iter(&self) -> impl Iterator<Item = &DataObject> {
        self.entries.values()
    }

    /// Iterate over the indexes within a range
    pub fn indexes_in(
        &self,
        range: core::ops::RangeInclusive<u16>,
    ) -> impl Iterator<Item = u16> + '_ {
        self.entries.range(range).map(|(index, _)| *index)
    }

    /// Replace the raw bytes of a sub-object
    ///
    /// This is the internal mutation surface: access type is not enforced, but
    /// the update journal records the write if the bytes changed.
    pub fn set_raw(&mut self, index: u16, sub: u8, bytes: &[u8]) -> Result<(), ObjectDictError> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or_else(|| DoesNotExistSnafu { index }.build())?;
        let obj = entry
            .sub_mut(sub)
            .ok_or_else(|| SubOutOfRangeSnafu { index, sub }.build())?;
        if obj.set_raw(bytes)? {
            self.updates.push(ObjectId::new(index, sub));
        }
        Ok(())
    }

    /// Encode and store a typed value into a sub-object
    pub fn set_value(&mut self, index: u16, sub: u8, value: &Value) -> Result<(), ObjectDictError> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or_else(|| DoesNotExistSnafu { index }.build())?;
        let obj = entry
            .sub_mut(sub)
            .ok_or_else(|| SubOutOfRangeSnafu { index, sub }.build())?;
        if obj.set_value(value)? {
            self.updates.push(ObjectId::new(index, sub));
        }
        Ok(())
    }

    /// Read the raw bytes of a sub-object
    pub fn read_raw(&self, index: u16, sub: u8) -> Option<&[u8]> {
        self.get_sub(index, sub)?.raw()
    }

    /// Read a sub-object as an unsigned integer, if it holds one
    pub fn read_unsigned(&self, index: u16, sub: u8) -> Option<u64> {
        self.get_sub(index, sub)?.value()?.as_unsigned()
    }

    /// Drain the journal of sub-objects whose bytes changed since the last call
    pub fn take_updates(&mut self) -> Vec<ObjectId> {
        std::mem::take(&mut self.updates)
    }

    /// Returns true if any updates are pending in the journal
    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    /// Resolve the SDO client endpoint for a server node
    ///
    /// Scans the client parameter records (0x1280..0x12FF) for one whose
    /// server-id (sub 3) matches; its sub 1 is the request (client to server)
    /// COB-ID and sub 2 the response COB-ID. When no record matches, the
    /// default endpoint derived from the server node ID is synthesized.
    pub fn sdo_client_endpoint(&self, server_id: u8) -> SdoClientEndpoint {
        for index in self.indexes_in(index_regions::SDO_CLIENT) {
            let Some(mapped_id) = self.read_unsigned(index, 3) else {
                continue;
            };
            if mapped_id as u8 != server_id {
                continue;
            }
            let Some(raw_req) = self.read_unsigned(index, 1) else {
                continue;
            };
            let Some(raw_resp) = self.read_unsigned(index, 2) else {
                continue;
            };
            let mut cob_req = (raw_req & 0x7FF) as u16;
            let mut cob_resp = (raw_resp & 0x7FF) as u16;
            if cob_req & 0xF == 0 && cob_req == SDO_REQ_BASE {
                cob_req |= server_id as u16;
            }
            if cob_resp & 0xF == 0 && cob_resp == SDO_RESP_BASE {
                cob_resp |= server_id as u16;
            }
            return SdoClientEndpoint { cob_req, cob_resp };
        }
        SdoClientEndpoint {
            cob_req: SDO_REQ_BASE | server_id as u16,
            cob_resp: SDO_RESP_BASE | server_id as u16,
        }
    }

    /// Read the identity record (0x1018) as an [`LssIdentity`]
    pub fn identity(&self) -> Option<LssIdentity> {
        let vendor_id = self.read_unsigned(object_ids::IDENTITY, 1)? as u32;
        let product_code = self.read_unsigned(object_ids::IDENTITY, 2)? as u32;
        let revision = self.read_unsigned(object_ids::IDENTITY, 3)? as u32;
        let serial = self.read_unsigned(object_ids::IDENTITY, 4)? as u32;
        Some(LssIdentity::new(
            vendor_id,
            product_code,
            revision,
            serial,
        ))
    }

    /// Read a sub-object through the external (SDO) surface
    ///
    /// Enforces existence and access rules, mapping failures to the abort
    /// codes the SDO server responds with.
    pub fn sdo_read(&self, index: u16, sub: u8) -> Result<Vec<u8>, AbortCode> {
        let entry = self.get(index).ok_or(AbortCode::NoSuchObject)?;
        let obj = entry.sub(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        let scalar = obj.scalar().ok_or(AbortCode::UnsupportedAccess)?;
        if !scalar.access_type.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        Ok(obj.raw().unwrap().to_vec())
    }

    /// Write a sub-object through the external (SDO) surface
    ///
    /// Enforces existence, access, size and limit rules, mapping failures to
    /// the abort codes the SDO server responds with.
    pub fn sdo_write(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(AbortCode::NoSuchObject)?;
        let obj = entry.sub_mut(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        let scalar = obj.scalar().ok_or(AbortCode::UnsupportedAccess)?;
        if !scalar.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        let data_type = scalar.data_type;
        if let Some(expected) = data_type.fixed_size() {
            if data.len() < expected {
                return Err(AbortCode::DataTypeMismatchLengthLow);
            } else if data.len() > expected {
                return Err(AbortCode::DataTypeMismatchLengthHigh);
            }
        }
        // Limit check for numeric types
        if scalar.low_limit.is_some() || scalar.high_limit.is_some() {
            if let Ok(value) = dyncan_common::types::decode(data, data_type) {
                if let Some(v) = value.as_signed() {
                    if let Some(low) = scalar.low_limit.as_ref().and_then(|l| l.as_signed()) {
                        if v < low {
                            return Err(AbortCode::ValueTooLow);
                        }
                    }
                    if let Some(high) = scalar.high_limit.as_ref().and_then(|l| l.as_signed()) {
                        if v > high {
                            return Err(AbortCode::ValueTooHigh);
                        }
                    }
                }
            }
        }
        let changed = obj.set_raw(data).map_err(|_| AbortCode::GeneralError)?;
        if changed {
            self.updates.push(ObjectId::new(index, sub));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_entries() {
        let od = ObjectDictionary::new();
        assert!(od.get(0x1000).is_some());
        assert!(od.get(0x1001).is_some());
        let identity = od.get(0x1018).unwrap();
        assert_eq!(identity.object_type, ObjectCode::Record);
        assert_eq!(identity.sub_number(), 5);
        // Unsigned32 type definition
        let deftype = od.get(0x0007).unwrap();
        assert_eq!(deftype.object_type, ObjectCode::DefType);
        assert_eq!(deftype.value().unwrap().as_unsigned(), Some(32));
    }

    #[test]
    fn test_add_duplicate_entry() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2000,
            EntryInfo::var("Test", DataType::Unsigned32, AccessType::Rw),
        )
        .unwrap();
        let err = od
            .add_entry(
                0x2000,
                EntryInfo::var("Test", DataType::Unsigned32, AccessType::Rw),
            )
            .unwrap_err();
        assert!(matches!(err, ObjectDictError::AlreadyExists { index: 0x2000 }));
    }

    #[test]
    fn test_array_max_sub_index() {
        let mut od = ObjectDictionary::new();
        od.add_entry(0x2100, EntryInfo::array("Test array", 9)).unwrap();
        let entry = od.get(0x2100).unwrap();
        assert_eq!(
            entry.sub(0).unwrap().value().unwrap(),
            Value::Unsigned(8)
        );
        assert!(od.get_sub(0x2100, 9).is_none());
        assert!(od.get_sub(0x2100, 10).is_none());
    }

    #[test]
    fn test_invalid_args() {
        let mut od = ObjectDictionary::new();
        // Missing data type for a VAR
        let info = EntryInfo {
            parameter_name: "Bad".to_string(),
            object_type: ObjectCode::Var,
            access_type: Some(AccessType::Rw),
            ..Default::default()
        };
        assert!(matches!(
            od.add_entry(0x2000, info).unwrap_err(),
            ObjectDictError::InvalidArgs { .. }
        ));

        // sub_number on a VAR
        let info = EntryInfo {
            parameter_name: "Bad".to_string(),
            object_type: ObjectCode::Var,
            data_type: Some(DataType::Unsigned8),
            access_type: Some(AccessType::Rw),
            sub_number: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            od.add_entry(0x2000, info).unwrap_err(),
            ObjectDictError::InvalidArgs { .. }
        ));

        // Inverted limits
        let info = EntryInfo::var("Bad", DataType::Integer16, AccessType::Rw)
            .with_limits(Some(Value::Integer(10)), Some(Value::Integer(5)));
        assert!(matches!(
            od.add_entry(0x2000, info).unwrap_err(),
            ObjectDictError::InvalidArgs { .. }
        ));
    }

    #[test]
    fn test_update_journal_suppression() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2000,
            EntryInfo::var("Counter", DataType::Unsigned32, AccessType::Rw),
        )
        .unwrap();

        od.set_value(0x2000, 0, &Value::Unsigned(5)).unwrap();
        assert_eq!(od.take_updates(), vec![ObjectId::new(0x2000, 0)]);

        // Same bytes again: no journal entry
        od.set_value(0x2000, 0, &Value::Unsigned(5)).unwrap();
        assert!(od.take_updates().is_empty());

        od.set_value(0x2000, 0, &Value::Unsigned(6)).unwrap();
        assert_eq!(od.take_updates(), vec![ObjectId::new(0x2000, 0)]);
    }

    #[test]
    fn test_name_lookup() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2000,
            EntryInfo::var("Speed", DataType::Unsigned16, AccessType::Rw),
        )
        .unwrap();
        od.add_entry(
            0x2001,
            EntryInfo::var("Speed", DataType::Unsigned16, AccessType::Rw),
        )
        .unwrap();

        assert_eq!(od.lookup_name("Speed").len(), 2);
        assert_eq!(od.get_by_name("Speed").unwrap().index, 0x2000);

        od.remove_entry(0x2000).unwrap();
        assert_eq!(od.lookup_name("Speed").len(), 1);
        assert_eq!(od.get_by_name("Speed").unwrap().index, 0x2001);
    }

    #[test]
    fn test_sdo_access_rules() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2000,
            EntryInfo::var("ReadOnly", DataType::Unsigned8, AccessType::Ro),
        )
        .unwrap();
        od.add_entry(
            0x2001,
            EntryInfo::var("WriteOnly", DataType::Unsigned8, AccessType::Wo),
        )
        .unwrap();

        assert_eq!(od.sdo_write(0x2000, 0, &[1]), Err(AbortCode::ReadOnly));
        assert_eq!(od.sdo_read(0x2001, 0), Err(AbortCode::WriteOnly));
        assert_eq!(od.sdo_read(0x9999, 0), Err(AbortCode::NoSuchObject));
        assert_eq!(od.sdo_write(0x2001, 0, &[1]), Ok(()));
        // Internal reads are not access-gated
        assert_eq!(od.read_raw(0x2001, 0), Some(&[1u8][..]));
    }

    #[test]
    fn test_sdo_write_size_validation() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2000,
            EntryInfo::var("Test", DataType::Unsigned32, AccessType::Rw),
        )
        .unwrap();
        assert_eq!(
            od.sdo_write(0x2000, 0, &[1, 2]),
            Err(AbortCode::DataTypeMismatchLengthLow)
        );
        assert_eq!(
            od.sdo_write(0x2000, 0, &[1, 2, 3, 4, 5]),
            Err(AbortCode::DataTypeMismatchLengthHigh)
        );
        assert_eq!(od.sdo_write(0x2000, 0, &[1, 2, 3, 4]), Ok(()));
    }

    #[test]
    fn test_sdo_write_limits() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2000,
            EntryInfo::var("Limited", DataType::Unsigned8, AccessType::Rw)
                .with_limits(Some(Value::Unsigned(5)), Some(Value::Unsigned(10))),
        )
        .unwrap();
        assert_eq!(od.sdo_write(0x2000, 0, &[4]), Err(AbortCode::ValueTooLow));
        assert_eq!(od.sdo_write(0x2000, 0, &[11]), Err(AbortCode::ValueTooHigh));
        assert_eq!(od.sdo_write(0x2000, 0, &[7]), Ok(()));
    }

    #[test]
    fn test_sdo_client_endpoint_resolution() {
        let mut od = ObjectDictionary::new();
        // Unmapped server id synthesizes the default endpoint
        assert_eq!(
            od.sdo_client_endpoint(0x10),
            SdoClientEndpoint {
                cob_req: 0x610,
                cob_resp: 0x590
            }
        );

        // A client parameter record with explicit COB-IDs takes precedence
        od.add_entry(0x1280, EntryInfo::record("SDO client parameter", 4))
            .unwrap();
        od.add_sub_entry(
            0x1280,
            1,
            EntryInfo::var("COB-ID client to server", DataType::Unsigned32, AccessType::Rw)
                .with_default(Value::Unsigned(0x6E1)),
        )
        .unwrap();
        od.add_sub_entry(
            0x1280,
            2,
            EntryInfo::var("COB-ID server to client", DataType::Unsigned32, AccessType::Rw)
                .with_default(Value::Unsigned(0x6E2)),
        )
        .unwrap();
        od.add_sub_entry(
            0x1280,
            3,
            EntryInfo::var("Node-ID of the SDO server", DataType::Unsigned8, AccessType::Rw)
                .with_default(Value::Unsigned(0x10)),
        )
        .unwrap();
        assert_eq!(
            od.sdo_client_endpoint(0x10),
            SdoClientEndpoint {
                cob_req: 0x6E1,
                cob_resp: 0x6E2
            }
        );
        // Other server ids still fall back to the default
        assert_eq!(
            od.sdo_client_endpoint(0x11),
            SdoClientEndpoint {
                cob_req: 0x611,
                cob_resp: 0x591
            }
        );
    }

    #[test]
    fn test_sub_entry_management() {
        let mut od = ObjectDictionary::new();
        od.add_entry(0x2100, EntryInfo::array("Errors", 4)).unwrap();
        od.add_sub_entry(
            0x2100,
            1,
            EntryInfo::var("Error 1", DataType::Unsigned32, AccessType::Rw),
        )
        .unwrap();

        assert!(od.get_sub(0x2100, 1).is_some());
        assert!(od.get_sub(0x2100, 2).is_none());

        // Out of range
        assert!(matches!(
            od.add_sub_entry(
                0x2100,
                4,
                EntryInfo::var("Bad", DataType::Unsigned32, AccessType::Rw)
            )
            .unwrap_err(),
            ObjectDictError::SubOutOfRange { .. }
        ));

        // Sub entries on a VAR are not supported
        od.add_entry(
            0x2200,
            EntryInfo::var("Plain", DataType::Unsigned8, AccessType::Rw),
        )
        .unwrap();
        assert!(matches!(
            od.add_sub_entry(
                0x2200,
                1,
                EntryInfo::var("Bad", DataType::Unsigned8, AccessType::Rw)
            )
            .unwrap_err(),
            ObjectDictError::SubNotSupported { .. }
        ));

        od.remove_sub_entry(0x2100, 1).unwrap();
        assert!(od.get_sub(0x2100, 1).is_none());
    }
}
