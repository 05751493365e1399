//! EDS (Electronic Data Sheet) file support
//!
//! Loads and saves object dictionaries in the INI-style EDS v4.0 format
//! defined by CiA 306. Loading produces a [`dyncan_node::ObjectDictionary`]
//! plus the file and device metadata; saving writes a canonical form with
//! CRLF line endings and a deterministic section order, so that
//! `save(load(x))` is a fixed point.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use configparser::ini::Ini;
use snafu::{OptionExt, ResultExt, Snafu};

use dyncan_common::{
    objects::{AccessType, ObjectCode},
    types::{DataType, Value},
};
use dyncan_node::{DataObject, EntryInfo, ObjectDictionary};

type IniMap = HashMap<String, HashMap<String, Option<String>>>;

/// Errors which can occur while loading an EDS file
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// The INI text could not be parsed
    #[snafu(display("INI format error: {message}"))]
    IniFormatError {
        /// Parser message
        message: String,
    },
    /// The file does not follow the EDS format
    #[snafu(display("EDS format error: {message}"))]
    EdsFormatError {
        /// What was wrong
        message: String,
    },
    /// An integer field failed to parse
    #[snafu(display("{message}"))]
    ParseIntError {
        /// Which field, in which section
        message: String,
        /// The underlying error
        source: std::num::ParseIntError,
    },
    /// The file could not be read
    #[snafu(display("IO error reading EDS file"))]
    Io {
        /// The underlying error
        source: std::io::Error,
    },
    /// An entry was inconsistent with the dictionary rules
    #[snafu(display("Object {index:04X}: {source}"))]
    Object {
        /// The offending entry
        index: u16,
        /// The dictionary error
        source: dyncan_node::ObjectDictError,
    },
}

/// The `[FileInfo]` section
#[derive(Clone, Debug, Default, PartialEq)]
#[allow(missing_docs)]
pub struct FileInfo {
    pub file_name: String,
    pub file_version: u32,
    pub file_revision: u32,
    pub eds_version: String,
    pub description: String,
    pub creation_time: String,
    pub creation_date: String,
    pub created_by: String,
    pub modification_time: String,
    pub modification_date: String,
    pub modified_by: String,
}

/// The `[DeviceInfo]` section
#[derive(Clone, Debug, Default, PartialEq)]
#[allow(missing_docs)]
pub struct DeviceInfo {
    pub vendor_name: String,
    pub vendor_number: Option<u32>,
    pub product_name: String,
    pub product_number: Option<u32>,
    pub revision_number: u32,
    pub baud_rate_10: bool,
    pub baud_rate_20: bool,
    pub baud_rate_50: bool,
    pub baud_rate_125: bool,
    pub baud_rate_250: bool,
    pub baud_rate_500: bool,
    pub baud_rate_800: bool,
    pub baud_rate_1000: bool,
    pub simple_boot_up_master: bool,
    pub simple_boot_up_slave: bool,
    pub granularity: u32,
    pub rpdo_count: u32,
    pub tpdo_count: u32,
    pub lss_supported: bool,
}

/// A parsed EDS file: dictionary plus metadata
#[derive(Debug)]
pub struct EdsFile {
    /// The `[FileInfo]` metadata
    pub file_info: FileInfo,
    /// The `[DeviceInfo]` metadata
    pub device_info: DeviceInfo,
    /// The `[DummyUsage]` section, passed through untouched
    pub dummy_usage: BTreeMap<String, String>,
    /// The `[Comments]` section, passed through untouched
    pub comments: BTreeMap<String, String>,
    /// The object dictionary described by the file
    pub od: ObjectDictionary,
}

impl Default for EdsFile {
    fn default() -> Self {
        Self {
            file_info: FileInfo {
                eds_version: "4.0".to_string(),
                ..Default::default()
            },
            device_info: DeviceInfo::default(),
            dummy_usage: BTreeMap::new(),
            comments: BTreeMap::new(),
            od: ObjectDictionary::new(),
        }
    }
}

/// Accessor over one INI section with typed field readers
struct Section<'a> {
    map: &'a HashMap<String, Option<String>>,
    section: String,
}

trait ParseHex {
    fn parse_hex(&self) -> Result<u32, std::num::ParseIntError>;
}

impl<T: AsRef<str>> ParseHex for T {
    fn parse_hex(&self) -> Result<u32, std::num::ParseIntError> {
        let s = self.as_ref();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse(),
        }
    }
}

impl<'a> Section<'a> {
    fn from_map(map: &'a IniMap, section: &str) -> Result<Self, LoadError> {
        let section_map = map.get(&section.to_lowercase()).with_context(|| {
            EdsFormatSnafu {
                message: format!("Missing required section '{}'", section),
            }
        })?;
        Ok(Self {
            map: section_map,
            section: section.to_string(),
        })
    }

    fn get_string_opt(&self, field: &str) -> Option<String> {
        self.map
            .get(&field.to_lowercase())
            .and_then(|v| v.clone())
            .filter(|v| !v.is_empty())
    }

    fn get_string(&self, field: &str) -> Result<String, LoadError> {
        self.get_string_opt(field).with_context(|| {
            EdsFormatSnafu {
                message: format!("Missing required field '{}' in '{}'", field, self.section),
            }
        })
    }

    fn get_u32(&self, field: &str) -> Result<u32, LoadError> {
        self.get_string(field)?.parse().context(ParseIntSnafu {
            message: format!("Parsing '{}' in section '{}'", field, self.section),
        })
    }

    fn get_u32_hex(&self, field: &str) -> Result<u32, LoadError> {
        self.get_string(field)?.parse_hex().context(ParseIntSnafu {
            message: format!("Parsing '{}' in section '{}'", field, self.section),
        })
    }

    fn get_u32_hex_opt(&self, field: &str) -> Result<Option<u32>, LoadError> {
        match self.get_string_opt(field) {
            Some(value) => Ok(Some(value.parse_hex().context(ParseIntSnafu {
                message: format!("Parsing '{}' in section '{}'", field, self.section),
            })?)),
            None => Ok(None),
        }
    }

    fn get_u32_opt(&self, field: &str) -> Result<Option<u32>, LoadError> {
        match self.get_string_opt(field) {
            Some(value) => Ok(Some(value.parse().context(ParseIntSnafu {
                message: format!("Parsing '{}' in section '{}'", field, self.section),
            })?)),
            None => Ok(None),
        }
    }

    fn get_bool(&self, field: &str) -> Result<bool, LoadError> {
        // Booleans are stored as 0 or 1
        Ok(self.get_u32_opt(field)?.unwrap_or(0) == 1)
    }
}

fn str_to_access_type(s: &str) -> Result<AccessType, LoadError> {
    AccessType::parse(s).with_context(|| {
        EdsFormatSnafu {
            message: format!("Invalid AccessType: '{}'", s),
        }
    })
}

/// Parse a DefaultValue / LowLimit / HighLimit string by the entry's data type
fn parse_value(s: &str, data_type: DataType) -> Option<Value> {
    if s.is_empty() {
        return None;
    }
    if data_type.is_unsigned() {
        s.parse_hex().ok().map(|v| Value::Unsigned(v as u64))
    } else if data_type.is_signed() {
        if let Ok(v) = s.parse::<i64>() {
            Some(Value::Integer(v))
        } else {
            s.parse_hex().ok().map(|v| Value::Integer(v as i64))
        }
    } else {
        match data_type {
            DataType::Real32 => s.parse::<f32>().ok().map(Value::Real32),
            DataType::Real64 => s.parse::<f64>().ok().map(Value::Real64),
            DataType::VisibleString | DataType::UnicodeString => {
                Some(Value::String(s.to_string()))
            }
            DataType::OctetString | DataType::Domain => {
                Some(Value::Bytes(s.as_bytes().to_vec()))
            }
            _ => None,
        }
    }
}

/// Format a value in the canonical EDS form
fn format_value(value: &Value) -> String {
    match value {
        Value::Boolean(b) => format!("{}", *b as u8),
        Value::Unsigned(v) => format!("0x{v:X}"),
        Value::Integer(v) => format!("{v}"),
        Value::Real32(v) => format!("{v}"),
        Value::Real64(v) => format!("{v}"),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Time(t) => format!("0x{:X}", t.total_millis()),
    }
}

fn scalar_info_from_section(
    section: &Section,
    object_type: ObjectCode,
    name: String,
) -> Result<EntryInfo, LoadError> {
    let data_type = section
        .get_u32_hex_opt("DataType")?
        .and_then(|code| DataType::from_code(code as u16))
        .unwrap_or(DataType::Unsigned32);
    let access_type = match section.get_string_opt("AccessType") {
        Some(s) => str_to_access_type(&s)?,
        None => AccessType::Rw,
    };
    let mut info = EntryInfo {
        parameter_name: name,
        object_type,
        data_type: Some(data_type),
        access_type: Some(access_type),
        pdo_mapping: section.get_bool("PDOMapping")?,
        ..Default::default()
    };
    if let Some(s) = section.get_string_opt("DefaultValue") {
        info.default_value = parse_value(&s, data_type);
    }
    if let Some(s) = section.get_string_opt("LowLimit") {
        info.low_limit = parse_value(&s, data_type);
    }
    if let Some(s) = section.get_string_opt("HighLimit") {
        info.high_limit = parse_value(&s, data_type);
    }
    Ok(info)
}

fn load_object(map: &IniMap, od: &mut ObjectDictionary, index: u16) -> Result<(), LoadError> {
    let obj_section = Section::from_map(map, &format!("{index:x}"))?;
    let parameter_name = obj_section.get_string("ParameterName")?;
    let object_type = obj_section
        .get_u32_hex_opt("ObjectType")?
        .and_then(|code| ObjectCode::try_from(code as u8).ok())
        .unwrap_or(ObjectCode::Var);
    let sub_number = obj_section.get_u32_hex_opt("SubNumber")?.unwrap_or(0);

    // The fresh dictionary pre-populates mandatory and DEFTYPE entries; the
    // file is authoritative for anything it defines
    let _ = od.remove_entry(index);

    if sub_number == 0 && !object_type.is_aggregate() {
        let info = scalar_info_from_section(&obj_section, object_type, parameter_name)?;
        od.add_entry(index, info).context(ObjectSnafu { index })?;
        return Ok(());
    }

    // Aggregate: find the defined sub sections to size the table. SubNumber
    // counts defined subs, which may be sparse (e.g. subs 0,1,2,6).
    let mut defined_subs = Vec::new();
    for sub in 0u8..=255 {
        if map.contains_key(&format!("{index:x}sub{sub:x}")) {
            defined_subs.push(sub);
        }
    }
    let max_sub = defined_subs.iter().copied().max().unwrap_or(0);

    let info = EntryInfo {
        parameter_name,
        object_type: if object_type.is_aggregate() {
            object_type
        } else {
            ObjectCode::Record
        },
        sub_number: Some(max_sub + 1),
        ..Default::default()
    };
    od.add_entry(index, info).context(ObjectSnafu { index })?;

    for sub in defined_subs {
        let sub_section = Section::from_map(map, &format!("{index:x}sub{sub:x}"))?;
        let sub_name = sub_section.get_string("ParameterName")?;
        if sub == 0 {
            // Sub 0 is owned by the dictionary; only its stored value is taken
            // from the file
            if let Some(s) = sub_section.get_string_opt("DefaultValue") {
                if let Some(Value::Unsigned(v)) = parse_value(&s, DataType::Unsigned8) {
                    od.set_raw(index, 0, &[v as u8]).ok();
                }
            }
            continue;
        }
        let info = scalar_info_from_section(&sub_section, ObjectCode::Var, sub_name)?;
        od.add_sub_entry(index, sub, info)
            .context(ObjectSnafu { index })?;
    }
    Ok(())
}

fn load_object_list(
    map: &IniMap,
    od: &mut ObjectDictionary,
    list_name: &str,
) -> Result<(), LoadError> {
    let Ok(top_section) = Section::from_map(map, list_name) else {
        return Ok(());
    };
    let num_objects = top_section.get_u32("SupportedObjects")?;
    for i in 1..=num_objects {
        let index = top_section.get_u32_hex(&i.to_string())? as u16;
        load_object(map, od, index)?;
    }
    Ok(())
}

fn pass_through_section(map: &IniMap, name: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(section) = map.get(&name.to_lowercase()) {
        for (key, value) in section {
            out.insert(key.clone(), value.clone().unwrap_or_default());
        }
    }
    out
}

impl EdsFile {
    /// Parse an EDS file from text
    #[allow(clippy::should_implement_trait)]
    pub fn from_str<S: Into<String>>(text: S) -> Result<Self, LoadError> {
        let mut config = Ini::new();
        let map = config
            .read(text.into())
            .map_err(|e| IniFormatSnafu { message: e }.build())?;
        Self::from_config_map(&map)
    }

    /// Load an EDS file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path).context(IoSnafu)?;
        Self::from_str(text)
    }

    fn from_config_map(map: &IniMap) -> Result<Self, LoadError> {
        let file_info_cfg = Section::from_map(map, "FileInfo")?;
        let file_info = FileInfo {
            file_name: file_info_cfg.get_string_opt("FileName").unwrap_or_default(),
            file_version: file_info_cfg.get_u32_opt("FileVersion")?.unwrap_or(1),
            file_revision: file_info_cfg.get_u32_opt("FileRevision")?.unwrap_or(1),
            eds_version: file_info_cfg
                .get_string_opt("EDSVersion")
                .unwrap_or_else(|| "4.0".to_string()),
            description: file_info_cfg
                .get_string_opt("Description")
                .unwrap_or_default(),
            creation_time: file_info_cfg
                .get_string_opt("CreationTime")
                .unwrap_or_default(),
            creation_date: file_info_cfg
                .get_string_opt("CreationDate")
                .unwrap_or_default(),
            created_by: file_info_cfg
                .get_string_opt("CreatedBy")
                .unwrap_or_default(),
            modification_time: file_info_cfg
                .get_string_opt("ModificationTime")
                .unwrap_or_default(),
            modification_date: file_info_cfg
                .get_string_opt("ModificationDate")
                .unwrap_or_default(),
            modified_by: file_info_cfg
                .get_string_opt("ModifiedBy")
                .unwrap_or_default(),
        };

        let di_cfg = Section::from_map(map, "DeviceInfo")?;
        let device_info = DeviceInfo {
            vendor_name: di_cfg.get_string_opt("VendorName").unwrap_or_default(),
            vendor_number: di_cfg.get_u32_opt("VendorNumber")?,
            product_name: di_cfg.get_string_opt("ProductName").unwrap_or_default(),
            product_number: di_cfg.get_u32_opt("ProductNumber")?,
            revision_number: di_cfg.get_u32_opt("RevisionNumber")?.unwrap_or(0),
            baud_rate_10: di_cfg.get_bool("BaudRate_10")?,
            baud_rate_20: di_cfg.get_bool("BaudRate_20")?,
            baud_rate_50: di_cfg.get_bool("BaudRate_50")?,
            baud_rate_125: di_cfg.get_bool("BaudRate_125")?,
            baud_rate_250: di_cfg.get_bool("BaudRate_250")?,
            baud_rate_500: di_cfg.get_bool("BaudRate_500")?,
            baud_rate_800: di_cfg.get_bool("BaudRate_800")?,
            baud_rate_1000: di_cfg.get_bool("BaudRate_1000")?,
            simple_boot_up_master: di_cfg.get_bool("SimpleBootUpMaster")?,
            simple_boot_up_slave: di_cfg.get_bool("SimpleBootUpSlave")?,
            granularity: di_cfg.get_u32_opt("Granularity")?.unwrap_or(8),
            rpdo_count: di_cfg.get_u32_opt("NrOfRXPDO")?.unwrap_or(0),
            tpdo_count: di_cfg.get_u32_opt("NrOfTXPDO")?.unwrap_or(0),
            lss_supported: di_cfg.get_bool("LSS_Supported")?,
        };

        let mut od = ObjectDictionary::new();
        load_object_list(map, &mut od, "MandatoryObjects")?;
        load_object_list(map, &mut od, "OptionalObjects")?;
        load_object_list(map, &mut od, "ManufacturerObjects")?;
        od.take_updates();

        Ok(EdsFile {
            file_info,
            device_info,
            dummy_usage: pass_through_section(map, "DummyUsage"),
            comments: pass_through_section(map, "Comments"),
            od,
        })
    }

    /// Serialize to the canonical EDS text form
    ///
    /// Sections are written in a fixed order with CRLF line endings.
    pub fn save(&self) -> String {
        let mut out = String::new();
        let fi = &self.file_info;
        write_section(&mut out, "FileInfo", &[
            ("FileName", fi.file_name.clone()),
            ("FileVersion", fi.file_version.to_string()),
            ("FileRevision", fi.file_revision.to_string()),
            ("EDSVersion", fi.eds_version.clone()),
            ("Description", fi.description.clone()),
            ("CreationTime", fi.creation_time.clone()),
            ("CreationDate", fi.creation_date.clone()),
            ("CreatedBy", fi.created_by.clone()),
            ("ModificationTime", fi.modification_time.clone()),
            ("ModificationDate", fi.modification_date.clone()),
            ("ModifiedBy", fi.modified_by.clone()),
        ]);

        let di = &self.device_info;
        write_section(&mut out, "DeviceInfo", &[
            ("VendorName", di.vendor_name.clone()),
            (
                "VendorNumber",
                di.vendor_number.map(|v| v.to_string()).unwrap_or_default(),
            ),
            ("ProductName", di.product_name.clone()),
            (
                "ProductNumber",
                di.product_number.map(|v| v.to_string()).unwrap_or_default(),
            ),
            ("RevisionNumber", di.revision_number.to_string()),
            ("BaudRate_10", (di.baud_rate_10 as u8).to_string()),
            ("BaudRate_20", (di.baud_rate_20 as u8).to_string()),
            ("BaudRate_50", (di.baud_rate_50 as u8).to_string()),
            ("BaudRate_125", (di.baud_rate_125 as u8).to_string()),
            ("BaudRate_250", (di.baud_rate_250 as u8).to_string()),
            ("BaudRate_500", (di.baud_rate_500 as u8).to_string()),
            ("BaudRate_800", (di.baud_rate_800 as u8).to_string()),
            ("BaudRate_1000", (di.baud_rate_1000 as u8).to_string()),
            (
                "SimpleBootUpMaster",
                (di.simple_boot_up_master as u8).to_string(),
            ),
            (
                "SimpleBootUpSlave",
                (di.simple_boot_up_slave as u8).to_string(),
            ),
            ("Granularity", di.granularity.to_string()),
            ("NrOfRXPDO", di.rpdo_count.to_string()),
            ("NrOfTXPDO", di.tpdo_count.to_string()),
            ("LSS_Supported", (di.lss_supported as u8).to_string()),
        ]);

        write_bag(&mut out, "DummyUsage", &self.dummy_usage);
        write_bag(&mut out, "Comments", &self.comments);

        const MANDATORY: [u16; 3] = [0x1000, 0x1001, 0x1018];
        let mandatory: Vec<u16> = MANDATORY
            .iter()
            .copied()
            .filter(|i| self.od.get(*i).is_some())
            .collect();
        let optional: Vec<u16> = self
            .od
            .iter()
            .map(|o| o.index)
            .filter(|i| {
                !MANDATORY.contains(i)
                    && ((0x1000..=0x1FFF).contains(i) || (0x6000..=0xFFFF).contains(i))
            })
            .collect();
        let manufacturer: Vec<u16> = self
            .od
            .iter()
            .map(|o| o.index)
            .filter(|i| (0x2000..=0x5FFF).contains(i))
            .collect();

        write_object_list(&mut out, "MandatoryObjects", &mandatory, &self.od);
        write_object_list(&mut out, "OptionalObjects", &optional, &self.od);
        write_object_list(&mut out, "ManufacturerObjects", &manufacturer, &self.od);

        out
    }

    /// Write the canonical EDS text form to a file
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, self.save())
    }
}

fn write_section(out: &mut String, name: &str, fields: &[(&str, String)]) {
    let _ = write!(out, "[{name}]\r\n");
    for (key, value) in fields {
        let _ = write!(out, "{key}={value}\r\n");
    }
    let _ = write!(out, "\r\n");
}

fn write_bag(out: &mut String, name: &str, bag: &BTreeMap<String, String>) {
    let _ = write!(out, "[{name}]\r\n");
    for (key, value) in bag {
        let _ = write!(out, "{key}={value}\r\n");
    }
    let _ = write!(out, "\r\n");
}

fn write_object_list(out: &mut String, name: &str, indexes: &[u16], od: &ObjectDictionary) {
    let _ = write!(out, "[{name}]\r\n");
    let _ = write!(out, "SupportedObjects={}\r\n", indexes.len());
    for (i, index) in indexes.iter().enumerate() {
        let _ = write!(out, "{}=0x{index:04X}\r\n", i + 1);
    }
    let _ = write!(out, "\r\n");

    for index in indexes {
        if let Some(entry) = od.get(*index) {
            write_entry(out, entry);
        }
    }
}

fn write_scalar_fields(out: &mut String, obj: &DataObject) {
    let scalar = obj.scalar().expect("scalar entry");
    let _ = write!(out, "DataType=0x{:04X}\r\n", scalar.data_type.code());
    let _ = write!(out, "AccessType={}\r\n", scalar.access_type.as_str());
    let default = obj.value().map(|v| format_value(&v)).unwrap_or_default();
    let _ = write!(out, "DefaultValue={default}\r\n");
    let _ = write!(out, "PDOMapping={}\r\n", scalar.pdo_mapping as u8);
    if let Some(low) = &scalar.low_limit {
        let _ = write!(out, "LowLimit={}\r\n", format_value(low));
    }
    if let Some(high) = &scalar.high_limit {
        let _ = write!(out, "HighLimit={}\r\n", format_value(high));
    }
}

fn write_entry(out: &mut String, entry: &DataObject) {
    let index = entry.index;
    let _ = write!(out, "[{index:x}]\r\n");
    let _ = write!(out, "ParameterName={}\r\n", entry.parameter_name);
    let _ = write!(out, "ObjectType=0x{:X}\r\n", entry.object_type as u8);
    if entry.is_scalar() {
        write_scalar_fields(out, entry);
        let _ = write!(out, "\r\n");
        return;
    }

    let populated: Vec<u8> = (0..entry.sub_number())
        .filter(|sub| entry.sub(*sub).is_some())
        .collect();
    let _ = write!(out, "SubNumber=0x{:X}\r\n", populated.len());
    let _ = write!(out, "\r\n");

    for sub in populated {
        let sub_obj = entry.sub(sub).unwrap();
        let _ = write!(out, "[{index:x}sub{sub:x}]\r\n");
        let _ = write!(out, "ParameterName={}\r\n", sub_obj.parameter_name);
        let _ = write!(out, "ObjectType=0x{:X}\r\n", sub_obj.object_type as u8);
        write_scalar_fields(out, sub_obj);
        let _ = write!(out, "\r\n");
    }
}
