//! Device models, processor definitions and the built-in catalog.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{self, ProcessorProfile};
use crate::error::{Error, Result};

/// Processor family, decides tool selection and identity byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    /// 8-bit STM8L
    Stm8,
    /// 32-bit Cortex-M STM32
    Stm32,
    /// TI CC13xx wireless SoC
    Cc,
}

/// Order in which identity bytes are stored relative to the hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Forward,
    Reversed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Processor {
    #[serde(rename = "stm8l151?6")]
    Stm8l151x6,
    #[serde(rename = "stm8l151?8")]
    Stm8l151x8,
    #[serde(rename = "stm32f1x")]
    Stm32f1x,
    #[serde(rename = "stm32f4x")]
    Stm32f4x,
    #[serde(rename = "stm32l0")]
    Stm32l0,
    #[serde(rename = "stm32u5x")]
    Stm32u5x,
    #[serde(rename = "cc1310")]
    Cc1310,
    #[serde(rename = "cc1352")]
    Cc1352,
}

impl Processor {
    /// Code used on the programmer command lines.
    pub const fn code(self) -> &'static str {
        match self {
            Processor::Stm8l151x6 => "stm8l151?6",
            Processor::Stm8l151x8 => "stm8l151?8",
            Processor::Stm32f1x => "stm32f1x",
            Processor::Stm32f4x => "stm32f4x",
            Processor::Stm32l0 => "stm32l0",
            Processor::Stm32u5x => "stm32u5x",
            Processor::Cc1310 => "cc1310",
            Processor::Cc1352 => "cc1352",
        }
    }

    pub const fn kind(self) -> ProcessorKind {
        match self {
            Processor::Stm8l151x6 | Processor::Stm8l151x8 => ProcessorKind::Stm8,
            Processor::Stm32f1x | Processor::Stm32f4x | Processor::Stm32l0 | Processor::Stm32u5x => {
                ProcessorKind::Stm32
            }
            Processor::Cc1310 | Processor::Cc1352 => ProcessorKind::Cc,
        }
    }

    /// Identity bytes go in little-endian on Cortex-M parts.
    pub const fn id_byte_order(self) -> ByteOrder {
        match self.kind() {
            ProcessorKind::Stm32 => ByteOrder::Reversed,
            ProcessorKind::Stm8 | ProcessorKind::Cc => ByteOrder::Forward,
        }
    }

    pub const fn profile(self) -> &'static ProcessorProfile {
        match self {
            Processor::Stm8l151x6 => &constants::STM8L151X6,
            Processor::Stm8l151x8 => &constants::STM8L151X8,
            Processor::Stm32f1x | Processor::Stm32f4x | Processor::Stm32u5x => {
                &constants::STM32_GENERIC
            }
            Processor::Stm32l0 => &constants::STM32L0,
            Processor::Cc1310 => &constants::CC1310,
            Processor::Cc1352 => &constants::CC1352,
        }
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Intrusion,
    SmartHome,
    Sirens,
    Fire,
    Other,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Intrusion,
        Category::SmartHome,
        Category::Sirens,
        Category::Fire,
        Category::Other,
    ];
}

/// Product line and category, used for grouping and display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Radio(Category),
    Fibra(Category),
}

impl Family {
    pub fn category(self) -> Category {
        match self {
            Family::Radio(c) | Family::Fibra(c) => c,
        }
    }
}

/// Hardware type byte, fixed or chosen by hardware variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HardwareType {
    Fixed(#[serde(deserialize_with = "parse_byte")] u8),
    PerVariant(#[serde(deserialize_with = "parse_byte_map")] BTreeMap<String, u8>),
}

/// Static description of a device model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    /// Display suffix, e.g. a board revision.
    #[serde(default)]
    pub add_name: String,
    pub processor: Processor,
    pub family: Family,
    /// Taken from the firmware file name when absent.
    #[serde(default, deserialize_with = "parse_opt_address")]
    pub id_address: Option<u32>,
    #[serde(default)]
    pub hardware_type: Option<HardwareType>,
    #[serde(default, deserialize_with = "parse_opt_byte")]
    pub subtype: Option<u8>,
    #[serde(default, deserialize_with = "parse_opt_address")]
    pub subtype_address: Option<u32>,
    #[serde(default = "default_subtype_offset")]
    pub subtype_offset: u32,
    #[serde(default = "default_colors")]
    pub possible_colors: Vec<u8>,
    /// Devices flashed without a per-unit identity.
    #[serde(default = "default_true")]
    pub provision_identity: bool,
}

fn default_subtype_offset() -> u32 {
    constants::DEFAULT_SUBTYPE_OFFSET
}

fn default_colors() -> Vec<u8> {
    vec![1, 2]
}

fn default_true() -> bool {
    true
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, processor: Processor, family: Family) -> Self {
        DeviceDescriptor {
            name: name.into(),
            add_name: String::new(),
            processor,
            family,
            id_address: None,
            hardware_type: None,
            subtype: None,
            subtype_address: None,
            subtype_offset: constants::DEFAULT_SUBTYPE_OFFSET,
            possible_colors: default_colors(),
            provision_identity: true,
        }
    }

    /// Resolve the hardware type byte for an optional variant name.
    pub fn hardware_type_for(&self, variant: Option<&str>) -> Result<Option<u8>> {
        match (&self.hardware_type, variant) {
            (None, _) => Ok(None),
            (Some(HardwareType::Fixed(b)), _) => Ok(Some(*b)),
            (Some(HardwareType::PerVariant(map)), Some(v)) => map.get(v).copied().map(Some).ok_or_else(|| {
                Error::InvalidIdentity(format!(
                    "{} has no hardware variant '{}' (known: {:?})",
                    self.name,
                    v,
                    map.keys().collect::<Vec<_>>()
                ))
            }),
            (Some(HardwareType::PerVariant(map)), None) => Err(Error::InvalidIdentity(format!(
                "{} needs a hardware variant, one of {:?}",
                self.name,
                map.keys().collect::<Vec<_>>()
            ))),
        }
    }

    pub fn is_full_erase_eeprom(&self) -> bool {
        constants::FULL_ERASE_EEPROM_DEVICES.contains(&self.name.as_str())
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} ({})", self.name, self.add_name, self.processor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    category: Category,
    devices: Vec<DeviceDescriptor>,
}

pub struct DeviceDb {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceDb {
    pub fn load() -> Result<Self> {
        let files = [
            include_str!("../devices/intrusion.yaml"),
            include_str!("../devices/smart_home.yaml"),
            include_str!("../devices/sirens.yaml"),
            include_str!("../devices/fire.yaml"),
            include_str!("../devices/other.yaml"),
        ];
        let mut devices = vec![];
        for raw in files {
            let file: CatalogFile =
                serde_yaml::from_str(raw).map_err(|e| Error::InvalidConfig(e.to_string()))?;
            let mut group = file.devices;
            if let Some(d) = group.iter().find(|d| d.family.category() != file.category) {
                return Err(Error::InvalidConfig(format!(
                    "{} listed under {:?} but belongs to {:?}",
                    d.name,
                    file.category,
                    d.family.category()
                )));
            }
            group.sort_by(|a, b| a.name.cmp(&b.name));
            devices.extend(group);
        }
        Ok(DeviceDb { devices })
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn category(&self, category: Category) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices
            .iter()
            .filter(move |d| d.family.category() == category)
    }

    pub fn find(&self, name: &str) -> Result<DeviceDescriptor> {
        let device = self
            .devices
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))?;
        log::debug!("Find device: {}", device);
        Ok(device)
    }
}

/// Parse `0x`-prefixed hex or plain decimal.
pub fn parse_number(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("error while parsing {:?}: {}", s, e))
    } else {
        s.parse().map_err(|e| format!("error while parsing {:?}: {}", s, e))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u32),
    String(String),
}

impl NumberOrString {
    fn value(self) -> std::result::Result<u32, String> {
        match self {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::String(s) => parse_number(&s),
        }
    }
}

fn to_byte(n: u32) -> std::result::Result<u8, String> {
    u8::try_from(n).map_err(|_| format!("{:#x} does not fit in a byte", n))
}

fn parse_opt_address<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v: Option<NumberOrString> = Deserialize::deserialize(deserializer)?;
    v.map(NumberOrString::value)
        .transpose()
        .map_err(serde::de::Error::custom)
}

fn parse_opt_byte<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v: Option<NumberOrString> = Deserialize::deserialize(deserializer)?;
    v.map(|n| n.value().and_then(to_byte))
        .transpose()
        .map_err(serde::de::Error::custom)
}

fn parse_byte<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v: NumberOrString = Deserialize::deserialize(deserializer)?;
    v.value().and_then(to_byte).map_err(serde::de::Error::custom)
}

fn parse_byte_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: BTreeMap<String, NumberOrString> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| v.value().and_then(to_byte).map(|b| (k, b)))
        .collect::<std::result::Result<_, _>>()
        .map_err(serde::de::Error::custom)
}
