//! Per-unit identity and its placement in an image.
use std::path::Path;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::HARDWARE_TYPE_OFFSET;
use crate::device::{ByteOrder, DeviceDescriptor};
use crate::error::{Error, Result};
use crate::format::Image;

static ID_ADDRESS_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"0x([0-9A-Fa-f]+)").expect("static regex")
});

/// What to do with a color outside the device's color set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorPolicy {
    /// Log it and write it anyway.
    #[default]
    Tolerant,
    /// Reject the identity.
    Strict,
}

/// Serial number and attributes written into one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    id: Vec<u8>,
    pub color: Option<u8>,
    pub hardware_variant: Option<String>,
}

impl Identity {
    /// Parse a 6 or 8 digit hex serial, e.g. `"1ABC2D"`.
    pub fn parse(id: &str) -> Result<Self> {
        let id = id.trim();
        if id.len() != 6 && id.len() != 8 {
            return Err(Error::InvalidIdentity(format!(
                "device ID must be 3 or 4 bytes (6 or 8 hex digits), got {:?}",
                id
            )));
        }
        let id = hex::decode(id)
            .map_err(|e| Error::InvalidIdentity(format!("device ID {:?}: {}", id, e)))?;
        Ok(Identity {
            id,
            color: None,
            hardware_variant: None,
        })
    }

    pub fn with_color(mut self, color: Option<u8>) -> Self {
        self.color = color;
        self
    }

    pub fn with_hardware_variant(mut self, variant: Option<String>) -> Self {
        self.hardware_variant = variant;
        self
    }

    /// ID bytes as written in the hex string.
    pub fn bytes(&self) -> &[u8] {
        &self.id
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Identity::parse(s)
    }
}

/// Find the `0x...` identity address token in a firmware file name.
pub fn id_address_from_name(firmware: &Path) -> Result<u32> {
    let name = firmware
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    let caps = ID_ADDRESS_TOKEN.captures(&name).ok_or_else(|| {
        Error::InvalidIdentity(format!("no ID address in firmware name {:?}", name))
    })?;
    u32::from_str_radix(&caps[1], 16)
        .map_err(|e| Error::InvalidIdentity(format!("ID address in {:?}: {}", name, e)))
}

pub fn resolve_id_address(device: &DeviceDescriptor, firmware: &Path) -> Result<u32> {
    match device.id_address {
        Some(address) => Ok(address),
        None => id_address_from_name(firmware),
    }
}

/// A validated identity ready to be written into images of one device.
#[derive(Debug, Clone)]
pub struct Injection {
    id: Vec<u8>,
    hardware_type: Option<u8>,
    /// Explicit address, if any, and value.
    subtype: Option<(Option<u32>, u8)>,
    subtype_offset: u32,
    color: Option<u8>,
}

struct Layout {
    hardware_type: Option<u32>,
    subtype: Option<u32>,
    color: Option<u32>,
}

impl Injection {
    pub fn new(device: &DeviceDescriptor, identity: &Identity, policy: ColorPolicy) -> Result<Self> {
        let hardware_type = device.hardware_type_for(identity.hardware_variant.as_deref())?;

        if let Some(color) = identity.color {
            if !device.possible_colors.contains(&color) {
                match policy {
                    ColorPolicy::Tolerant => log::error!(
                        "Color must be one of {:?}, writing {} anyway",
                        device.possible_colors,
                        color
                    ),
                    ColorPolicy::Strict => {
                        return Err(Error::InvalidIdentity(format!(
                            "color {} is not one of {:?} for {}",
                            color, device.possible_colors, device.name
                        )));
                    }
                }
            }
        }

        let mut id = identity.bytes().to_vec();
        if device.processor.id_byte_order() == ByteOrder::Reversed {
            id.reverse();
        }

        Ok(Injection {
            id,
            hardware_type,
            subtype: device.subtype.map(|s| (device.subtype_address, s)),
            subtype_offset: device.subtype_offset,
            color: identity.color,
        })
    }

    /// Addresses this identity occupies when placed at `id_address`.
    ///
    /// Fails when any of them falls past the end of the 32-bit address space.
    fn layout(&self, id_address: u32) -> Result<Layout> {
        let at = |offset: u64| {
            u32::try_from(u64::from(id_address) + offset).map_err(|_| {
                Error::InvalidIdentity(format!(
                    "ID address {:#x} plus offset {:#x} does not fit in 32 bits",
                    id_address, offset
                ))
            })
        };
        let subtype_offset = u64::from(self.subtype_offset);

        // 3-byte IDs are padded to 4
        at(3)?;
        let hardware_type = match self.hardware_type {
            Some(_) => Some(at(u64::from(HARDWARE_TYPE_OFFSET))?),
            None => None,
        };
        let subtype = match self.subtype {
            Some((Some(address), _)) => Some(address),
            Some((None, _)) => Some(at(subtype_offset)?),
            None => None,
        };
        let color = match self.color {
            Some(_) => Some(at(subtype_offset + 1)?),
            None => None,
        };
        Ok(Layout {
            hardware_type,
            subtype,
            color,
        })
    }

    /// Check that the identity fits at `id_address` without touching any image.
    pub fn check(&self, id_address: u32) -> Result<()> {
        self.layout(id_address).map(|_| ())
    }

    pub fn apply(&self, mut image: Image, id_address: u32) -> Result<Image> {
        let layout = self.layout(id_address)?;
        image.write(id_address, &self.id);
        if self.id.len() == 3 {
            image.set(id_address + 3, 0x00);
        }
        if let (Some(address), Some(hw)) = (layout.hardware_type, self.hardware_type) {
            image.set(address, hw);
        }
        if let (Some(address), Some((_, subtype))) = (layout.subtype, self.subtype) {
            image.set(address, subtype);
        }
        if let (Some(address), Some(color)) = (layout.color, self.color) {
            image.set(address, color);
        }
        Ok(image)
    }
}

/// Write `identity` into `image` at `id_address` following the device's rules.
pub fn inject(
    image: Image,
    device: &DeviceDescriptor,
    identity: &Identity,
    id_address: u32,
    policy: ColorPolicy,
) -> Result<Image> {
    Injection::new(device, identity, policy)?.apply(image, id_address)
}
