//! Choosing where the identity lives, and fetching the image it goes into.
use std::path::Path;

use crate::constants::{EEPROM_ID_THRESHOLD, FULL_ERASE_EEPROM_WINDOW};
use crate::device::Processor;
use crate::error::{Error, Result};
use crate::flashing::FlashJob;
use crate::format::Image;
use crate::runner::{ToolCommand, ToolRunner};

/// Image the identity is written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityTarget {
    Firmware,
    Eeprom,
}

impl IdentityTarget {
    pub fn for_address(id_address: u32) -> Self {
        if id_address >= EEPROM_ID_THRESHOLD {
            IdentityTarget::Firmware
        } else {
            IdentityTarget::Eeprom
        }
    }

    /// File name of the patched image handed to the programmer.
    pub fn artifact_name(self) -> &'static str {
        match self {
            IdentityTarget::Firmware => "firmware_to_flash.hex",
            IdentityTarget::Eeprom => "eeprom_to_flash.hex",
        }
    }
}

/// A programmer able to dump the target's EEPROM into an Intel HEX file.
pub trait EepromReader {
    fn read_eeprom_command(&self, processor: Processor, output: &Path) -> ToolCommand;
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub image: Image,
    pub target: IdentityTarget,
}

/// Load the image the identity will be written into.
///
/// For EEPROM identities this reads the attached target, unless the device
/// gets a freshly zeroed EEPROM.
pub fn provision<R: ToolRunner>(
    runner: &mut R,
    job: &mut FlashJob,
    id_address: u32,
    reader: Option<&dyn EepromReader>,
) -> Result<Provisioned> {
    let target = IdentityTarget::for_address(id_address);
    if target == IdentityTarget::Firmware {
        return Ok(Provisioned {
            image: Image::load(&job.firmware)?,
            target,
        });
    }

    if job.device.is_full_erase_eeprom() {
        let mut image = Image::new();
        image.fill(FULL_ERASE_EEPROM_WINDOW, 0);
        log::info!("Load empty eeprom");
        return Ok(Provisioned { image, target });
    }

    let reader = reader.ok_or(Error::UnsupportedProcessor {
        processor: job.device.processor.code(),
        backend: "EEPROM read",
    })?;
    let dump = job.artifact("eeprom.hex");
    let command = reader.read_eeprom_command(job.device.processor, &dump);
    log::info!("{}", command);
    let out = runner.execute(&command)?;
    if !out.success() {
        return Err(Error::EepromReadFailure {
            command,
            code: out.code,
            output: out.output,
        });
    }
    Ok(Provisioned {
        image: Image::load(&dump)?,
        target,
    })
}
