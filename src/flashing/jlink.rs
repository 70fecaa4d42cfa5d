//! SEGGER J-Link backend: everything runs from one J-Link Commander script.
//!
//! Commands: <https://wiki.segger.com/J-Link_Commander>
use std::path::{Path, PathBuf};

use super::{ErrorMode, FlashJob, FlashOptions, Flasher, write_identity};
use crate::constants::ProcessorProfile;
use crate::device::Processor;
use crate::eeprom::IdentityTarget;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::runner::{ToolCommand, ToolRunner};

const BACKEND: &str = "J-Link";

pub struct JLinkFlasher<R: ToolRunner> {
    runner: R,
    job: FlashJob,
    identity: Identity,
    options: FlashOptions,
    command_file: Option<PathBuf>,
}

/// cJTAG session for CC13xx: load firmware (and bootloader), then zero the
/// CCFG lock fields.
pub fn cc_script(
    profile: &ProcessorProfile,
    device: &str,
    firmware: &Path,
    bootloader: Option<(&Path, u32)>,
) -> Vec<String> {
    let mut lines = vec![
        "SelectInterface cJTAG".to_string(),
        "JTAGConf -1 -1".to_string(),
        "Speed 1000".to_string(),
        format!("Device {}", device),
        "Reset".to_string(),
        "Halt".to_string(),
        format!("loadfile {}", firmware.display()),
    ];
    if let Some((bootloader, address)) = bootloader {
        lines.push(format!("loadfile {} {:#x}", bootloader.display(), address));
    }
    for register in profile.lock_registers {
        lines.push(format!("w1 {:08X} 00", register));
    }
    lines.push("Exit".to_string());
    lines
}

/// SWD session for STM32L0: mass erase, load, then program the option word.
pub fn stm32l_script(profile: &ProcessorProfile, device: &str, firmware: &Path) -> Vec<String> {
    let mut lines = vec![
        "SelectInterface SWD".to_string(),
        "Speed 1000".to_string(),
        format!("Device {}", device),
        // reset, halt, erase (unlocks)
        "r".to_string(),
        "h".to_string(),
        "erase".to_string(),
        format!("loadfile {}", firmware.display()),
    ];
    if let Some((address, value)) = profile.option_word {
        lines.push(format!("w4 0x{:08X} 0x{:08X}", address, value));
    }
    lines.push("r".to_string());
    lines.push("Exit".to_string());
    lines
}

impl<R: ToolRunner> JLinkFlasher<R> {
    pub fn new(runner: R, job: FlashJob, identity: Identity, options: FlashOptions) -> Self {
        JLinkFlasher {
            runner,
            job,
            identity,
            options,
            command_file: None,
        }
    }

    pub fn job(&self) -> &FlashJob {
        &self.job
    }

    pub fn command_file(&self) -> Option<&Path> {
        self.command_file.as_deref()
    }

    fn unsupported(&self) -> Error {
        Error::UnsupportedProcessor {
            processor: self.job.device.processor.code(),
            backend: BACKEND,
        }
    }

    pub fn flash_command(&self) -> Result<ToolCommand> {
        if let Some(cmd) = &self.options.flash_command {
            return Ok(cmd.clone());
        }
        let file = self.command_file.as_ref().ok_or_else(|| {
            Error::InvalidConfig("J-Link command file not generated, run setup first".into())
        })?;
        let mut cmd = ToolCommand::new("JLinkExe").args(["-ExitOnError", "1", "-NoGui", "1"]);
        if let Some(sn) = &self.options.programmer_sn {
            cmd = cmd.args(["-USB", sn.as_str()]);
        }
        Ok(cmd.arg("-CommandFile").arg(file.display().to_string()))
    }
}

impl<R: ToolRunner> Flasher for JLinkFlasher<R> {
    fn setup(&mut self) -> Result<()> {
        let processor = self.job.device.processor;
        let profile = processor.profile();
        let device = profile.jlink_device.ok_or_else(|| self.unsupported())?;

        if self.job.device.provision_identity {
            let id_address = self.job.resolve_id_address()?;
            if IdentityTarget::for_address(id_address) == IdentityTarget::Eeprom {
                return Err(Error::InvalidIdentity(format!(
                    "ID address {:#x} is in EEPROM, which the {} backend does not program",
                    id_address, BACKEND
                )));
            }
            write_identity(
                &mut self.runner,
                &mut self.job,
                &self.identity,
                self.options.color_policy,
                None,
            )?;
        }

        let lines = match processor {
            Processor::Cc1310 | Processor::Cc1352 => {
                let bootloader = match (&self.job.bootloader, self.job.id_address) {
                    (Some(path), Some(address)) => Some((path.as_path(), address)),
                    _ => None,
                };
                cc_script(profile, device, &self.job.firmware, bootloader)
            }
            Processor::Stm32l0 => stm32l_script(profile, device, &self.job.firmware),
            _ => return Err(self.unsupported()),
        };
        let name = format!("{}_config.jlink", processor.code());
        self.command_file = Some(self.job.write_script(&name, &lines)?);
        Ok(())
    }

    fn flash(&mut self) -> Result<bool> {
        let cmd = self.flash_command()?;
        let benign = self.job.device.processor.profile().benign_notice;
        match self.runner.run(&cmd, self.options.tries, benign) {
            Ok(_) => Ok(true),
            Err(e) if self.options.error_mode == ErrorMode::Lenient => {
                log::error!("Write failed: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::constants;

    #[test]
    fn cc1310_script_with_bootloader() {
        let lines = cc_script(
            &constants::CC1310,
            "CC1310F128",
            Path::new("/w/firmware_to_flash.hex"),
            Some((Path::new("/w/boot.hex"), 0x1f000)),
        );
        assert_eq!(
            lines,
            vec![
                "SelectInterface cJTAG",
                "JTAGConf -1 -1",
                "Speed 1000",
                "Device CC1310F128",
                "Reset",
                "Halt",
                "loadfile /w/firmware_to_flash.hex",
                "loadfile /w/boot.hex 0x1f000",
                "w1 0001FFD8 00",
                "w1 0001FFE4 00",
                "w1 0001FFE6 00",
                "Exit",
            ]
        );
    }

    #[test]
    fn stm32l_script_writes_option_word() {
        let lines = stm32l_script(&constants::STM32L0, "STM32L051K8 (ALLOW OPT. BYTES)", Path::new("fw.hex"));
        assert_eq!(lines[2], "Device STM32L051K8 (ALLOW OPT. BYTES)");
        assert_eq!(lines[5], "erase");
        assert_eq!(lines[7], "w4 0x1FF80000 0xFF4400BB");
        assert_eq!(lines.last().map(String::as_str), Some("Exit"));
    }
}
