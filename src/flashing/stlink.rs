//! ST-Link backend: `stm8flash` for STM8, openocd for STM32.
//!
//! Programming runs as unlock → flash → EEPROM → lock. When the programmer
//! rejects firmware lines as out of range, those lines are dropped from the
//! image and the flash stage is repeated once.
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ErrorMode, FlashJob, FlashOptions, Flasher, write_identity};
use crate::constants::{
    EEPROM_ID_THRESHOLD, OUT_OF_RANGE_PATTERN, STM32_APPLICATION_OFFSET, STM32_BOOTLOADER_OFFSET,
};
use crate::device::{Processor, ProcessorKind};
use crate::eeprom::EepromReader;
use crate::error::{Error, Result};
use crate::format::{FirmwareFormat, Image, MergePolicy, guess_format};
use crate::identity::Identity;
use crate::runner::{ToolCommand, ToolRunner};

const BACKEND: &str = "ST-Link";

static OUT_OF_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(OUT_OF_RANGE_PATTERN).expect("static regex"));

/// Line numbers the programmer reported as out of range, ascending, deduplicated.
pub fn out_of_range_lines(output: &str) -> Vec<usize> {
    let mut lines: Vec<usize> = OUT_OF_RANGE
        .captures_iter(output)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    lines.sort_unstable();
    lines.dedup();
    lines
}

/// `stm8flash` invocations.
#[derive(Debug, Clone)]
pub struct Stm8Flash {
    program: PathBuf,
    serial: Option<String>,
}

impl Stm8Flash {
    pub fn new(tool_dir: Option<&Path>, serial: Option<String>) -> Self {
        let program = match tool_dir {
            Some(dir) => dir.join("stm8flash"),
            None => PathBuf::from("stm8flash"),
        };
        Stm8Flash { program, serial }
    }

    fn base(&self, processor: Processor) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.program.display().to_string()).args(["-c", "stlinkv2"]);
        if let Some(sn) = &self.serial {
            cmd = cmd.args(["-S", sn.as_str()]);
        }
        cmd.args(["-p", processor.code()])
    }

    pub fn unlock(&self, processor: Processor) -> ToolCommand {
        self.base(processor).arg("-u")
    }

    pub fn write(&self, processor: Processor, section: &str, file: &Path) -> ToolCommand {
        self.base(processor)
            .args(["-s", section, "-w"])
            .arg(file.display().to_string())
    }

    pub fn read(&self, processor: Processor, section: &str, file: &Path) -> ToolCommand {
        self.base(processor)
            .args(["-s", section, "-r"])
            .arg(file.display().to_string())
    }
}

impl EepromReader for Stm8Flash {
    fn read_eeprom_command(&self, processor: Processor, output: &Path) -> ToolCommand {
        self.read(processor, "eeprom", output)
    }
}

/// openocd invocations through an ST-Link adapter.
#[derive(Debug, Clone)]
pub struct OpenOcd {
    interface: String,
    target: String,
}

impl OpenOcd {
    pub fn new(processor: Processor, scripts: Option<&Path>) -> Self {
        let mut target = format!("target/{}.cfg", processor.code());
        if processor.profile().openocd_target_override {
            if let Some(special) = scripts
                .map(|dir| dir.join(&target))
                .filter(|p| p.is_file())
            {
                log::debug!("Using target override {}", special.display());
                target = special.display().to_string();
            }
        }
        OpenOcd {
            interface: "interface/stlink.cfg".to_string(),
            target,
        }
    }

    fn base(&self) -> ToolCommand {
        ToolCommand::new("openocd").args(["-f", self.interface.as_str(), "-f", self.target.as_str()])
    }

    pub fn script(&self, script: &Path) -> ToolCommand {
        self.base().arg("-f").arg(script.display().to_string())
    }

    pub fn flash_image(&self, image: &Path) -> ToolCommand {
        self.base().args([
            "-c".to_string(),
            "init".to_string(),
            "-c".to_string(),
            "reset init".to_string(),
            "-c".to_string(),
            format!("flash write_image erase {}", image.display()),
            "-c".to_string(),
            "reset".to_string(),
            "-c".to_string(),
            "shutdown".to_string(),
        ])
    }
}

/// openocd script running `<driver> unlock 0` or `<driver> lock 0`.
pub fn protection_script(processor: Processor, operation: &str) -> Vec<String> {
    let code = processor.code();
    // stm32l0 -> stm32lx, stm32f1x stays
    let driver = match code.strip_suffix('0') {
        Some(stem) => format!("{}x", stem),
        None => code.to_string(),
    };
    vec![
        "init".to_string(),
        "reset halt".to_string(),
        format!("{} {} 0", driver, operation),
        "reset halt".to_string(),
        "exit".to_string(),
    ]
}

/// Option bytes image enabling STM8 read-out protection, one record per byte.
pub fn stm8_lock_records(processor: Processor) -> Result<String> {
    let mut records: Vec<ihex::Record> = processor
        .profile()
        .option_bytes
        .iter()
        .map(|&address| ihex::Record::Data {
            offset: address as u16,
            value: vec![0x00],
        })
        .collect();
    records.push(ihex::Record::EndOfFile);
    ihex::create_object_file_representation(&records).map_err(|e| Error::Image(e.to_string()))
}

/// Replace `[` and `]` in the file name with a bracket-free copy.
///
/// openocd evaluates `-c` arguments as Tcl, where brackets are command
/// substitution.
pub fn sanitize_brackets(job: &mut FlashJob, path: &Path) -> Result<PathBuf> {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(path.to_path_buf());
    };
    if !name.contains(['[', ']']) {
        return Ok(path.to_path_buf());
    }
    let safe = path.with_file_name(name.replace(['[', ']'], "_"));
    std::fs::copy(path, &safe).map_err(|e| Error::io(&safe, e))?;
    job.track(safe.clone());
    Ok(safe)
}

/// Progress through the programming sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Unlocking,
    Flashing,
    /// Second flash attempt after out-of-range lines were removed.
    RetryFlash,
    WritingEeprom,
    Locking,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StLinkCommands {
    pub unlock: ToolCommand,
    pub flash: ToolCommand,
    pub eeprom: Option<ToolCommand>,
    pub lock: ToolCommand,
}

pub struct StLinkFlasher<R: ToolRunner> {
    runner: R,
    job: FlashJob,
    identity: Identity,
    options: FlashOptions,
    stm8flash: Stm8Flash,
    commands: Option<StLinkCommands>,
    stage: Stage,
}

impl<R: ToolRunner> StLinkFlasher<R> {
    pub fn new(runner: R, job: FlashJob, identity: Identity, options: FlashOptions) -> Self {
        let stm8flash = Stm8Flash::new(options.tool_dir.as_deref(), options.programmer_sn.clone());
        StLinkFlasher {
            runner,
            job,
            identity,
            options,
            stm8flash,
            commands: None,
            stage: Stage::Idle,
        }
    }

    pub fn job(&self) -> &FlashJob {
        &self.job
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn commands(&self) -> Option<&StLinkCommands> {
        self.commands.as_ref()
    }

    fn processor(&self) -> Processor {
        self.job.device.processor
    }

    /// Convert raw binaries to Intel HEX, merging bootloader and application.
    fn prepare_stm32_images(&mut self) -> Result<()> {
        let Some(bootloader) = self.job.bootloader.clone() else {
            let firmware = Image::load_firmware(&self.job.firmware, STM32_BOOTLOADER_OFFSET)?;
            if self.is_binary(&self.job.firmware)? {
                self.job.firmware = self.job.write_image("firmware.hex", &firmware)?;
            }
            return Ok(());
        };

        let boot = Image::load_firmware(&bootloader, STM32_BOOTLOADER_OFFSET)?;
        let app = Image::load_firmware(&self.job.firmware, STM32_APPLICATION_OFFSET)?;
        let mut merged = Image::new();
        merged.merge(&boot, MergePolicy::Error)?;
        merged.merge(&app, MergePolicy::Replace)?;
        log::info!(
            "Merged bootloader {} and firmware {}",
            bootloader.display(),
            self.job.firmware.display()
        );
        self.job.firmware = self.job.write_image("MERGED.hex", &merged)?;
        Ok(())
    }

    fn is_binary(&self, path: &Path) -> Result<bool> {
        let raw = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        Ok(guess_format(path, &raw) == FirmwareFormat::Binary)
    }

    /// The programmer must see a copy this job owns, so out-of-range lines
    /// can be removed without touching the caller's file.
    fn own_firmware(&mut self) -> Result<()> {
        if self.job.owns(&self.job.firmware) {
            return Ok(());
        }
        let base = match self.processor().kind() {
            ProcessorKind::Stm32 => STM32_BOOTLOADER_OFFSET,
            _ => EEPROM_ID_THRESHOLD,
        };
        let image = Image::load_firmware(&self.job.firmware, base)?;
        self.job.firmware = self.job.write_image("firmware_working.hex", &image)?;
        Ok(())
    }

    fn stm8_commands(&mut self) -> Result<StLinkCommands> {
        let processor = self.processor();
        let locker = match &self.options.locker {
            Some(locker) => locker.clone(),
            None => {
                let name = format!(
                    "{}_{}_lock.hex",
                    self.job.device.name,
                    processor.code().replace('?', "_")
                );
                let records = stm8_lock_records(processor)?;
                let lines: Vec<String> = records.lines().map(str::to_string).collect();
                self.job.write_script(&name, &lines)?
            }
        };

        let eeprom = self
            .job
            .eeprom
            .as_ref()
            .map(|file| self.stm8flash.write(processor, "eeprom", file));
        Ok(StLinkCommands {
            unlock: self.stm8flash.unlock(processor),
            flash: self.stm8flash.write(processor, "flash", &self.job.firmware),
            eeprom,
            lock: self.stm8flash.write(processor, "opt", &locker),
        })
    }

    fn stm32_commands(&mut self) -> Result<StLinkCommands> {
        let processor = self.processor();
        let script = |job: &mut FlashJob, given: &Option<PathBuf>, op: &str| -> Result<PathBuf> {
            let path = match given {
                Some(path) => path.clone(),
                None => {
                    let name = format!("{}_{}_{}.cfg", job.device.name, processor.code(), op);
                    job.write_script(&name, &protection_script(processor, op))?
                }
            };
            sanitize_brackets(job, &path)
        };
        let unlocker = script(&mut self.job, &self.options.unlocker, "unlock")?;
        let locker = script(&mut self.job, &self.options.locker, "lock")?;

        let current = self.job.firmware.clone();
        let firmware = sanitize_brackets(&mut self.job, &current)?;
        let firmware = std::path::absolute(&firmware).map_err(|e| Error::io(&firmware, e))?;

        let openocd = OpenOcd::new(processor, self.options.openocd_scripts.as_deref());
        Ok(StLinkCommands {
            unlock: openocd.script(&unlocker),
            flash: openocd.flash_image(&firmware),
            // openocd targets carry no separate EEPROM image
            eeprom: None,
            lock: openocd.script(&locker),
        })
    }

    fn run_tool(&mut self, command: &ToolCommand) -> Result<()> {
        let benign = self.processor().profile().benign_notice;
        self.runner.run(command, self.options.tries, benign)?;
        Ok(())
    }

    fn commands_ref(&self) -> Result<&StLinkCommands> {
        self.commands
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("ST-Link commands not built, run setup first".into()))
    }

    fn unlock(&mut self) -> Result<()> {
        self.stage = Stage::Unlocking;
        if self.options.unlocked {
            log::debug!("Target already unlocked, skipping");
            return Ok(());
        }
        let cmd = self.commands_ref()?.unlock.clone();
        self.run_tool(&cmd)
    }

    fn flash_firmware(&mut self) -> Result<()> {
        self.stage = Stage::Flashing;
        let cmd = self.commands_ref()?.flash.clone();
        let err = match self.run_tool(&cmd) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let bad_lines = err.output().map(out_of_range_lines).unwrap_or_default();
        if bad_lines.is_empty() {
            return Err(err);
        }

        if self.remove_lines(&bad_lines)? == 0 {
            log::error!("No firmware data on line(s) {:?}, not retrying", bad_lines);
            return Err(Error::OutOfRange {
                lines: bad_lines,
                output: err.output().unwrap_or_default().to_string(),
            });
        }
        self.stage = Stage::RetryFlash;
        match self.run_tool(&cmd) {
            Ok(()) => Ok(()),
            Err(e) => {
                let lines = e.output().map(out_of_range_lines).unwrap_or_default();
                if lines.is_empty() {
                    Err(e)
                } else {
                    Err(Error::OutOfRange {
                        lines,
                        output: e.output().unwrap_or_default().to_string(),
                    })
                }
            }
        }
    }

    /// Returns the number of bytes removed.
    fn remove_lines(&mut self, lines: &[usize]) -> Result<usize> {
        let mut image = Image::load(&self.job.firmware)?;
        let mut removed = 0;
        // highest first, so earlier line numbers stay valid
        for &line in lines.iter().rev() {
            log::info!("Bad line {} in firmware file, delete it", line);
            removed += image.remove_line(line);
        }
        if removed > 0 {
            image.save(&self.job.firmware)?;
        }
        Ok(removed)
    }

    fn write_eeprom(&mut self) -> Result<()> {
        self.stage = Stage::WritingEeprom;
        let Some(cmd) = self.commands_ref()?.eeprom.clone() else {
            log::debug!("No EEPROM image, skipping");
            return Ok(());
        };
        self.run_tool(&cmd)
    }

    fn lock(&mut self) -> Result<()> {
        self.stage = Stage::Locking;
        let cmd = self.commands_ref()?.lock.clone();
        self.run_tool(&cmd)
    }

    fn settle(&self, result: Result<()>) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(e) if self.options.error_mode == ErrorMode::Lenient => {
                log::error!("{:?} failed: {}", self.stage, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl<R: ToolRunner> Flasher for StLinkFlasher<R> {
    fn setup(&mut self) -> Result<()> {
        let kind = self.processor().kind();
        if kind == ProcessorKind::Cc {
            return Err(Error::UnsupportedProcessor {
                processor: self.processor().code(),
                backend: BACKEND,
            });
        }

        if self.job.device.provision_identity {
            self.job.resolve_id_address()?;
            if kind == ProcessorKind::Stm32 {
                self.prepare_stm32_images()?;
            }
            let reader = (kind == ProcessorKind::Stm8).then_some(&self.stm8flash as &dyn EepromReader);
            write_identity(
                &mut self.runner,
                &mut self.job,
                &self.identity,
                self.options.color_policy,
                reader,
            )?;
        } else {
            log::info!("{} carries no identity, flashing as is", self.job.device.name);
        }
        self.own_firmware()?;

        let mut commands = match kind {
            ProcessorKind::Stm8 => self.stm8_commands()?,
            _ => self.stm32_commands()?,
        };
        if let Some(cmd) = &self.options.unlock_command {
            commands.unlock = cmd.clone();
        }
        if let Some(cmd) = &self.options.flash_command {
            commands.flash = cmd.clone();
        }
        if let Some(cmd) = &self.options.lock_command {
            commands.lock = cmd.clone();
        }
        if let (Some(cmd), Some(_)) = (&self.options.eeprom_command, &self.job.eeprom) {
            commands.eeprom = Some(cmd.clone());
        }
        self.commands = Some(commands);
        Ok(())
    }

    fn flash(&mut self) -> Result<bool> {
        let mut ok = true;
        let r = self.unlock();
        ok &= self.settle(r)?;
        let r = self.flash_firmware();
        ok &= self.settle(r)?;
        let r = self.write_eeprom();
        ok &= self.settle(r)?;
        let r = self.lock();
        ok &= self.settle(r)?;
        self.stage = Stage::Done;
        Ok(ok)
    }
}
