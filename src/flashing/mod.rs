//! Flashing orchestration.
//!
//! A [`FlashJob`] owns everything produced for one unit: patched images,
//! generated programmer scripts and converted firmware copies. They live in
//! a per-session directory and are removed when the job is dropped,
//! whichever way the run ended.
use std::collections::BTreeSet;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{ValueEnum, builder::PossibleValue};
use serde::{Deserialize, Serialize};

use crate::device::DeviceDescriptor;
use crate::eeprom::{self, EepromReader, IdentityTarget};
use crate::error::{Error, Result};
use crate::format::Image;
use crate::identity::{self, ColorPolicy, Identity, Injection};
use crate::runner::{ToolCommand, ToolRunner};

pub use self::jlink::JLinkFlasher;
pub use self::stlink::{Stage, StLinkCommands, StLinkFlasher};

mod jlink;
mod stlink;

/// How failures inside the programming sequence are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Stop at the first failing stage and return its error.
    #[default]
    Strict,
    /// Log failing stages, keep going, report `false`.
    Lenient,
}

/// Every recognised flashing option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlashOptions {
    /// Bootloader image, merged (ST-Link) or loaded at the identity address (J-Link).
    pub bootloader: Option<PathBuf>,
    pub flash_command: Option<ToolCommand>,
    pub unlock_command: Option<ToolCommand>,
    pub lock_command: Option<ToolCommand>,
    pub eeprom_command: Option<ToolCommand>,
    /// Ready-made lock artifact instead of the generated one.
    pub locker: Option<PathBuf>,
    pub unlocker: Option<PathBuf>,
    /// The target is known to be unlocked already.
    pub unlocked: bool,
    /// Directory holding `stm8flash`; looked up on `PATH` when unset.
    pub tool_dir: Option<PathBuf>,
    /// Local openocd scripts with device-specific target overrides.
    pub openocd_scripts: Option<PathBuf>,
    pub programmer_sn: Option<String>,
    pub tries: usize,
    pub timeout_secs: u64,
    /// Root of the per-session artifact directories.
    pub work_dir: PathBuf,
    pub color_policy: ColorPolicy,
    pub error_mode: ErrorMode,
}

impl Default for FlashOptions {
    fn default() -> Self {
        FlashOptions {
            bootloader: None,
            flash_command: None,
            unlock_command: None,
            lock_command: None,
            eeprom_command: None,
            locker: None,
            unlocker: None,
            unlocked: false,
            tool_dir: None,
            openocd_scripts: None,
            programmer_sn: None,
            tries: 1,
            timeout_secs: crate::constants::DEFAULT_COMMAND_TIMEOUT.as_secs(),
            work_dir: std::env::temp_dir().join("idflash"),
            color_policy: ColorPolicy::Tolerant,
            error_mode: ErrorMode::Strict,
        }
    }
}

impl FlashOptions {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let raw = fs::read_to_string(p).map_err(|e| Error::io(p, e))?;
        let options: FlashOptions = serde_yaml::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", p.display(), e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tries == 0 {
            return Err(Error::InvalidConfig("tries must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::InvalidConfig("timeout must be at least 1 second".into()));
        }
        if self.programmer_sn.as_deref().is_some_and(str::is_empty) {
            return Err(Error::InvalidConfig("programmer serial number is empty".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Files and paths belonging to one flashing run.
#[derive(Debug)]
pub struct FlashJob {
    pub device: DeviceDescriptor,
    /// Firmware as handed to the programmer; replaced by patched copies.
    pub firmware: PathBuf,
    pub eeprom: Option<PathBuf>,
    pub bootloader: Option<PathBuf>,
    pub id_address: Option<u32>,
    work_dir: PathBuf,
    artifacts: BTreeSet<PathBuf>,
}

impl FlashJob {
    pub fn new(
        device: DeviceDescriptor,
        firmware: impl Into<PathBuf>,
        bootloader: Option<PathBuf>,
        work_root: &Path,
    ) -> Result<Self> {
        let work_dir = work_root.join(format!("session-{:08x}", rand::random::<u32>()));
        fs::create_dir_all(&work_dir).map_err(|e| Error::io(&work_dir, e))?;
        log::debug!("Session directory {}", work_dir.display());
        Ok(FlashJob {
            device,
            firmware: firmware.into(),
            eeprom: None,
            bootloader,
            id_address: None,
            work_dir,
            artifacts: BTreeSet::new(),
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Path for a new artifact in the session directory, removed with the job.
    pub fn artifact(&mut self, name: &str) -> PathBuf {
        let path = self.work_dir.join(name);
        self.artifacts.insert(path.clone());
        path
    }

    /// Remove `path` with the job.
    pub fn track(&mut self, path: PathBuf) {
        self.artifacts.insert(path);
    }

    pub fn owns(&self, path: &Path) -> bool {
        self.artifacts.contains(path)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Path> {
        self.artifacts.iter().map(PathBuf::as_path)
    }

    pub fn write_image(&mut self, name: &str, image: &Image) -> Result<PathBuf> {
        let path = self.artifact(name);
        image.save(&path)?;
        Ok(path)
    }

    /// Write a generated script unless an earlier stage already produced it.
    pub fn write_script(&mut self, name: &str, lines: &[String]) -> Result<PathBuf> {
        let path = self.artifact(name);
        if !path.is_file() {
            let mut text = lines.join("\n");
            text.push('\n');
            fs::write(&path, text).map_err(|e| Error::io(&path, e))?;
        }
        Ok(path)
    }

    pub fn resolve_id_address(&mut self) -> Result<u32> {
        let address = identity::resolve_id_address(&self.device, &self.firmware)?;
        self.id_address = Some(address);
        Ok(address)
    }
}

impl Drop for FlashJob {
    fn drop(&mut self) {
        for path in &self.artifacts {
            match fs::remove_file(path) {
                Ok(()) => log::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => log::warn!("Cannot remove {}: {}", path.display(), e),
            }
        }
        let _ = fs::remove_dir(&self.work_dir);
    }
}

/// Provision and inject the identity, pointing the job at the patched image.
pub(crate) fn write_identity<R: ToolRunner>(
    runner: &mut R,
    job: &mut FlashJob,
    identity: &Identity,
    policy: ColorPolicy,
    reader: Option<&dyn EepromReader>,
) -> Result<()> {
    let id_address = match job.id_address {
        Some(address) => address,
        None => job.resolve_id_address()?,
    };
    let injection = Injection::new(&job.device, identity, policy)?;
    injection.check(id_address)?;

    let provisioned = eeprom::provision(runner, job, id_address, reader)?;
    let patched = injection.apply(provisioned.image, id_address)?;
    let path = job.write_image(provisioned.target.artifact_name(), &patched)?;
    log::info!(
        "ID {} written at {:#x} into {}",
        hex::encode_upper(identity.bytes()),
        id_address,
        path.display()
    );
    match provisioned.target {
        IdentityTarget::Firmware => job.firmware = path,
        IdentityTarget::Eeprom => job.eeprom = Some(path),
    }
    Ok(())
}

/// The two operations every programmer backend provides.
pub trait Flasher {
    /// Build images, scripts and command lines.
    ///
    /// Fails before any programming command is issued; the only hardware
    /// access allowed here is reading EEPROM.
    fn setup(&mut self) -> Result<()>;

    /// Program the target. `Ok(false)` means a stage failed in lenient mode.
    fn flash(&mut self) -> Result<bool>;

    /// Set up and flash, consuming the flasher so the job's artifacts are
    /// removed on every path out.
    fn run(mut self) -> Result<bool>
    where
        Self: Sized,
    {
        self.setup()?;
        self.flash()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackendKind {
    JLink,
    #[default]
    StLink,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::JLink => f.write_str("JLink"),
            BackendKind::StLink => f.write_str("STLink"),
        }
    }
}

impl ValueEnum for BackendKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[BackendKind::JLink, BackendKind::StLink]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            BackendKind::JLink => Some(PossibleValue::new("jlink").aliases(["JLink", "segger"])),
            BackendKind::StLink => Some(PossibleValue::new("stlink").aliases(["STLink", "STlink"])),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        <BackendKind as ValueEnum>::from_str(s, true).map_err(|_| Error::UnknownBackend(s.to_string()))
    }
}

/// Registry of programmer backends.
pub enum Backend<R: ToolRunner> {
    JLink(JLinkFlasher<R>),
    StLink(StLinkFlasher<R>),
}

impl<R: ToolRunner> Backend<R> {
    pub fn new(
        kind: BackendKind,
        runner: R,
        job: FlashJob,
        identity: Identity,
        options: FlashOptions,
    ) -> Self {
        log::debug!("Using {} backend for {}", kind, job.device);
        match kind {
            BackendKind::JLink => Backend::JLink(JLinkFlasher::new(runner, job, identity, options)),
            BackendKind::StLink => {
                Backend::StLink(StLinkFlasher::new(runner, job, identity, options))
            }
        }
    }

    pub fn by_name(
        name: &str,
        runner: R,
        job: FlashJob,
        identity: Identity,
        options: FlashOptions,
    ) -> Result<Self> {
        Ok(Self::new(name.parse()?, runner, job, identity, options))
    }

    pub fn job(&self) -> &FlashJob {
        match self {
            Backend::JLink(f) => f.job(),
            Backend::StLink(f) => f.job(),
        }
    }
}

impl<R: ToolRunner> Flasher for Backend<R> {
    fn setup(&mut self) -> Result<()> {
        match self {
            Backend::JLink(f) => f.setup(),
            Backend::StLink(f) => f.setup(),
        }
    }

    fn flash(&mut self) -> Result<bool> {
        match self {
            Backend::JLink(f) => f.flash(),
            Backend::StLink(f) => f.flash(),
        }
    }
}
