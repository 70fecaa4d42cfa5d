//! Fixed addresses, thresholds and per-processor programming constants.
use std::ops::Range;
use std::time::Duration;

/// Identity addresses below this live in EEPROM, not in code flash.
pub const EEPROM_ID_THRESHOLD: u32 = 0x8000;

/// Devices whose EEPROM is rewritten from scratch instead of read back.
pub const FULL_ERASE_EEPROM_DEVICES: &[&str] = &["LQC_Wireless"];

/// STM8L151 data EEPROM.
pub const FULL_ERASE_EEPROM_WINDOW: Range<u32> = 4096..6144;

pub const HARDWARE_TYPE_OFFSET: u32 = 4;
pub const DEFAULT_SUBTYPE_OFFSET: u32 = 4;

/// Load offsets used when STM32 images arrive as raw binaries.
pub const STM32_BOOTLOADER_OFFSET: u32 = 0x0800_0000;
pub const STM32_APPLICATION_OFFSET: u32 = 0x0802_0000;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Diagnostic emitted by the ST-Link programmers when the flash image
/// contains a record the target has no memory for.
pub const OUT_OF_RANGE_PATTERN: &str = r"Address [a-f,0-9]{1,6} is out of range at line (\d+)";

/// Programming constants that differ between processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorProfile {
    /// Device name passed to `JLinkExe`.
    pub jlink_device: Option<&'static str>,
    /// CCFG fields zeroed to lock the chip against readout.
    pub lock_registers: &'static [u32],
    /// Single 32-bit option word written after loading (address, value).
    pub option_word: Option<(u32, u32)>,
    /// Programmer output that is reported as a failure but is harmless.
    pub benign_notice: Option<&'static str>,
    /// Look for a local openocd target script before the stock one.
    pub openocd_target_override: bool,
    /// Option bytes cleared to set read-out protection (STM8 only).
    pub option_bytes: &'static [u32],
}

const NONE: ProcessorProfile = ProcessorProfile {
    jlink_device: None,
    lock_registers: &[],
    option_word: None,
    benign_notice: None,
    openocd_target_override: false,
    option_bytes: &[],
};

pub const STM8L151X6: ProcessorProfile = ProcessorProfile {
    option_bytes: &[0x4800, 0x4802, 0x4808, 0x4809, 0x480a, 0x480b, 0x480c],
    ..NONE
};

pub const STM8L151X8: ProcessorProfile = ProcessorProfile {
    option_bytes: &[0x4800, 0x4802, 0x4807, 0x4808, 0x4809, 0x480a, 0x480b, 0x480c],
    ..NONE
};

pub const STM32_GENERIC: ProcessorProfile = NONE;

pub const STM32L0: ProcessorProfile = ProcessorProfile {
    jlink_device: Some("STM32L051K8 (ALLOW OPT. BYTES)"),
    option_word: Some((0x1ff8_0000, 0xff44_00bb)),
    benign_notice: Some("Unable to match requested speed 300 kHz, using 240 kHz"),
    openocd_target_override: true,
    ..NONE
};

pub const CC1310: ProcessorProfile = ProcessorProfile {
    jlink_device: Some("CC1310F128"),
    lock_registers: &[0x0001_ffd8, 0x0001_ffe4, 0x0001_ffe6],
    ..NONE
};

pub const CC1352: ProcessorProfile = ProcessorProfile {
    jlink_device: Some("CC1352R1F3"),
    lock_registers: &[0x0005_7fe4, 0x0005_7fe8, 0x0005_7fd8],
    ..NONE
};
