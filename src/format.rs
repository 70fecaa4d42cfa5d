//! Firmware and EEPROM image formats.
//!
//! An [`Image`] is a sparse address → byte map. Addresses that were never
//! written are unset, not zero. Images are exchanged with the programmer
//! tools as Intel HEX files; raw binaries can be loaded at a base address.
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;
use std::str;

use ihex::Record;

use crate::error::{Error, Result};

/// Bytes per data record when serializing.
const RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    Binary,
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }
    if ext == "bin" {
        return FirmwareFormat::Binary;
    }

    if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else {
        FirmwareFormat::Binary
    }
}

/// How [`Image::merge`] treats addresses set in both images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Fail on the first overlapping address.
    Error,
    /// The merged-in image wins.
    Replace,
    /// The existing byte is kept.
    Ignore,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    data: BTreeMap<u32, u8>,
}

/// One serialized record and the linear base address in effect for it.
struct Line {
    record: Record,
    base: u32,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ihex(data: &str) -> Result<Self> {
        let mut image = Image::new();
        let mut base_address = 0u32;

        for record in ihex::Reader::new(data) {
            let record = record.map_err(|e| Error::Image(e.to_string()))?;
            use Record::*;
            match record {
                Data { offset, value } => {
                    image.write(base_address.wrapping_add(offset as u32), &value);
                }
                EndOfFile => (),
                ExtendedSegmentAddress(address) => {
                    base_address = (address as u32) * 16;
                }
                StartSegmentAddress { .. } => (),
                ExtendedLinearAddress(address) => {
                    base_address = (address as u32) << 16;
                }
                StartLinearAddress(_) => (),
            };
        }
        Ok(image)
    }

    pub fn from_binary(raw: &[u8], base_address: u32) -> Self {
        let mut image = Image::new();
        image.write(base_address, raw);
        image
    }

    /// Load an Intel HEX file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let raw = std::fs::read_to_string(p).map_err(|e| Error::io(p, e))?;
        Self::from_ihex(&raw)
    }

    /// Load a firmware file, placing raw binaries at `bin_base`.
    pub fn load_firmware<P: AsRef<Path>>(path: P, bin_base: u32) -> Result<Self> {
        let p = path.as_ref();
        let raw = std::fs::read(p).map_err(|e| Error::io(p, e))?;

        let format = guess_format(p, &raw);
        log::info!("Read {} as {:?} format", p.display(), format);
        match format {
            FirmwareFormat::IntelHex => {
                let text = str::from_utf8(&raw).map_err(|e| Error::Image(e.to_string()))?;
                Self::from_ihex(text)
            }
            FirmwareFormat::Binary => Ok(Self::from_binary(&raw, bin_base)),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        let mut text = self.to_ihex()?;
        text.push('\n');
        std::fs::write(p, text).map_err(|e| Error::io(p, e))
    }

    pub fn to_ihex(&self) -> Result<String> {
        let records: Vec<Record> = self.lines().into_iter().map(|l| l.record).collect();
        ihex::create_object_file_representation(&records).map_err(|e| Error::Image(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn start_address(&self) -> Option<u32> {
        self.data.keys().next().copied()
    }

    /// One past the last set address; 64 bits wide so an image ending at
    /// `0xFFFF_FFFF` still has an end.
    pub fn end_address(&self) -> Option<u64> {
        self.data.keys().next_back().map(|&a| u64::from(a) + 1)
    }

    pub fn get(&self, address: u32) -> Option<u8> {
        self.data.get(&address).copied()
    }

    pub fn set(&mut self, address: u32, value: u8) {
        self.data.insert(address, value);
    }

    pub fn read(&self, range: Range<u32>) -> Vec<Option<u8>> {
        range.map(|a| self.get(a)).collect()
    }

    pub fn write(&mut self, address: u32, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.data.insert(address.wrapping_add(i as u32), b);
        }
    }

    pub fn fill(&mut self, range: Range<u32>, value: u8) {
        for address in range {
            self.data.insert(address, value);
        }
    }

    pub fn merge(&mut self, other: &Image, policy: MergePolicy) -> Result<()> {
        if policy == MergePolicy::Error {
            if let Some(address) = other.data.keys().find(|a| self.data.contains_key(a)) {
                return Err(Error::Image(format!(
                    "data overlapped at address {:#010x}",
                    address
                )));
            }
        }
        for (&address, &value) in &other.data {
            match policy {
                MergePolicy::Ignore => {
                    self.data.entry(address).or_insert(value);
                }
                MergePolicy::Error | MergePolicy::Replace => {
                    self.data.insert(address, value);
                }
            }
        }
        Ok(())
    }

    /// Drop the data of line `line` (1-based) of this image's serialized form.
    ///
    /// Returns the number of bytes removed. Address and end-of-file records
    /// are kept, so removing them is a no-op.
    pub fn remove_line(&mut self, line: usize) -> usize {
        let lines = self.lines();
        let Some(entry) = line.checked_sub(1).and_then(|i| lines.get(i)) else {
            log::warn!("Line {} is past the end of the image", line);
            return 0;
        };
        match &entry.record {
            Record::Data { offset, value } => {
                let start = entry.base + *offset as u32;
                for i in 0..value.len() as u32 {
                    self.data.remove(&(start + i));
                }
                log::debug!(
                    "Removed {} bytes at {:#010x} (line {})",
                    value.len(),
                    start,
                    line
                );
                value.len()
            }
            other => {
                log::warn!("Line {} is not a data record: {:?}", line, other);
                0
            }
        }
    }

    fn lines(&self) -> Vec<Line> {
        let mut lines = vec![];
        let mut upper = 0u16;
        let mut run: Option<(u32, Vec<u8>)> = None;

        let flush = |run: &mut Option<(u32, Vec<u8>)>, lines: &mut Vec<Line>, upper: &mut u16| {
            if let Some((start, bytes)) = run.take() {
                let hi = (start >> 16) as u16;
                if hi != *upper {
                    lines.push(Line {
                        record: Record::ExtendedLinearAddress(hi),
                        base: (hi as u32) << 16,
                    });
                    *upper = hi;
                }
                lines.push(Line {
                    record: Record::Data {
                        offset: (start & 0xffff) as u16,
                        value: bytes,
                    },
                    base: (hi as u32) << 16,
                });
            }
        };

        for (&address, &value) in &self.data {
            let extends = match &run {
                Some((start, bytes)) => {
                    let next = start + bytes.len() as u32;
                    next == address && bytes.len() < RECORD_SIZE && address & 0xffff != 0
                }
                None => false,
            };
            if extends {
                if let Some((_, bytes)) = run.as_mut() {
                    bytes.push(value);
                }
            } else {
                flush(&mut run, &mut lines, &mut upper);
                run = Some((address, vec![value]));
            }
        }
        flush(&mut run, &mut lines, &mut upper);

        lines.push(Line {
            record: Record::EndOfFile,
            base: (upper as u32) << 16,
        });
        lines
    }
}
