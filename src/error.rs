//! Error types shared by provisioning and flashing.
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::runner::ToolCommand;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong between picking a device and locking it.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed identity string, or no address to put it at.
    /// Raised before any programmer is started.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// The programmer could not read the current EEPROM contents.
    #[error("reading EEPROM with '{command}' failed (code {code:?}): {output}")]
    EepromReadFailure {
        command: ToolCommand,
        code: Option<i32>,
        output: String,
    },

    #[error("command '{command}' returned an error (code {code:?}): {output}")]
    CommandExecution {
        command: ToolCommand,
        code: Option<i32>,
        output: String,
    },

    #[error("command '{command}' did not finish within {timeout:?}")]
    Timeout {
        command: ToolCommand,
        timeout: Duration,
    },

    /// The programmer still rejected lines of the image after they were removed once.
    #[error("address out of range at line(s) {lines:?} after self-heal retry: {output}")]
    OutOfRange { lines: Vec<usize>, output: String },

    #[error("device '{0}' not found in catalog")]
    UnknownDevice(String),

    #[error("unknown flasher backend '{0}'")]
    UnknownBackend(String),

    #[error("processor {processor} is not supported by the {backend} backend")]
    UnsupportedProcessor {
        processor: &'static str,
        backend: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Captured programmer output, if the error carries any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Error::EepromReadFailure { output, .. }
            | Error::CommandExecution { output, .. }
            | Error::OutOfRange { output, .. } => Some(output),
            _ => None,
        }
    }
}
