//! Error taxonomy for setup calls.
//!
//! Errors raised inside a running task never come back through these types;
//! the task reports them as events instead.
use std::path::PathBuf;

use resotrack_shared::{DeviceError, InstrumentKind};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Instrument I/O failed
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A task was configured with values it cannot run with
    #[error("invalid configuration: {msg}")]
    Config { msg: String },

    #[error("unsupported instrument type `{0}`")]
    UnknownInstrument(String),

    /// A task was started without one of the instruments it drives
    #[error("no {role} instrument bound")]
    MissingDevice { role: &'static str },

    #[error("no instrument registered at {address}")]
    NotFound { address: String },

    #[error("instrument at {address} is a {actual}, expected a {expected}")]
    WrongKind {
        address: String,
        expected: InstrumentKind,
        actual: InstrumentKind,
    },

    /// An output file could not be written in the requested format
    #[error("failed to write {path}: {msg}")]
    Persistence { path: PathBuf, msg: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("task is already running")]
    AlreadyRunning,

    /// Nothing has been collected yet
    #[error("no data to save")]
    NoData,

    #[error("task thread panicked")]
    Panicked,
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config { msg: msg.into() }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, msg: impl ToString) -> Self {
        Self::Persistence {
            path: path.into(),
            msg: msg.to_string(),
        }
    }
}
