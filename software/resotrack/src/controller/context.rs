//! Information about the current operation
//! that may be used by the tasks and their outputs.

use std::default::Default;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};

use serde::{Deserialize, Serialize};

/// Operation context: where configuration lives and where data lands.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[non_exhaustive]
pub struct RunCtx {
    /// A name for this operation, used for the log file name
    /// and compatible with that use.
    pub op_name: String,

    /// A directory to find file inputs and place outputs.
    pub op_dir: PathBuf,
}

impl Default for RunCtx {
    fn default() -> Self {
        Self::new(std::fs::canonicalize("./").unwrap_or_default())
    }
}

impl RunCtx {
    /// Context rooted at `op_dir`, named by the current time
    pub fn new(op_dir: impl Into<PathBuf>) -> Self {
        // Use current time with seconds as op name,
        // replacing characters in the name that would be invalid on Windows.
        let op_name = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(":", "");
        Self {
            op_name,
            op_dir: op_dir.into(),
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.op_dir.join("config")
    }

    /// Persistent list of configured instruments
    pub fn instrument_config_path(&self) -> PathBuf {
        self.config_dir().join("instruments_config.json")
    }

    /// Parent of in-progress recording chunks
    pub fn temp_dir(&self) -> PathBuf {
        self.op_dir.join("temp_data")
    }

    /// Default destination of saved data files
    pub fn history_dir(&self) -> PathBuf {
        self.op_dir.join("history_data")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.op_dir.join("logs")
    }

    /// `<history_dir>/<prefix>_<YYYYmmdd_HHMMSS>.dat`
    pub fn default_data_path(&self, prefix: &str) -> PathBuf {
        self.history_dir()
            .join(format!("{prefix}_{}.dat", file_stamp(SystemTime::now())))
    }

    pub fn op_dir(&self) -> &Path {
        &self.op_dir
    }
}

/// Local time as `YYYYmmdd_HHMMSS`, for file names
pub fn file_stamp(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format("%Y%m%d_%H%M%S").to_string()
}
