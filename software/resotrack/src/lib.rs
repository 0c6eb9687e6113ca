#![doc = include_str!("../README.md")]

pub mod calc;
pub mod controller;
pub mod dispatcher;
pub mod error;
mod logging;
pub mod peripheral;
mod workbench;

pub use controller::{
    DataRecorder, FrequencySweeper, FrequencyTracker, RecorderConfig, RunCtx, SweepConfig,
    TaskEvent, TaskState, Termination, TrackingConfig,
};
pub use dispatcher::{OutputChain, SampleTable, SavedOutput};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use peripheral::{Connector, Instrument, InstrumentRegistry, RetryPolicy};
pub use workbench::Workbench;

pub use resotrack_shared;
