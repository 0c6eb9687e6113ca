#![doc = include_str!("../README.md")]

pub mod error;
pub mod peripherals;

pub use error::DeviceError;
pub use peripherals::{
    Address, EnvironmentController, EnvironmentReading, FrequencyLimits, InstrumentKind, Load,
    LockIn, RECORD_SNAPSHOT, SWEEP_SNAPSHOT, SignalGenerator, SnapParam, WF1947_FREQUENCY_LIMITS,
    Waveform,
};
