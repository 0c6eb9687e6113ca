//! Function generator capability
use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Absolute output frequency range of a generator, in Hz.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FrequencyLimits {
    pub min_hz: f64,
    pub max_hz: f64,
}

/// Output range of the WF1947/WF1948 family
pub const WF1947_FREQUENCY_LIMITS: FrequencyLimits = FrequencyLimits {
    min_hz: 0.1,
    max_hz: 30e6,
};

impl FrequencyLimits {
    /// Bring a frequency into range.
    /// Non-finite requests collapse to the lower bound.
    pub fn clamp(&self, hz: f64) -> f64 {
        hz.max(self.min_hz).min(self.max_hz)
    }

    pub fn contains(&self, hz: f64) -> bool {
        (self.min_hz..=self.max_hz).contains(&hz)
    }
}

/// Output waveform shape
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Waveform {
    #[default]
    #[serde(rename = "SIN")]
    Sine,
    #[serde(rename = "SQU")]
    Square,
    #[serde(rename = "RAMP")]
    Ramp,
    #[serde(rename = "PULSE")]
    Pulse,
    #[serde(rename = "NOISE")]
    Noise,
    #[serde(rename = "DC")]
    Dc,
    #[serde(rename = "USER")]
    User,
}

impl Waveform {
    /// SCPI keyword for `FUNCtion:SHAPe`
    pub fn scpi(&self) -> &'static str {
        match self {
            Self::Sine => "SINusoid",
            Self::Square => "SQUare",
            Self::Ramp => "RAMP",
            Self::Pulse => "PULSE",
            Self::Noise => "NOISE",
            Self::Dc => "DC",
            Self::User => "USER",
        }
    }
}

/// Output load setting used by the generator to scale its amplitude
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Load {
    /// Terminated load in ohms (1-10000)
    Ohms(f64),

    /// High impedance
    HighZ,
}

impl fmt::Display for Load {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ohms(r) => write!(f, "{r} OHM"),
            Self::HighZ => f.write_str("INFinity"),
        }
    }
}

/// Signal generator as seen by the control tasks.
pub trait SignalGenerator: Send + Sync {
    /// Transport address of this instrument
    fn address(&self) -> &str;

    /// Range of frequencies this generator can produce
    fn frequency_limits(&self) -> FrequencyLimits;

    fn get_frequency(&self) -> Result<f64, DeviceError>;

    fn set_frequency(&self, hz: f64) -> Result<(), DeviceError>;

    /// Energize or de-energize the output
    fn set_output(&self, on: bool) -> Result<(), DeviceError>;

    /// Return the instrument to its power-on defaults
    fn reset(&self) -> Result<(), DeviceError>;

    fn get_waveform(&self) -> Result<Waveform, DeviceError>;

    fn set_waveform(&self, waveform: Waveform) -> Result<(), DeviceError>;

    /// Peak-to-peak amplitude in volts
    fn get_amplitude(&self) -> Result<f64, DeviceError>;

    fn set_amplitude(&self, vpp: f64) -> Result<(), DeviceError>;

    /// DC offset in volts
    fn get_offset(&self) -> Result<f64, DeviceError>;

    fn set_offset(&self, volts: f64) -> Result<(), DeviceError>;

    fn get_load(&self) -> Result<Load, DeviceError>;

    fn set_load(&self, load: Load) -> Result<(), DeviceError>;

    /// Release the transport
    fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}
