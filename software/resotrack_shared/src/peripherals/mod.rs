//! Capability interfaces for each class of instrument.
//!
//! Drivers for the real instruments live outside this workspace; the core only
//! sees the traits defined here.
use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod environment;
pub mod generator;
pub mod lockin;

pub use environment::{EnvironmentController, EnvironmentReading};
pub use generator::{FrequencyLimits, Load, SignalGenerator, WF1947_FREQUENCY_LIMITS, Waveform};
pub use lockin::{LockIn, SnapParam, RECORD_SNAPSHOT, SWEEP_SNAPSHOT};

/// Address of an instrument on its transport,
/// for example a VISA resource string or a host name.
pub type Address = String;

/// Classes of instrument that the core can drive.
///
/// The serialized names are the ones used in the instrument config file
/// and as column prefixes in recorded data.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstrumentKind {
    /// Lock-in amplifier
    #[serde(rename = "SR830")]
    Sr830,

    /// Function generator
    #[serde(rename = "WF1947")]
    Wf1947,

    /// Physical property measurement system, used as an environment controller
    #[serde(rename = "PPMS")]
    Ppms,
}

impl InstrumentKind {
    /// Every supported class, in config-file order
    pub const ALL: [InstrumentKind; 3] = [Self::Sr830, Self::Wf1947, Self::Ppms];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sr830 => "SR830",
            Self::Wf1947 => "WF1947",
            Self::Ppms => "PPMS",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InstrumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|k| k.name() == s)
            .copied()
            .ok_or_else(|| format!("Unsupported instrument type `{s}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_roundtrip() {
        for kind in InstrumentKind::ALL {
            assert_eq!(kind.name().parse::<InstrumentKind>(), Ok(kind));
        }
        assert!("SR850".parse::<InstrumentKind>().is_err());
    }
}
