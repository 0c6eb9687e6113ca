//! Lock-in amplifier capability
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Quantities a lock-in can capture at a single instant with one SNAP query.
///
/// Discriminants are the SR830 parameter codes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapParam {
    X = 1,
    Y = 2,
    R = 3,
    Theta = 4,
    AuxIn1 = 5,
    AuxIn2 = 6,
    AuxIn3 = 7,
    AuxIn4 = 8,
    Frequency = 9,
    Ch1Display = 10,
    Ch2Display = 11,
}

/// Fewest parameters accepted by one SNAP query
pub const MIN_SNAP_PARAMS: usize = 2;

/// Most parameters accepted by one SNAP query
pub const MAX_SNAP_PARAMS: usize = 6;

/// Snapshot taken by the data recorder on every tick
pub const RECORD_SNAPSHOT: [SnapParam; 5] = [
    SnapParam::X,
    SnapParam::Y,
    SnapParam::R,
    SnapParam::Theta,
    SnapParam::Frequency,
];

/// Snapshot taken by the frequency sweeper at each step
pub const SWEEP_SNAPSHOT: [SnapParam; 4] =
    [SnapParam::X, SnapParam::Y, SnapParam::R, SnapParam::Theta];

impl SnapParam {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use SnapParam::*;
        let p = match code {
            1 => X,
            2 => Y,
            3 => R,
            4 => Theta,
            5 => AuxIn1,
            6 => AuxIn2,
            7 => AuxIn3,
            8 => AuxIn4,
            9 => Frequency,
            10 => Ch1Display,
            11 => Ch2Display,
            _ => return None,
        };
        Some(p)
    }

    /// Measurement name used for this quantity in recorded data
    pub fn name(self) -> &'static str {
        match self {
            Self::X => "X",
            Self::Y => "Y",
            Self::R => "R",
            Self::Theta => "theta",
            Self::AuxIn1 => "aux_in_1",
            Self::AuxIn2 => "aux_in_2",
            Self::AuxIn3 => "aux_in_3",
            Self::AuxIn4 => "aux_in_4",
            Self::Frequency => "frequency",
            Self::Ch1Display => "ch1_display",
            Self::Ch2Display => "ch2_display",
        }
    }
}

/// Check the parameter count of a SNAP query before anything is sent.
pub fn validate_snap(address: &str, params: &[SnapParam]) -> Result<(), DeviceError> {
    if !(MIN_SNAP_PARAMS..=MAX_SNAP_PARAMS).contains(&params.len()) {
        return Err(DeviceError::InvalidRequest {
            address: address.to_owned(),
            msg: format!(
                "SNAP needs {MIN_SNAP_PARAMS}-{MAX_SNAP_PARAMS} parameters, got {}",
                params.len()
            ),
        });
    }
    Ok(())
}

/// Lock-in amplifier as seen by the control tasks.
///
/// Handles are shared between tasks without any locking on the core side,
/// so drivers must be safe to call from more than one thread.
pub trait LockIn: Send + Sync {
    /// Transport address of this instrument
    fn address(&self) -> &str;

    /// Single read of the phase output, in degrees
    fn read_phase(&self) -> Result<f64, DeviceError>;

    /// Capture 2-6 quantities at one instant.
    /// Values are returned in the order of `params`.
    fn snapshot(&self, params: &[SnapParam]) -> Result<Vec<f64>, DeviceError>;

    /// Name of the reference source (internal or external)
    fn reference_source(&self) -> Result<String, DeviceError>;

    /// Release the transport
    fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}
