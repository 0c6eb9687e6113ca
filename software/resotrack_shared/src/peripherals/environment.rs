//! Environment controller capability (temperature and magnetic field)
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// One temperature and field reading with the controller's status strings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvironmentReading {
    /// Temperature in kelvin
    pub temperature: f64,
    pub temperature_status: String,

    /// Field in oersted
    pub field: f64,
    pub field_status: String,
}

/// Environment controller (cryostat or PPMS) as seen by the control tasks.
///
/// These are slow to query compared to a lock-in, so callers are expected
/// to cap the rate at which they read them.
pub trait EnvironmentController: Send + Sync {
    /// Transport address of this instrument
    fn address(&self) -> &str;

    fn get_temperature_and_field(&self) -> Result<EnvironmentReading, DeviceError>;

    /// Release the transport
    fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}
