//! Errors reported by instrument drivers.

/// A failed request to an instrument.
///
/// Every variant carries the address of the instrument so that a failure in a setup
/// with several instruments of the same class can be attributed to the right one.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The transport could not reach the instrument, or the link dropped
    #[error("connection error on {address}: {msg}")]
    Connection { address: String, msg: String },

    /// The transport gave up waiting for a reply
    #[error("timed out waiting for {address}")]
    Timeout { address: String },

    /// The instrument replied with something that could not be parsed
    #[error("malformed response from {address}: `{response}`")]
    Malformed { address: String, response: String },

    /// The request was rejected before anything was sent
    #[error("invalid request to {address}: {msg}")]
    InvalidRequest { address: String, msg: String },
}

impl DeviceError {
    /// Address of the instrument that produced this error
    pub fn address(&self) -> &str {
        match self {
            Self::Connection { address, .. }
            | Self::Timeout { address }
            | Self::Malformed { address, .. }
            | Self::InvalidRequest { address, .. } => address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_reported_for_every_variant() {
        let errs = [
            DeviceError::Connection {
                address: "GPIB0::8::INSTR".into(),
                msg: "refused".into(),
            },
            DeviceError::Timeout {
                address: "GPIB0::8::INSTR".into(),
            },
            DeviceError::Malformed {
                address: "GPIB0::8::INSTR".into(),
                response: "1.0,,".into(),
            },
            DeviceError::InvalidRequest {
                address: "GPIB0::8::INSTR".into(),
                msg: "too few parameters".into(),
            },
        ];

        for e in errs {
            assert_eq!(e.address(), "GPIB0::8::INSTR");
            assert!(e.to_string().contains("GPIB0::8::INSTR"), "{e}");
        }
    }
}
