//! The hardware module contains [crate::channel::BusTransport] implementations
//! for real and simulated J1939 networks

pub mod simulation;
pub mod transport_protocol;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan;

/// Hardware API result
pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

#[derive(Debug)]
/// Represents error that can be returned by Hardware API
pub enum HardwareError {
    /// Low level driver error
    APIError {
        /// API Error code
        code: u32,
        /// API Error description
        desc: String,
    },
    /// Hardware not found
    DeviceNotFound,
}

impl std::fmt::Display for HardwareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            HardwareError::APIError { code, desc } => {
                write!(f, "Hardware API Error. Code {code}, Description: {desc}")
            }
            HardwareError::DeviceNotFound => write!(f, "Device not found"),
        }
    }
}

impl std::error::Error for HardwareError {}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::J1939Error;

    #[test]
    fn hardware_error_reaches_crate_error_directly() {
        let err: J1939Error = HardwareError::DeviceNotFound.into();
        assert!(matches!(err, J1939Error::HardwareError(HardwareError::DeviceNotFound)));
        assert_eq!(err.source().map(|e| e.to_string()), Some("Device not found".to_string()));
    }
}
