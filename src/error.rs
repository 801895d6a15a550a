//! Error types and handling.

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// No session is bound for the device, or its connection is no longer active
    #[error("Device offline: {0}")]
    DeviceOffline(u8),

    /// Frame emission aborted by an I/O failure or connection loss
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Command frame too short or inconsistent to decode
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Encoded command frame would exceed the protocol maximum
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Power value other than ON/OFF
    #[error("Invalid power value: {0}")]
    InvalidPower(String),

    /// Conversion slot not obtained within the acquire timeout
    #[error("Conversion busy, try again later")]
    ConversionBusy,

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP listener or socket setup failed
    #[error("TCP connection failed: {0}")]
    TcpConnectionFailed(String),
}

/// Result type alias for AppError
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Create a transfer failure with message
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::TransferFailed(msg.into())
    }

    /// Create a malformed frame error with message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}
