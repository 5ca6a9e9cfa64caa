//! Error types and result definitions for the toiletlid crate.
//! Includes the numeric error-code table and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors raised while configuring or talking to an appliance.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MiioError {
    /// Malformed host, token or model in the configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Setup could not reach the device; the host should retry later
    #[error("Appliance not ready: {0}")]
    NotReady(String),

    /// Socket error or no reply before the timeout elapsed
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// The reply was malformed, undecryptable or not valid JSON
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Reply checksum did not match; the token is most likely wrong
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The device answered with an error object
    #[error("Device error {code}: {message}")]
    Device { code: i64, message: String },

    /// A raw property value could not be interpreted
    #[error("Decode error: {0}")]
    Decode(String),

    /// A raw-command parameter supplied by the caller is malformed
    #[error("Invalid command parameter: {0}")]
    ParamParse(String),

    /// The service name is not part of the service surface
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// No registered appliance carries this entity id or host
    #[error("Appliance '{0}' not found")]
    EntityNotFound(String),
}

/// A specialized Result type for toiletlid operations.
pub type Result<T> = std::result::Result<T, MiioError>;

impl From<std::io::Error> for MiioError {
    fn from(err: std::io::Error) -> Self {
        MiioError::Unreachable(err.to_string())
    }
}

impl From<serde_json::Error> for MiioError {
    fn from(err: serde_json::Error) -> Self {
        MiioError::Protocol(err.to_string())
    }
}

impl MiioError {
    pub fn code(&self) -> u32 {
        match self {
            MiioError::Config(_) => ERR_CONFIG,
            MiioError::NotReady(_) => ERR_NOT_READY,
            MiioError::Unreachable(_) => ERR_UNREACHABLE,
            MiioError::Protocol(_) => ERR_PROTOCOL,
            MiioError::Auth(_) => ERR_AUTH,
            MiioError::Device { .. } => ERR_DEVICE,
            MiioError::Decode(_) => ERR_DECODE,
            MiioError::ParamParse(_) => ERR_PARAMS,
            MiioError::UnknownService(_) => ERR_SERVICE,
            MiioError::EntityNotFound(_) => ERR_NOT_FOUND,
        }
    }

    /// Errors after which the cached session can no longer be trusted.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, MiioError::Unreachable(_) | MiioError::Auth(_))
    }
}

define_error_codes! {
    ERR_SUCCESS = 0 => "Command Successful",
    ERR_CONFIG = 920 => "Invalid Appliance Configuration",
    ERR_NOT_READY = 921 => "Appliance Not Ready: Retry Later",
    ERR_UNREACHABLE = 922 => "Network Error: Device Unreachable",
    ERR_PROTOCOL = 923 => "Unexpected Payload from Device",
    ERR_AUTH = 924 => "Checksum Mismatch: Check Device Token",
    ERR_DEVICE = 925 => "Error Response from Device",
    ERR_DECODE = 926 => "Unexpected Property Value",
    ERR_PARAMS = 927 => "Invalid Command Parameters",
    ERR_SERVICE = 928 => "Unknown Service",
    ERR_NOT_FOUND = 929 => "Appliance Not Found",
}
