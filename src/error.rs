// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use std::fmt;

/// Error code carried in an `<error code="...">` element of a CV2 response.
///
/// UDP gives the card no way to refuse a packet, so a rejected request is
/// answered with an error element instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    /// The MAC/token did not match the card.
    BadAuth,
    /// The card did not recognise the command.
    UnknownCommand,
    /// The addressed device class/id is not attached to this card.
    UnknownDevice,
    /// Any other code, kept verbatim.
    Other(String),
}

impl DeviceErrorCode {
    /// Parse the `code` attribute of an error element.
    pub fn from_code(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "auth" | "badauth" | "401" => Self::BadAuth,
            "badcmd" | "unknowncmd" | "400" => Self::UnknownCommand,
            "nodevice" | "baddevice" | "404" => Self::UnknownDevice,
            _ => Self::Other(s.trim().to_string()),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::BadAuth)
    }

    pub fn description(&self) -> &str {
        match self {
            Self::BadAuth => "Authentication rejected",
            Self::UnknownCommand => "Unknown command",
            Self::UnknownDevice => "Unknown device",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// All errors that can occur in the BlueBOLT client.
///
/// None of the variants carry the full auth token; anything that may echo
/// device traffic is redacted before it is stored in an error.
#[derive(Debug, thiserror::Error)]
pub enum BlueBoltError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not open UDP session to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("No response after {attempts} attempt(s): {command}")]
    Timeout { command: String, attempts: u32 },

    #[error("Malformed response: {details}")]
    Parse { details: String },

    #[error("Device reported error: {0}")]
    Device(DeviceErrorCode),

    #[error("Authentication rejected by {host} (token {token})")]
    Auth { host: String, token: String },

    #[error("Unsupported device class: {identifier}")]
    UnsupportedDevice { identifier: String },

    #[error("Invalid outlet index: {index} (must be 1-{max})")]
    InvalidOutlet { index: u8, max: u8 },

    #[error("Invalid auth token: {reason}")]
    InvalidToken { reason: String },

    #[error("Failed to encode request: {0}")]
    Encode(String),
}

impl BlueBoltError {
    pub(crate) fn parse(details: impl Into<String>) -> Self {
        BlueBoltError::Parse {
            details: details.into(),
        }
    }

    /// Whether this error only makes the device unavailable until the next
    /// successful poll.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BlueBoltError::Io(_)
                | BlueBoltError::Timeout { .. }
                | BlueBoltError::Parse { .. }
                | BlueBoltError::Device(_)
        )
    }

    /// Whether this error aborts setup and needs reconfiguration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BlueBoltError::Connection { .. }
                | BlueBoltError::Auth { .. }
                | BlueBoltError::UnsupportedDevice { .. }
                | BlueBoltError::InvalidToken { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BlueBoltError>;
