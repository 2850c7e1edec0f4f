//! Unified error handling for the territory engine.
//!
//! Every fallible operation in the crate returns [`TerritoryError`]. Each
//! variant renders as a single human-readable message so the presentation
//! layer can show it without further formatting.

use thiserror::Error;

/// Unified error type for territory operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TerritoryError {
    /// Latitude/longitude outside the valid range or not finite
    #[error("Invalid coordinate ({latitude}, {longitude})")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    /// Cell identifier could not be decoded
    #[error("Invalid cell id '{value}': {reason}")]
    InvalidCellId { value: String, reason: String },

    /// Search radius negative, not finite, or above the supported maximum
    #[error("Invalid radius {radius_m} m")]
    InvalidRadius { radius_m: f64 },

    /// Grid resolution outside 0..=15
    #[error("Invalid hex resolution {value}")]
    InvalidResolution { value: u8 },

    /// A cell was produced at a different resolution than the configured one
    #[error("Cell resolution mismatch: expected {expected}, found {found}")]
    ResolutionMismatch { expected: u8, found: u8 },

    /// Positioning service refused access
    #[error("Location permission denied: {message}")]
    PermissionDenied { message: String },

    /// `start()` called while a recording is in progress
    #[error("A recording session is already active")]
    SessionActive,

    /// `stop()` called while idle
    #[error("No recording session is active")]
    NoActiveSession,

    /// HTTP/transport failure or non-2xx response
    #[error("{}", http_message(.message, .status_code))]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// Response body did not match the expected shape
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn http_message(message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("HTTP error ({}): {}", code, message),
        None => format!("HTTP error: {}", message),
    }
}

impl TerritoryError {
    /// True for the NetworkFailure family (transport, status, decode).
    ///
    /// These are non-fatal: a failed leaderboard fetch keeps the previous
    /// cache, a failed submission is logged and dropped (or parked in the
    /// outbox when one is used).
    pub fn is_network(&self) -> bool {
        matches!(self, TerritoryError::Http { .. } | TerritoryError::Decode { .. })
    }

    /// True for synchronous input errors (bad coordinate, bad cell id).
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            TerritoryError::InvalidCoordinate { .. }
                | TerritoryError::InvalidCellId { .. }
                | TerritoryError::InvalidRadius { .. }
                | TerritoryError::InvalidResolution { .. }
        )
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TerritoryError {
    fn from(e: rusqlite::Error) -> Self {
        TerritoryError::Persistence {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for TerritoryError {
    fn from(e: serde_json::Error) -> Self {
        TerritoryError::Decode {
            message: e.to_string(),
        }
    }
}

/// Result type alias for territory operations.
pub type Result<T> = std::result::Result<T, TerritoryError>;

/// Extension trait for converting Option to TerritoryError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a decode error.
    fn ok_or_decode(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_decode(self, message: &str) -> Result<T> {
        self.ok_or_else(|| TerritoryError::Decode {
            message: message.to_string(),
        })
    }
}
