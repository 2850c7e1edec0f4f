//! Shared configuration.
//!
//! The grid resolution and the backend address are a contract between this
//! client and the leaderboard aggregator: a resolution mismatch silently
//! fragments leaderboard queries. Both live here, in one struct that is
//! validated once by every component constructor that consumes it.

use std::time::Duration;

use h3o::Resolution;
use serde::{Deserialize, Serialize};

use crate::{Result, TerritoryError};

/// Configuration for the territory engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerritoryConfig {
    /// Base URL of the backend API, without trailing slash.
    /// Default: "http://localhost:8080/api/v1"
    pub api_base_url: String,

    /// H3 resolution shared with the backend.
    /// Default: 9 (~174 m average edge)
    pub hex_resolution: u8,

    /// Session ticker period in milliseconds.
    /// Default: 1000
    pub tick_interval_ms: u64,

    /// Refetch when the viewport center moves by at least this fraction
    /// of the new span (either axis).
    /// Default: 0.1
    pub refetch_center_ratio: f64,

    /// Refetch when the viewport span changes by at least this fraction
    /// of the previous span (either axis).
    /// Default: 0.2
    pub refetch_span_ratio: f64,

    /// Entries kept per cell leaderboard after sorting.
    /// Default: 5 (the backend keeps a top 5)
    pub leaderboard_depth: usize,

    /// Network request timeout in seconds.
    /// Default: 30
    pub request_timeout_secs: u64,

    /// Attempts before the outbox gives up on a submission.
    /// Default: 8
    pub outbox_max_attempts: u32,

    /// First outbox retry delay in seconds, doubled per failed attempt.
    /// Default: 30
    pub outbox_base_backoff_secs: u64,
}

impl Default for TerritoryConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api/v1".to_string(),
            hex_resolution: 9,
            tick_interval_ms: 1000,
            refetch_center_ratio: 0.1,
            refetch_span_ratio: 0.2,
            leaderboard_depth: 5,
            request_timeout_secs: 30,
            outbox_max_attempts: 8,
            outbox_base_backoff_secs: 30,
        }
    }
}

impl TerritoryConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TerritoryConfig =
            serde_json::from_str(json).map_err(|e| TerritoryError::Config {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field once; components call this in their constructors.
    pub fn validate(&self) -> Result<()> {
        self.resolution()?;

        if self.api_base_url.trim().is_empty() {
            return Err(config_error("api_base_url must not be empty"));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(config_error("api_base_url must start with http:// or https://"));
        }
        if self.tick_interval_ms == 0 {
            return Err(config_error("tick_interval_ms must be positive"));
        }
        if !(self.refetch_center_ratio.is_finite() && self.refetch_center_ratio > 0.0) {
            return Err(config_error("refetch_center_ratio must be positive"));
        }
        if !(self.refetch_span_ratio.is_finite() && self.refetch_span_ratio > 0.0) {
            return Err(config_error("refetch_span_ratio must be positive"));
        }
        if self.leaderboard_depth == 0 {
            return Err(config_error("leaderboard_depth must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(config_error("request_timeout_secs must be positive"));
        }
        if self.outbox_max_attempts == 0 {
            return Err(config_error("outbox_max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// The configured H3 resolution.
    pub fn resolution(&self) -> Result<Resolution> {
        Resolution::try_from(self.hex_resolution).map_err(|_| TerritoryError::InvalidResolution {
            value: self.hex_resolution,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Join the base URL and an endpoint path.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn config_error(message: &str) -> TerritoryError {
    TerritoryError::Config {
        message: message.to_string(),
    }
}
