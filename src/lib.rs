//! # StrideWars Core
//!
//! Spatial indexing and session aggregation for a territory-claiming game.
//!
//! This library provides:
//! - H3 hexagonal cell indexing of GPS coordinates (fixed, shared resolution)
//! - Haversine distance between location samples
//! - A recording session tracker that accumulates visited cells, time and distance
//! - A region leaderboard cache keyed by cell, refreshed per map viewport
//! - Activity submission to the backend, with an optional persistent outbox
//!
//! ## Features
//!
//! - **`http`** - reqwest client for the leaderboard and activity endpoints
//! - **`persistence`** - SQLite outbox for failed activity submissions
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use stridewars_core::{GpsPoint, SessionTracker, TerritoryConfig};
//!
//! let config = TerritoryConfig::default();
//! let mut tracker = SessionTracker::new(&config).unwrap();
//!
//! tracker.start().unwrap();
//! tracker.on_location_sample(GpsPoint::new(52.2297, 21.0122)).unwrap();
//! tracker.tick();
//! tracker.on_location_sample(GpsPoint::new(52.2299, 21.0125)).unwrap();
//!
//! let record = tracker.stop().unwrap();
//! assert!(!record.cell_ids.is_empty());
//! assert_eq!(record.duration_seconds, 1);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TerritoryError};

// Shared configuration (grid resolution, endpoint, thresholds)
pub mod config;
pub use config::TerritoryConfig;

// Geographic utilities (haversine distance, offsets)
pub mod geo_utils;
pub use geo_utils::distance_meters;

// H3 cell index
pub mod cells;
pub use cells::{
    boundary_of, centroid_of, index_of, neighbors_within_radius, CellBoundary, CellId,
};

// Recording session state machine
pub mod session;
pub use session::{ActivityRecord, SampleOutcome, Session, SessionTracker, TrackerState};

// Async recording driver (ticker + position stream)
pub mod recorder;
pub use recorder::{PositionSource, Recorder};

// Region leaderboard cache
pub mod leaderboard;
pub use leaderboard::{
    should_refetch, CellLeaderboard, CellTile, FetchOutcome, FetchTicket, LeaderboardEntry,
    LeaderboardQuery, RegionLeaderboardCache, Viewport,
};

// Activity submission
pub mod submission;
pub use submission::{
    ActivityIngestion, ActivityPayload, ActivitySubmitter, IdentityProvider, SkipReason,
    SubmitOutcome,
};

// HTTP client for the backend
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{GlobalLeaderboardEntry, TerritoryClient, UserActivityStats};

// Persistent outbox for failed submissions
#[cfg(feature = "persistence")]
pub mod outbox;
#[cfg(feature = "persistence")]
pub use outbox::{FlushReport, PendingSubmission, SubmissionOutbox};

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("StrideWarsRust"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use stridewars_core::GpsPoint;
/// let point = GpsPoint::new(52.2297, 21.0122); // Warsaw
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// Return the point unchanged, or `InvalidCoordinate` when out of range.
    pub fn validated(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(TerritoryError::InvalidCoordinate {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }
}

/// One delivery from the positioning service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub point: GpsPoint,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
}

impl LocationUpdate {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        Self {
            point: GpsPoint::new(latitude, longitude),
            timestamp_ms,
        }
    }
}

/// Geographic bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Check whether a point lies inside (inclusive).
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }

    /// Check whether two boxes overlap.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
    }
}

// ============================================================================
// Tests
// ============================================================================
