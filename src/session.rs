//! # Session Tracker
//!
//! Two-state machine (Idle / Recording) that turns a stream of location
//! samples and timer ticks into one [`ActivityRecord`].
//!
//! - Each sample is quantized to a cell and added to the visited set;
//!   revisiting a cell never double-counts.
//! - Distance accrues between consecutive samples regardless of cells.
//! - Elapsed time is a tick counter (one tick per second while recording).
//!
//! All mutation happens from one logical thread (the recorder loop or the UI
//! loop), so the tracker holds no locks.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use h3o::Resolution;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::cells::{index_of, CellId};
use crate::geo_utils::distance_meters;
use crate::{GpsPoint, LocationUpdate, Result, TerritoryConfig, TerritoryError};

/// Tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Recording,
}

/// Running accumulation for one recording.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub started_at: Option<DateTime<Utc>>,
    /// Incremented once per tick while recording
    pub elapsed_seconds: u64,
    /// Sum of haversine deltas between consecutive samples
    pub distance_meters: f64,
    pub visited: HashSet<CellId>,
    pub last_sample: Option<GpsPoint>,
    /// Timestamps of the first and last sample (Unix ms), when known
    pub first_sample_ms: Option<i64>,
    pub last_sample_ms: Option<i64>,
}

impl Session {
    fn reset(&mut self) {
        *self = Session::default();
    }

    /// Seconds between the first and last timestamped sample.
    pub fn sample_span_seconds(&self) -> Option<f64> {
        match (self.first_sample_ms, self.last_sample_ms) {
            (Some(first), Some(last)) if last >= first => Some((last - first) as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Immutable summary of a finished session.
///
/// The user id is attached at submission time
/// (see [`ActivityPayload`](crate::ActivityPayload)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Distinct visited cells, sorted by index
    pub cell_ids: Vec<CellId>,
    pub duration_seconds: u64,
    pub distance_meters: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    /// Span of the sample timestamps, as a cross-check of `duration_seconds`
    pub sample_span_seconds: Option<f64>,
}

impl ActivityRecord {
    /// A session with no visited cell produces no activity.
    pub fn is_empty(&self) -> bool {
        self.cell_ids.is_empty()
    }
}

/// What a single sample did to the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// Tracker is idle; the sample was dropped
    Ignored,
    Recorded {
        cell: CellId,
        /// First visit of this cell in the session
        new_cell: bool,
        /// Distance added by this sample
        delta_meters: f64,
    },
}

/// The session tracker state machine.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    resolution: Resolution,
    state: TrackerState,
    session: Session,
}

impl SessionTracker {
    /// Create an idle tracker at the configured resolution.
    pub fn new(config: &TerritoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_resolution(config.resolution()?))
    }

    pub fn with_resolution(resolution: Resolution) -> Self {
        Self {
            resolution,
            state: TrackerState::Idle,
            session: Session::default(),
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == TrackerState::Recording
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Current session (empty while idle).
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn visited_count(&self) -> usize {
        self.session.visited.len()
    }

    /// Idle -> Recording. Starts from a clean session.
    pub fn start(&mut self) -> Result<()> {
        if self.is_recording() {
            return Err(TerritoryError::SessionActive);
        }
        self.session.reset();
        self.session.started_at = Some(Utc::now());
        self.state = TrackerState::Recording;
        info!("[SessionTracker] Recording started");
        Ok(())
    }

    /// One ticker period elapsed. No effect while idle.
    pub fn tick(&mut self) {
        if self.is_recording() {
            self.session.elapsed_seconds += 1;
        }
    }

    /// Feed one position. No effect while idle.
    ///
    /// Invalid coordinates fail fast and leave the session untouched.
    pub fn on_location_sample(&mut self, point: GpsPoint) -> Result<SampleOutcome> {
        if !self.is_recording() {
            return Ok(SampleOutcome::Ignored);
        }

        let cell = index_of(point, self.resolution)?;
        let new_cell = self.session.visited.insert(cell);

        let delta_meters = match self.session.last_sample {
            Some(last) => distance_meters(last, point),
            None => 0.0,
        };
        self.session.distance_meters += delta_meters;
        self.session.last_sample = Some(point);

        if new_cell {
            debug!(
                "[SessionTracker] New cell {} ({} visited)",
                cell,
                self.session.visited.len()
            );
        }

        Ok(SampleOutcome::Recorded {
            cell,
            new_cell,
            delta_meters,
        })
    }

    /// Feed a timestamped delivery from the positioning service.
    pub fn on_location_update(&mut self, update: LocationUpdate) -> Result<SampleOutcome> {
        let outcome = self.on_location_sample(update.point)?;
        if let SampleOutcome::Recorded { .. } = outcome {
            if self.session.first_sample_ms.is_none() {
                self.session.first_sample_ms = Some(update.timestamp_ms);
            }
            self.session.last_sample_ms = Some(update.timestamp_ms);
        }
        Ok(outcome)
    }

    /// Recording -> Idle. Drains the session into a record and resets it.
    ///
    /// The reset happens whether or not the record is later submitted.
    pub fn stop(&mut self) -> Result<ActivityRecord> {
        if !self.is_recording() {
            return Err(TerritoryError::NoActiveSession);
        }

        let session = std::mem::take(&mut self.session);
        self.state = TrackerState::Idle;

        let mut cell_ids: Vec<CellId> = session.visited.iter().copied().collect();
        cell_ids.sort();

        let record = ActivityRecord {
            duration_seconds: session.elapsed_seconds,
            distance_meters: session.distance_meters,
            started_at: session.started_at,
            ended_at: Utc::now(),
            sample_span_seconds: session.sample_span_seconds(),
            cell_ids,
        };

        info!(
            "[SessionTracker] Recording stopped: {} cells, {}s, {:.0}m",
            record.cell_ids.len(),
            record.duration_seconds,
            record.distance_meters
        );

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_point;

    fn tracker() -> SessionTracker {
        SessionTracker::new(&TerritoryConfig::default()).unwrap()
    }

    fn warsaw() -> GpsPoint {
        GpsPoint::new(52.2297, 21.0122)
    }

    #[test]
    fn test_idle_ignores_input() {
        let mut t = tracker();
        assert_eq!(t.on_location_sample(warsaw()).unwrap(), SampleOutcome::Ignored);
        t.tick();
        assert_eq!(t.session().elapsed_seconds, 0);
        assert_eq!(t.visited_count(), 0);
    }

    #[test]
    fn test_state_machine_misuse() {
        let mut t = tracker();
        assert_eq!(t.stop(), Err(TerritoryError::NoActiveSession));
        t.start().unwrap();
        assert_eq!(t.start(), Err(TerritoryError::SessionActive));
        assert!(t.stop().is_ok());
        assert_eq!(t.state(), TrackerState::Idle);
    }

    #[test]
    fn test_idempotent_visitation() {
        let mut t = tracker();
        t.start().unwrap();

        let first = t.on_location_sample(warsaw()).unwrap();
        let count_after_first = t.visited_count();
        let second = t.on_location_sample(warsaw()).unwrap();

        assert_eq!(t.visited_count(), count_after_first);
        assert_eq!(t.visited_count(), 1);
        assert!(matches!(first, SampleOutcome::Recorded { new_cell: true, .. }));
        assert!(matches!(
            second,
            SampleOutcome::Recorded { new_cell: false, delta_meters, .. } if delta_meters == 0.0
        ));
    }

    #[test]
    fn test_distance_accrues_inside_one_cell() {
        let mut t = tracker();
        t.start().unwrap();

        let center = index_of(warsaw(), Resolution::Nine).unwrap().center();
        let a = offset_point(&center, -20.0, 0.0);
        let b = offset_point(&center, 20.0, 0.0);

        t.on_location_sample(a).unwrap();
        t.on_location_sample(b).unwrap();
        t.on_location_sample(a).unwrap();

        assert_eq!(t.visited_count(), 1);
        assert!((t.session().distance_meters - 80.0).abs() < 1.0);
    }

    #[test]
    fn test_invalid_sample_leaves_session_untouched() {
        let mut t = tracker();
        t.start().unwrap();
        t.on_location_sample(warsaw()).unwrap();

        let before = t.session().clone();
        let err = t.on_location_sample(GpsPoint::new(123.0, 0.0)).unwrap_err();
        assert!(matches!(err, TerritoryError::InvalidCoordinate { .. }));
        assert_eq!(t.session(), &before);
    }

    #[test]
    fn test_stop_resets_and_restart_is_clean() {
        let mut t = tracker();
        t.start().unwrap();
        t.on_location_sample(warsaw()).unwrap();
        t.on_location_sample(offset_point(&warsaw(), 500.0, 0.0)).unwrap();
        t.tick();
        t.tick();

        let record = t.stop().unwrap();
        assert_eq!(record.duration_seconds, 2);
        assert_eq!(record.cell_ids.len(), 2);
        assert!(record.distance_meters > 400.0);

        t.start().unwrap();
        assert_eq!(t.session().elapsed_seconds, 0);
        assert_eq!(t.session().distance_meters, 0.0);
        assert!(t.session().visited.is_empty());
        assert!(t.session().last_sample.is_none());

        // The first sample of the new session adds no distance
        let outcome = t.on_location_sample(warsaw()).unwrap();
        assert!(matches!(
            outcome,
            SampleOutcome::Recorded { delta_meters, .. } if delta_meters == 0.0
        ));
    }

    #[test]
    fn test_empty_stop_yields_empty_record() {
        let mut t = tracker();
        t.start().unwrap();
        t.tick();
        let record = t.stop().unwrap();
        assert!(record.is_empty());
        assert!(record.cell_ids.is_empty());
        assert_eq!(record.duration_seconds, 1);
        assert_eq!(record.distance_meters, 0.0);
    }

    #[test]
    fn test_record_cells_are_distinct_and_sorted() {
        let mut t = tracker();
        t.start().unwrap();
        for i in 0..10 {
            let p = offset_point(&warsaw(), (i % 3) as f64 * 400.0, 0.0);
            t.on_location_sample(p).unwrap();
        }
        let record = t.stop().unwrap();
        let mut sorted = record.cell_ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, record.cell_ids);
        assert_eq!(record.cell_ids.len(), 3);
    }

    #[test]
    fn test_sample_span_from_timestamps() {
        let mut t = tracker();
        t.start().unwrap();
        t.on_location_update(LocationUpdate::new(52.2297, 21.0122, 1_000))
            .unwrap();
        t.on_location_update(LocationUpdate::new(52.2298, 21.0122, 11_500))
            .unwrap();
        let record = t.stop().unwrap();
        assert_eq!(record.sample_span_seconds, Some(10.5));
    }
}
