//! # Activity Submission
//!
//! Sends one finished [`ActivityRecord`] to the Activity Ingestion service,
//! attributed to the current user.
//!
//! A record with no cells, or with no user to attribute it to, is skipped
//! (not an error). A failed send is logged and dropped; callers that want
//! retries park the payload in the
//! [`SubmissionOutbox`](crate::SubmissionOutbox) instead.

use std::future::Future;
use std::sync::Arc;

use h3o::Resolution;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::session::ActivityRecord;
use crate::{Result, TerritoryConfig, TerritoryError};

/// Supplies the identifier of the signed-in user, if any.
pub trait IdentityProvider {
    fn current_user_id(&self) -> Option<String>;
}

impl IdentityProvider for Option<String> {
    fn current_user_id(&self) -> Option<String> {
        self.clone()
    }
}

impl<T: IdentityProvider + ?Sized> IdentityProvider for Arc<T> {
    fn current_user_id(&self) -> Option<String> {
        (**self).current_user_id()
    }
}

/// Activity Ingestion collaborator. No dedup key is sent; idempotence is
/// the service's concern.
pub trait ActivityIngestion {
    fn ingest(&self, payload: &ActivityPayload) -> impl Future<Output = Result<()>> + Send;
}

impl<T: ActivityIngestion + ?Sized + Sync> ActivityIngestion for Arc<T> {
    fn ingest(&self, payload: &ActivityPayload) -> impl Future<Output = Result<()>> + Send {
        (**self).ingest(payload)
    }
}

/// Request body for the ingestion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityPayload {
    pub user_id: String,
    /// Seconds
    pub duration: f64,
    /// Meters
    pub distance: f64,
    /// Distinct cell ids as signed 64-bit integers
    pub h3_indexes: Vec<i64>,
}

impl ActivityPayload {
    /// Build the payload for `record`, checking every cell is at `resolution`.
    pub fn from_record(
        record: &ActivityRecord,
        user_id: impl Into<String>,
        resolution: Resolution,
    ) -> Result<Self> {
        let expected = u8::from(resolution);
        if let Some(cell) = record.cell_ids.iter().find(|c| c.resolution() != expected) {
            return Err(TerritoryError::ResolutionMismatch {
                expected,
                found: cell.resolution(),
            });
        }

        Ok(Self {
            user_id: user_id.into(),
            duration: record.duration_seconds as f64,
            distance: record.distance_meters,
            h3_indexes: record.cell_ids.iter().map(|c| c.as_i64()).collect(),
        })
    }
}

/// Why a record was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The session visited no cell
    NoCells,
    /// No signed-in user
    NoIdentity,
}

/// Result of one submission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted,
    Skipped(SkipReason),
    /// Logged and dropped; not retried here
    Failed(TerritoryError),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

/// Submits finished records on behalf of the current user.
pub struct ActivitySubmitter<I, P> {
    ingestion: Arc<I>,
    identity: P,
    resolution: Resolution,
}

impl<I: ActivityIngestion, P: IdentityProvider> ActivitySubmitter<I, P> {
    pub fn new(ingestion: I, identity: P, config: &TerritoryConfig) -> Result<Self> {
        Self::with_shared(Arc::new(ingestion), identity, config)
    }

    /// Use an ingestion client that is shared with other callers.
    pub fn with_shared(ingestion: Arc<I>, identity: P, config: &TerritoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ingestion,
            identity,
            resolution: config.resolution()?,
        })
    }

    pub fn ingestion(&self) -> &Arc<I> {
        &self.ingestion
    }

    /// Decide what to send for `record`.
    ///
    /// `Err` carries the final outcome when nothing should be sent.
    pub fn prepare(
        &self,
        record: &ActivityRecord,
    ) -> std::result::Result<ActivityPayload, SubmitOutcome> {
        if record.is_empty() {
            debug!("[ActivitySubmitter] Skipping activity with no cells");
            return Err(SubmitOutcome::Skipped(SkipReason::NoCells));
        }

        let user_id = match self.identity.current_user_id() {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                debug!("[ActivitySubmitter] Skipping activity, no signed-in user");
                return Err(SubmitOutcome::Skipped(SkipReason::NoIdentity));
            }
        };

        ActivityPayload::from_record(record, user_id, self.resolution).map_err(|e| {
            warn!("[ActivitySubmitter] Refusing to send activity: {}", e);
            SubmitOutcome::Failed(e)
        })
    }

    /// Send `record` and wait for the service's answer.
    pub async fn submit(&self, record: &ActivityRecord) -> SubmitOutcome {
        match self.prepare(record) {
            Ok(payload) => send(self.ingestion.as_ref(), payload).await,
            Err(outcome) => outcome,
        }
    }

    /// Send `record` in the background; the request outlives the caller.
    ///
    /// The user id is read now, not when the task runs. Dropping the
    /// returned handle does not cancel the request.
    pub fn submit_detached(&self, record: &ActivityRecord) -> JoinHandle<SubmitOutcome>
    where
        I: Send + Sync + 'static,
    {
        let prepared = self.prepare(record);
        let ingestion = Arc::clone(&self.ingestion);
        tokio::spawn(async move {
            match prepared {
                Ok(payload) => send(ingestion.as_ref(), payload).await,
                Err(outcome) => outcome,
            }
        })
    }
}

async fn send<I>(ingestion: &I, payload: ActivityPayload) -> SubmitOutcome
where
    I: ActivityIngestion + ?Sized,
{
    match ingestion.ingest(&payload).await {
        Ok(()) => {
            info!(
                "[ActivitySubmitter] Activity accepted: {} cells, {:.0}s, {:.0}m",
                payload.h3_indexes.len(),
                payload.duration,
                payload.distance
            );
            SubmitOutcome::Accepted
        }
        Err(e) => {
            warn!("[ActivitySubmitter] Activity submission failed, dropping: {}", e);
            SubmitOutcome::Failed(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::{index_of, CellId};
    use crate::GpsPoint;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeIngestion {
        received: Mutex<Vec<ActivityPayload>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl ActivityIngestion for FakeIngestion {
        async fn ingest(&self, payload: &ActivityPayload) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TerritoryError::Http {
                    message: "Service Unavailable".to_string(),
                    status_code: Some(503),
                });
            }
            self.received.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn record(cells: Vec<CellId>) -> ActivityRecord {
        ActivityRecord {
            cell_ids: cells,
            duration_seconds: 42,
            distance_meters: 310.5,
            started_at: None,
            ended_at: Utc::now(),
            sample_span_seconds: None,
        }
    }

    fn warsaw_cell() -> CellId {
        index_of(GpsPoint::new(52.2297, 21.0122), Resolution::Nine).unwrap()
    }

    fn user() -> Option<String> {
        Some("0b6f3c7e-2a0e-4c8e-9d55-5f0f3b1e8a11".to_string())
    }

    #[tokio::test]
    async fn test_submit_sends_payload() {
        let submitter =
            ActivitySubmitter::new(FakeIngestion::default(), user(), &TerritoryConfig::default())
                .unwrap();
        let cell = warsaw_cell();

        let outcome = submitter.submit(&record(vec![cell])).await;
        assert!(outcome.is_accepted());

        let received = submitter.ingestion().received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].user_id, user().unwrap());
        assert_eq!(received[0].duration, 42.0);
        assert_eq!(received[0].distance, 310.5);
        assert_eq!(received[0].h3_indexes, vec![cell.as_i64()]);
    }

    #[tokio::test]
    async fn test_empty_record_is_skipped() {
        let submitter =
            ActivitySubmitter::new(FakeIngestion::default(), user(), &TerritoryConfig::default())
                .unwrap();
        let outcome = submitter.submit(&record(vec![])).await;
        assert_eq!(outcome, SubmitOutcome::Skipped(SkipReason::NoCells));
        assert_eq!(submitter.ingestion().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_identity_is_skipped() {
        for identity in [None, Some("   ".to_string())] {
            let submitter = ActivitySubmitter::new(
                FakeIngestion::default(),
                identity,
                &TerritoryConfig::default(),
            )
            .unwrap();
            let outcome = submitter.submit(&record(vec![warsaw_cell()])).await;
            assert_eq!(outcome, SubmitOutcome::Skipped(SkipReason::NoIdentity));
            assert_eq!(submitter.ingestion().calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_failure_is_dropped_not_retried() {
        let ingestion = FakeIngestion {
            fail: true,
            ..Default::default()
        };
        let submitter =
            ActivitySubmitter::new(ingestion, user(), &TerritoryConfig::default()).unwrap();

        let outcome = submitter.submit(&record(vec![warsaw_cell()])).await;
        assert!(matches!(outcome, SubmitOutcome::Failed(ref e) if e.is_network()));
        assert_eq!(submitter.ingestion().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_resolution_is_never_sent() {
        let submitter =
            ActivitySubmitter::new(FakeIngestion::default(), user(), &TerritoryConfig::default())
                .unwrap();
        let coarse = index_of(GpsPoint::new(52.2297, 21.0122), Resolution::Eight).unwrap();

        let outcome = submitter.submit(&record(vec![warsaw_cell(), coarse])).await;
        assert_eq!(
            outcome,
            SubmitOutcome::Failed(TerritoryError::ResolutionMismatch {
                expected: 9,
                found: 8
            })
        );
        assert_eq!(submitter.ingestion().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detached_submission_outlives_caller() {
        let handle = {
            let submitter = ActivitySubmitter::new(
                FakeIngestion::default(),
                user(),
                &TerritoryConfig::default(),
            )
            .unwrap();
            let ingestion = Arc::clone(submitter.ingestion());
            let handle = submitter.submit_detached(&record(vec![warsaw_cell()]));
            drop(submitter);
            (handle, ingestion)
        };

        assert_eq!(handle.0.await.unwrap(), SubmitOutcome::Accepted);
        assert_eq!(handle.1.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_payload_wire_shape() {
        let cell = warsaw_cell();
        let payload =
            ActivityPayload::from_record(&record(vec![cell]), "u-1", Resolution::Nine).unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["user_id"], "u-1");
        assert_eq!(json["duration"], 42.0);
        assert_eq!(json["h3_indexes"][0], cell.as_i64());
    }
}
