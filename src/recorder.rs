//! # Recorder
//!
//! Drives a [`SessionTracker`] from three asynchronous sources while a
//! recording is active:
//!
//! 1. a periodic ticker (one tick per `tick_interval_ms`), owned by the recording
//! 2. the position stream from a [`PositionSource`]
//! 3. control messages (snapshot, stop) from the owning [`Recorder`] handle
//!
//! One task owns the tracker, so the tracker itself needs no locking.
//! Control messages are served first: a stop request wins over pending
//! ticks and a busy position stream, and samples already queued when it
//! arrives are applied before the session closes. Stopping cancels the
//! ticker before returning; dropping the handle (screen torn down) aborts
//! the task.

use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::session::{ActivityRecord, Session, SessionTracker};
use crate::{LocationUpdate, Result, TerritoryConfig, TerritoryError};

/// Device positioning service.
pub trait PositionSource {
    /// Subscribe to position updates.
    ///
    /// Returns `PermissionDenied` when positioning is unavailable; a
    /// recording cannot start in that case.
    fn watch(&mut self) -> Result<mpsc::Receiver<LocationUpdate>>;
}

enum Control {
    Snapshot(oneshot::Sender<Session>),
    Stop(oneshot::Sender<Result<ActivityRecord>>),
}

/// Handle to an active recording.
pub struct Recorder {
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

impl Recorder {
    /// Subscribe to positions and start recording.
    ///
    /// Must be called inside a tokio runtime. Fails with `PermissionDenied`
    /// (from the source) before any state changes.
    pub fn start<P: PositionSource>(source: &mut P, config: &TerritoryConfig) -> Result<Self> {
        let mut tracker = SessionTracker::new(config)?;
        let samples = source.watch()?;
        tracker.start()?;

        let (control, control_rx) = mpsc::channel(8);
        let task = tokio::spawn(run(tracker, samples, control_rx, config.tick_interval()));

        Ok(Self { control, task })
    }

    /// Copy of the running session.
    pub async fn snapshot(&self) -> Result<Session> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Snapshot(reply)).await?;
        rx.await.map_err(|_| recorder_gone())
    }

    /// Stop recording and return the finished record.
    ///
    /// The ticker is cancelled before this returns. Submission is up to the
    /// caller.
    pub async fn stop(self) -> Result<ActivityRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Stop(reply)).await?;
        rx.await.map_err(|_| recorder_gone())?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    async fn send(&self, message: Control) -> Result<()> {
        self.control.send(message).await.map_err(|_| recorder_gone())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn recorder_gone() -> TerritoryError {
    TerritoryError::Internal {
        message: "recorder task is no longer running".to_string(),
    }
}

async fn run(
    mut tracker: SessionTracker,
    mut samples: mpsc::Receiver<LocationUpdate>,
    mut control: mpsc::Receiver<Control>,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut samples_open = true;

    loop {
        tokio::select! {
            biased;

            message = control.recv() => match message {
                Some(Control::Snapshot(reply)) => {
                    let _ = reply.send(tracker.session().clone());
                }
                Some(Control::Stop(reply)) => {
                    // Samples delivered before the stop request still count
                    if samples_open {
                        for _ in 0..samples.len() {
                            match samples.try_recv() {
                                Ok(update) => apply(&mut tracker, update),
                                Err(_) => break,
                            }
                        }
                    }
                    let _ = reply.send(tracker.stop());
                    info!("[Recorder] Stopped");
                    return;
                }
                None => {
                    info!("[Recorder] Handle dropped, discarding session");
                    return;
                }
            },

            _ = ticker.tick() => tracker.tick(),

            update = samples.recv(), if samples_open => match update {
                Some(update) => apply(&mut tracker, update),
                None => {
                    warn!("[Recorder] Position stream closed, recording continues without samples");
                    samples_open = false;
                }
            },
        }
    }
}

fn apply(tracker: &mut SessionTracker, update: LocationUpdate) {
    if let Err(e) = tracker.on_location_update(update) {
        warn!("[Recorder] Dropping sample: {}", e);
    }
}
