//! Worker-side health reporting
//!
//! The heartbeat task is the only writer of the health channel. The
//! processing loop publishes what it is doing through a `watch` channel and
//! never waits on the channel itself, so a slow unit cannot delay frames.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wktag_common::events::HealthStatus;

use crate::health::{FrameWriter, HealthFrame, Phase};
use crate::supervisor::STOP_COMMAND;

/// What the worker is doing right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub status: HealthStatus,
    pub phase: Phase,
    pub current_unit_id: Option<String>,
}

impl Activity {
    pub fn new(status: HealthStatus, phase: Phase) -> Self {
        Self {
            status,
            phase,
            current_unit_id: None,
        }
    }

    pub fn initializing() -> Self {
        Self::new(HealthStatus::Pending, Phase::Initializing)
    }

    pub fn processing(unit_id: &str) -> Self {
        Self {
            status: HealthStatus::Healthy,
            phase: Phase::Processing,
            current_unit_id: Some(unit_id.to_string()),
        }
    }
}

/// Emit a frame every `interval` and whenever the activity changes
///
/// A write failure means the supervisor is gone: `parent_gone` is cancelled
/// and the task ends. When the activity sender is dropped the latest
/// activity is flushed once more before returning.
pub fn spawn_heartbeat<W>(
    component_id: String,
    mut writer: FrameWriter<W>,
    mut activity: watch::Receiver<Activity>,
    interval: Duration,
    parent_gone: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let started = Instant::now();
        let mut seq: u64 = 0;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_sent: Option<Activity> = None;

        loop {
            let closed = tokio::select! {
                _ = ticker.tick() => false,
                changed = activity.changed() => changed.is_err(),
            };

            let current = activity.borrow_and_update().clone();
            if closed && last_sent.as_ref() == Some(&current) {
                break;
            }

            seq += 1;
            let frame = HealthFrame::new(&component_id, current.status, started.elapsed().as_millis() as u64)
                .with_phase(current.phase)
                .with_unit(current.current_unit_id.clone())
                .with_seq(seq);

            if let Err(e) = writer.send(&frame).await {
                warn!(component_id = %component_id, error = %e, "Supervisor unreachable, finishing up");
                parent_gone.cancel();
                break;
            }
            last_sent = Some(current);

            if closed {
                break;
            }
        }
        debug!(component_id = %component_id, frames = seq, "Heartbeat stopped");
    })
}

/// Watch the control input for a stop command or EOF
///
/// Either one cancels `shutdown`; the worker then finishes its current unit.
pub fn spawn_stop_listener<R>(control: R, shutdown: CancellationToken) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(control).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim() == STOP_COMMAND => {
                    info!("Stop requested by supervisor");
                    break;
                }
                Ok(Some(other)) => {
                    debug!(line = %other, "Ignoring unknown control line");
                }
                Ok(None) => {
                    warn!("Control input closed, supervisor presumed gone");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Control input failed, supervisor presumed gone");
                    break;
                }
            }
        }
        shutdown.cancel();
    })
}
