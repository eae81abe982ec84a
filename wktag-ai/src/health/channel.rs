//! Per-worker channel reader (supervisor side) and frame writer (worker side)

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::frame::{decode_frame, encode_frame, HealthFrame};
use crate::error::{TaggerError, TaggerResult};

/// What a channel reader reports to the supervisor
///
/// `generation` identifies the worker incarnation the channel belongs to, so
/// late events from a replaced process are recognisable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame {
        component_id: String,
        generation: u64,
        frame: HealthFrame,
    },
    /// EOF (`reason == None`) or read failure
    Closed {
        component_id: String,
        generation: u64,
        reason: Option<String>,
    },
}

impl ChannelEvent {
    pub fn component_id(&self) -> &str {
        match self {
            ChannelEvent::Frame { component_id, .. } | ChannelEvent::Closed { component_id, .. } => {
                component_id
            }
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            ChannelEvent::Frame { generation, .. } | ChannelEvent::Closed { generation, .. } => {
                *generation
            }
        }
    }
}

/// Spawn the reader task for one worker's channel
///
/// Each worker gets its own task so a slow or stuck worker never delays
/// status updates from the others. Malformed lines are logged and skipped;
/// frames claiming another component's id are dropped.
pub fn spawn_frame_reader<R>(
    component_id: String,
    generation: u64,
    channel: R,
    events: mpsc::UnboundedSender<ChannelEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(channel).lines();

        let reason = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let frame = match decode_frame(&line) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(component_id = %component_id, error = %e, "Skipping malformed health frame");
                            continue;
                        }
                    };
                    if frame.component_id != component_id {
                        warn!(
                            component_id = %component_id,
                            claimed = %frame.component_id,
                            "Dropping frame with mismatched component id"
                        );
                        continue;
                    }
                    let event = ChannelEvent::Frame {
                        component_id: component_id.clone(),
                        generation,
                        frame,
                    };
                    if events.send(event).is_err() {
                        // Supervisor loop has gone away; nothing left to report to
                        return;
                    }
                }
                Ok(None) => break None,
                Err(e) => break Some(e.to_string()),
            }
        };

        debug!(component_id = %component_id, generation, ?reason, "Health channel closed");
        let _ = events.send(ChannelEvent::Closed {
            component_id,
            generation,
            reason,
        });
    })
}

/// Worker-side frame writer with a bounded write timeout
///
/// A write that fails or does not complete within the timeout means the
/// supervisor is gone (or wedged); the caller treats it as
/// [`TaggerError::ParentUnreachable`].
pub struct FrameWriter<W> {
    sink: W,
    write_timeout: Duration,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(sink: W, write_timeout: Duration) -> Self {
        Self {
            sink,
            write_timeout,
        }
    }

    /// Write one frame and flush
    pub async fn send(&mut self, frame: &HealthFrame) -> TaggerResult<()> {
        let line = encode_frame(frame)?;

        let write = async {
            self.sink.write_all(line.as_bytes()).await?;
            self.sink.flush().await
        };

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TaggerError::ParentUnreachable(format!("frame write failed: {}", e))),
            Err(_) => Err(TaggerError::ParentUnreachable(format!(
                "frame write timed out after {} ms",
                self.write_timeout.as_millis()
            ))),
        }
    }
}
