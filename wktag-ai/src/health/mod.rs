//! Health telemetry protocol
//!
//! Workers write one [`HealthFrame`] per `frame_interval` as a JSON line on
//! their stdout; the supervisor runs one [`spawn_frame_reader`] task per
//! worker that parses those lines and forwards them as [`ChannelEvent`]s.
//!
//! This layer only parses and forwards. It never starts or terminates
//! processes; lifecycle decisions belong to the supervisor.

mod channel;
mod frame;

pub use channel::{spawn_frame_reader, ChannelEvent, FrameWriter};
pub use frame::{decode_frame, encode_frame, HealthFrame, Phase};
pub use wktag_common::events::HealthStatus;
