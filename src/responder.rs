// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Local Responder: decide whether a local reply must be synthesized, and which
//! one, for a given BOX frame.
//!
//! Settings are single-slot: at most one queued setting frame is held at a time.
//! Multi-slot delivery was left open and is resolved here (see DESIGN.md) as "not
//! implemented" — a BOX `ACK` with `reason = "Setting"` dequeues the single
//! pending slot rather than advancing through a list.

use std::sync::Mutex;

use crate::frame::synth::{build_ack, build_end, EndOptions};
use crate::frame::{ControlVerb, Frame, TableKind};

/// What the Session Engine should do with a Local Responder's reply.
pub enum LocalReply {
    /// No response is warranted for this frame.
    None,
    /// Send exactly one frame back to the BOX.
    One(Frame),
    /// Send the queued setting first, to be followed (on the BOX's confirming ACK)
    /// by a final ACK — see [`LocalResponder::settle_queued_setting`].
    QueuedSetting(Frame),
}

/// Holds at most one pending setting frame to push down to the BOX the next time a
/// `tbl_*` data frame with `reason = "Setting"` arrives.
#[derive(Default)]
pub struct LocalResponder {
    queued_setting: Mutex<Option<Frame>>,
}

impl LocalResponder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a setting frame to be delivered on the next matching request. Replaces
    /// any previously queued (undelivered) setting, since this responder is
    /// single-slot.
    pub fn queue_setting(&self, setting: Frame) {
        *self.queued_setting.lock().unwrap() = Some(setting);
    }

    /// Decide the local response for a parsed BOX frame.
    #[must_use]
    pub fn respond(&self, frame: &Frame, time: Option<(&str, &str)>) -> LocalReply {
        match &frame.kind {
            TableKind::Control(ControlVerb::End) => {
                LocalReply::One(build_ack(frame.device_id.as_deref(), frame.reason.as_deref()))
            }
            TableKind::Control(ControlVerb::IsNewSet) => {
                let options = match time {
                    Some((local, utc)) => EndOptions::with_time(local, utc),
                    None => EndOptions::default(),
                };
                LocalReply::One(build_end(frame.device_id.as_deref(), &options))
            }
            TableKind::Control(ControlVerb::IsNewFw | ControlVerb::IsNewWeather) => {
                LocalReply::One(build_end(frame.device_id.as_deref(), &EndOptions::default()))
            }
            TableKind::Control(ControlVerb::Ack) => {
                // Upstream echo of our own ACK: if a setting was in flight, this
                // confirming ACK dequeues it and we answer with a final ACK.
                if frame.reason.as_deref() == Some("Setting")
                    && self.queued_setting.lock().unwrap().take().is_some()
                {
                    return LocalReply::One(build_ack(
                        frame.device_id.as_deref(),
                        frame.reason.as_deref(),
                    ));
                }
                LocalReply::None
            }
            TableKind::Data(_) if frame.kind.is_prms_table() => {
                LocalReply::One(build_ack(frame.device_id.as_deref(), frame.reason.as_deref()))
            }
            TableKind::Data(_) => {
                if frame.reason.as_deref() == Some("Setting") {
                    if let Some(setting) = self.queued_setting.lock().unwrap().clone() {
                        return LocalReply::QueuedSetting(setting);
                    }
                }
                LocalReply::One(build_ack(frame.device_id.as_deref(), frame.reason.as_deref()))
            }
        }
    }
}
