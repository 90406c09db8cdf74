// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Canonical local-reply construction.
//!
//! `build_ack` and `build_end` are pure functions of their arguments: the same
//! inputs always produce the same bytes, which is what lets the BOX accept a
//! locally-synthesized reply as silently as a real cloud reply.

use bytes::Bytes;

use super::codec::encode_body;
use super::{Frame, TableKind};

/// Optional fields carried on a synthesized `END` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndOptions {
    /// Local time string, included when `Some`.
    pub time: Option<String>,
    /// UTC time string, included when `Some`.
    pub utc_time: Option<String>,
    /// Whether to append the trailing `GetActual` marker.
    pub get_actual: bool,
}

impl EndOptions {
    /// `Time` + `UTCTime` + `GetActual`, as used to answer `IsNewSet`.
    #[must_use]
    pub fn with_time(time: impl Into<String>, utc_time: impl Into<String>) -> Self {
        Self {
            time: Some(time.into()),
            utc_time: Some(utc_time.into()),
            get_actual: true,
        }
    }
}

/// Build the canonical local `ACK` reply for `device_id`/`reason`.
#[must_use]
pub fn build_ack(device_id: Option<&str>, reason: Option<&str>) -> Frame {
    let raw = encode_body("ACK", device_id, reason, &[]);
    frame_from_raw(raw, "ACK", device_id, reason)
}

/// Build the canonical local `END` reply for `device_id`, optionally carrying time
/// fields and the `GetActual` marker.
#[must_use]
pub fn build_end(device_id: Option<&str>, options: &EndOptions) -> Frame {
    let mut payload = Vec::new();
    if let Some(time) = &options.time {
        payload.push(("Time", time.as_str()));
    }
    if let Some(utc_time) = &options.utc_time {
        payload.push(("UTCTime", utc_time.as_str()));
    }
    if options.get_actual {
        payload.push(("GetActual", "1"));
    }

    let raw = encode_body("END", device_id, None, &payload);
    let mut frame = frame_from_raw(raw, "END", device_id, None);
    frame.payload = payload
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    frame
}

fn frame_from_raw(raw: Bytes, table_name: &str, device_id: Option<&str>, reason: Option<&str>) -> Frame {
    Frame {
        kind: TableKind::from_table_name(table_name),
        device_id: device_id.map(str::to_string),
        reason: reason.map(str::to_string),
        payload: Vec::new(),
        raw,
        crc_ok: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::codec::parse;
    use bytes::BytesMut;

    #[test]
    fn build_ack_is_a_pure_function_of_its_arguments() {
        let a = build_ack(Some("SN001"), Some("Table"));
        let b = build_ack(Some("SN001"), Some("Table"));
        assert_eq!(a.raw, b.raw);
    }

    #[test]
    fn build_ack_varies_with_device_id() {
        let a = build_ack(Some("SN001"), None);
        let b = build_ack(Some("SN002"), None);
        assert_ne!(a.raw, b.raw);
    }

    #[test]
    fn synthesized_ack_crc_verifies() {
        let frame = build_ack(Some("SN001"), Some("Table"));
        let buf = BytesMut::from(&frame.raw[..]);
        let (parsed, _) = parse(&buf).unwrap().unwrap();
        assert!(parsed.crc_ok);
        assert_eq!(parsed.table_name(), "ACK");
    }

    #[test]
    fn synthesized_end_with_time_crc_verifies_and_round_trips() {
        let options = EndOptions::with_time("2026-07-30T00:00:00", "2026-07-30T00:00:00Z");
        let frame = build_end(Some("SN001"), &options);
        let buf = BytesMut::from(&frame.raw[..]);
        let (parsed, _) = parse(&buf).unwrap().unwrap();
        assert!(parsed.crc_ok);
        assert_eq!(parsed.table_name(), "END");
        assert!(parsed.payload.iter().any(|(k, _)| k == "Time"));
        assert!(parsed.payload.iter().any(|(k, _)| k == "UTCTime"));
        assert!(parsed.payload.iter().any(|(k, v)| k == "GetActual" && v == "1"));
    }

    #[test]
    fn bare_end_carries_no_optional_fields() {
        let frame = build_end(Some("SN001"), &EndOptions::default());
        assert!(frame.payload.is_empty());
    }
}
