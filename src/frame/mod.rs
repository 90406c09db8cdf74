// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The OIG frame data model, wire codec, and canonical local-reply synthesizer.
//!
//! A [`Frame`] is parsed once into a tagged [`TableKind`] (control verb vs. data
//! table): dispatch downstream is by `match`, not by repeated string lookups on
//! the hot path, while the original table-name string is retained on [`Frame`]
//! for observability.

pub mod codec;
pub mod crc;
pub mod synth;

use bytes::Bytes;
use thiserror::Error;

/// The reserved control verbs recognized on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlVerb {
    /// Terminates a request/poll; may carry `Time`/`UTCTime`.
    End,
    /// Acknowledges a prior frame.
    Ack,
    /// BOX polls for a new setting.
    IsNewSet,
    /// BOX polls for new firmware.
    IsNewFw,
    /// BOX polls for new weather data.
    IsNewWeather,
}

impl ControlVerb {
    /// Recognize a table-name string as a reserved control verb, if it is one.
    #[must_use]
    pub fn recognize(table_name: &str) -> Option<Self> {
        match table_name {
            "END" => Some(Self::End),
            "ACK" => Some(Self::Ack),
            "IsNewSet" => Some(Self::IsNewSet),
            "IsNewFW" => Some(Self::IsNewFw),
            "IsNewWeather" => Some(Self::IsNewWeather),
            _ => None,
        }
    }

    /// The canonical wire spelling of this verb.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::End => "END",
            Self::Ack => "ACK",
            Self::IsNewSet => "IsNewSet",
            Self::IsNewFw => "IsNewFW",
            Self::IsNewWeather => "IsNewWeather",
        }
    }
}

/// The table-name's dispatch-relevant shape: a reserved control verb, or an opaque
/// data table name (`tbl_actual`, `tbl_box_prms`, `tbl_events`, or any unrecognized
/// verb, which is treated as a data table).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKind {
    Control(ControlVerb),
    Data(String),
}

impl TableKind {
    #[must_use]
    pub fn from_table_name(table_name: &str) -> Self {
        match ControlVerb::recognize(table_name) {
            Some(verb) => Self::Control(verb),
            None => Self::Data(table_name.to_string()),
        }
    }

    /// The original wire string for this table name, for observability.
    #[must_use]
    pub fn table_name(&self) -> &str {
        match self {
            Self::Control(verb) => verb.as_str(),
            Self::Data(name) => name,
        }
    }

    /// True for any `tbl_*_prms` configuration-echo table.
    #[must_use]
    pub fn is_prms_table(&self) -> bool {
        match self {
            Self::Data(name) => name.starts_with("tbl_") && name.ends_with("_prms"),
            Self::Control(_) => false,
        }
    }

    /// True for any other `tbl_*` data table.
    #[must_use]
    pub fn is_data_table(&self) -> bool {
        matches!(self, Self::Data(name) if name.starts_with("tbl_"))
    }
}

/// One complete protocol message, parsed from or destined for the wire.
///
/// `raw` is always the exact bytes that were received (or synthesized); it is never
/// re-serialized before being forwarded upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: TableKind,
    pub device_id: Option<String>,
    pub reason: Option<String>,
    pub payload: Vec<(String, String)>,
    pub raw: Bytes,
    pub crc_ok: bool,
}

impl Frame {
    #[must_use]
    pub fn table_name(&self) -> &str {
        self.kind.table_name()
    }
}

/// Error type for [`codec::parse`]. The kind is public so callers can match on it
/// without downcasting (mirrors `azure_iot_operations_mqtt`'s `SessionError`/
/// `SessionErrorKind` split).
#[derive(Debug, Error)]
#[error(transparent)]
pub struct FrameError(#[from] pub(crate) FrameErrorKind);

impl FrameError {
    #[must_use]
    pub fn kind(&self) -> &FrameErrorKind {
        &self.0
    }
}

// `tokio_util::codec::Framed`'s `Sink` impl requires `Encoder::Error: From<io::Error>`
// so that a failed socket write can be reported through the same error type as a
// decode failure.
impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameErrorKind::Io(e).into()
    }
}

#[derive(Debug, Error)]
pub enum FrameErrorKind {
    /// Buffer does not yet contain a complete frame; caller should read more bytes.
    #[error("incomplete frame, need more bytes")]
    IncompleteFrame,
    /// Frame is syntactically invalid; caller should close the session.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// The underlying socket failed while writing a reply.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
