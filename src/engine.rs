// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Session Engine: the per-connection read/decide/respond loop.
//!
//! One [`BoxSession`] owns one accepted BOX connection end to end: its
//! [`ModeController`], [`CloudForwarder`], and [`LocalResponder`] are all
//! exclusively its own, so there is no cross-session locking on the hot path —
//! the same per-connection ownership `azure_iot_operations_mqtt`'s `Session`
//! uses for its reconnect state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::cloud::{CloudForwarder, Outcome};
use crate::config::ProxyConfig;
use crate::events::{Event, EventBus, FrameOutcome};
use crate::frame::codec::FrameCodec;
use crate::frame::Frame;
use crate::mode::{Decision, ModeController};
use crate::responder::{LocalReply, LocalResponder};

#[derive(Debug, Error)]
#[error(transparent)]
pub struct EngineError(#[from] pub(crate) EngineErrorKind);

#[derive(Debug, Error)]
pub enum EngineErrorKind {
    #[error("malformed frame from BOX, closing session: {0}")]
    MalformedFrame(#[source] crate::frame::FrameError),
    #[error("failed writing reply to BOX: {0}")]
    WriteFailed(#[source] crate::frame::FrameError),
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One accepted BOX connection, from first byte to close.
pub struct BoxSession {
    id: u64,
    peer: SocketAddr,
    device_id: Option<String>,
    started_at: Instant,
    frames_in: u64,
    mode: ModeController,
    cloud: CloudForwarder,
    responder: LocalResponder,
    events: EventBus,
}

impl BoxSession {
    #[must_use]
    pub fn new(peer: SocketAddr, config: &ProxyConfig, events: EventBus) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            peer,
            device_id: config.device_id.clone(),
            started_at: Instant::now(),
            frames_in: 0,
            mode: ModeController::new(
                config.configured_mode,
                config.hybrid_fail_threshold,
                config.hybrid_retry_interval,
            ),
            cloud: CloudForwarder::new(
                config.target_host.clone(),
                config.target_port,
                config.hybrid_connect_timeout,
            ),
            responder: LocalResponder::new(),
            events,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drive the session to completion: read frames from `stream`, decide and
    /// respond to each, until the BOX disconnects or sends something malformed.
    pub async fn run(mut self, stream: TcpStream) -> Result<(), EngineError> {
        self.events.publish(Event::SessionOpened {
            session_id: self.id,
            peer: self.peer.to_string(),
        });

        let mut framed = Framed::new(stream, FrameCodec);
        let result = self.drive(&mut framed).await;

        let duration = self.started_at.elapsed();
        self.events.publish(Event::SessionClosed {
            session_id: self.id,
            frames_in: self.frames_in,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        });
        log::info!(
            "session {} with peer {} closed after {:?}",
            self.id,
            self.peer,
            duration
        );
        result
    }

    async fn drive(&mut self, framed: &mut Framed<TcpStream, FrameCodec>) -> Result<(), EngineError> {
        loop {
            let frame = match framed.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(EngineErrorKind::MalformedFrame(e).into()),
                None => return Ok(()),
            };
            self.frames_in += 1;

            if self.device_id.is_none() {
                self.device_id = frame.device_id.clone();
            }

            self.events.publish(Event::FrameReceived {
                session_id: self.id,
                table_name: frame.table_name().to_string(),
                device_id: frame.device_id.clone(),
                reason: frame.reason.clone(),
                crc_ok: frame.crc_ok,
            });

            let frame_started_at = Instant::now();
            let (reply, outcome) = self.handle(&frame).await;
            let rtt_ms = u64::try_from(frame_started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
            if let Some(reply) = reply {
                framed.send(reply).await.map_err(EngineErrorKind::WriteFailed)?;
            }
            self.events.publish(Event::FrameHandled {
                session_id: self.id,
                table_name: frame.table_name().to_string(),
                outcome,
                rtt_ms,
            });
        }
    }

    /// Decide and produce this frame's reply. Returns the raw bytes to write back,
    /// if any, and how the frame was ultimately answered.
    async fn handle(&mut self, frame: &Frame) -> (Option<Bytes>, FrameOutcome) {
        match self.mode.decide() {
            Decision::RespondLocally => self.respond_locally(frame),
            Decision::AttemptCloud => match self.cloud.forward(frame).await {
                Outcome::AckFromCloud(bytes) => {
                    self.mode.record_success();
                    if bytes.is_empty() {
                        (None, FrameOutcome::NoResponse)
                    } else {
                        (Some(bytes), FrameOutcome::CloudAck)
                    }
                }
                Outcome::Timeout | Outcome::Disconnected | Outcome::ConnectError | Outcome::ProtocolError => {
                    if let Some(transition) = self.mode.record_failure() {
                        self.events.publish(Event::ModeTransition {
                            session_id: self.id,
                            configured: self.mode.configured(),
                            from: transition.from,
                            to: transition.to,
                            fail_count: transition.fail_count,
                        });
                    }
                    self.respond_locally(frame)
                }
            },
        }
    }

    fn respond_locally(&mut self, frame: &Frame) -> (Option<Bytes>, FrameOutcome) {
        let now_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let now_utc = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        match self.responder.respond(frame, Some((&now_local, &now_utc))) {
            LocalReply::None => (None, FrameOutcome::NoResponse),
            LocalReply::One(reply) | LocalReply::QueuedSetting(reply) => {
                let outcome = if reply.table_name() == "END" {
                    FrameOutcome::LocalEnd
                } else {
                    FrameOutcome::LocalAck
                };
                (Some(reply.raw), outcome)
            }
        }
    }
}

/// Maximum time a single BOX connection may sit idle with no frame at all before
/// the listener closes it.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ConfiguredMode;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn offline_config(target_port: u16) -> ProxyConfig {
        ProxyConfig {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            target_host: "127.0.0.1".to_string(),
            target_port,
            configured_mode: ConfiguredMode::Offline,
            hybrid_fail_threshold: 3,
            hybrid_retry_interval: Duration::from_secs(60),
            hybrid_connect_timeout: Duration::from_secs(1),
            device_id: None,
        }
    }

    #[tokio::test]
    async fn offline_mode_answers_end_locally_without_touching_cloud() {
        let config = offline_config(1);
        let events = EventBus::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let session_peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let session = BoxSession::new(session_peer, &config, events);

        let client = tokio::spawn(async move {
            let raw = crate::frame::codec::encode_body("END", Some("SN1"), None, &[]);
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&raw).await.unwrap();
            let mut buf = BytesMut::with_capacity(256);
            let mut tmp = [0u8; 256];
            let n = stream.read(&mut tmp).await.unwrap();
            buf.extend_from_slice(&tmp[..n]);
            buf
        });

        let (accepted, _) = listener.accept().await.unwrap();
        session.run(accepted).await.ok();

        let reply = client.await.unwrap();
        let (parsed, _) = crate::frame::codec::parse(&reply).unwrap().unwrap();
        assert_eq!(parsed.table_name(), "ACK");
    }
}
