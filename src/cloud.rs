// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cloud Forwarder: one TCP session to the upstream cloud per BOX session, with
//! FIFO request/response matching.
//!
//! The ordering discipline here is the same one `azure_iot_operations_mqtt`'s
//! `receiver::ordered_acker::OrderedAcker` uses to keep acks in order: a queue of
//! pending slots, each resolved in arrival order by a dedicated reader task, with
//! the caller awaiting its own slot. Here the slot is a single response instead of
//! an ack, and the reader closes the session outright on any ordering violation it
//! cannot recover from, since it can no longer trust the pairing once a waiter has
//! already given up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::frame::Frame;

/// The fixed ACK timeout: shorter values produced spurious fallbacks historically,
/// so this is not exposed as a tunable knob even though `cloud_ack_timeout_s` is
/// accepted (and ignored) as a configuration key.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(1800);

/// Outcome of a [`CloudForwarder::forward`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The cloud answered. Payload is empty for request classes that don't expect
    /// a reply.
    AckFromCloud(Bytes),
    /// No response arrived within the ack timeout.
    Timeout,
    /// The cloud connection was lost (EOF, idle disconnect, or read error) either
    /// before or while awaiting this frame's response.
    Disconnected,
    /// Could not establish (or re-establish) the upstream TCP connection.
    ConnectError,
    /// The cloud sent a reply that did not parse as a valid frame.
    ProtocolError,
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct CloudError(#[from] pub(crate) CloudErrorKind);

#[derive(Debug, Error)]
pub enum CloudErrorKind {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
enum ReadFailure {
    Eof,
    Malformed,
}

type PendingQueue = Arc<StdMutex<VecDeque<oneshot::Sender<Result<Bytes, ReadFailure>>>>>;

struct CloudSessionHandle {
    write_half: AsyncMutex<OwnedWriteHalf>,
    pending: PendingQueue,
    closed: Arc<AtomicBool>,
}

/// One upstream cloud connection, owned exclusively by a single BOX session.
pub struct CloudForwarder {
    target_host: String,
    target_port: u16,
    connect_timeout: Duration,
    ack_timeout: Duration,
    session: StdMutex<Option<Arc<CloudSessionHandle>>>,
}

impl CloudForwarder {
    #[must_use]
    pub fn new(target_host: impl Into<String>, target_port: u16, connect_timeout: Duration) -> Self {
        Self::with_ack_timeout(target_host, target_port, connect_timeout, ACK_TIMEOUT)
    }

    /// Escape hatch for tests only: the production entry point always uses
    /// [`ACK_TIMEOUT`], since `cloud_ack_timeout_s` overrides are ignored.
    #[must_use]
    #[doc(hidden)]
    pub fn with_ack_timeout(
        target_host: impl Into<String>,
        target_port: u16,
        connect_timeout: Duration,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            connect_timeout,
            ack_timeout,
            session: StdMutex::new(None),
        }
    }

    /// Forward `frame` to the cloud, dialing if necessary, and wait for its reply
    /// per the FIFO matching rule.
    pub async fn forward(&self, frame: &Frame) -> Outcome {
        let handle = match self.ensure_open().await {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("cloud connect failed: {e}");
                return Outcome::ConnectError;
            }
        };

        {
            let mut write_half = handle.write_half.lock().await;
            if let Err(e) = write_half.write_all(&frame.raw).await {
                log::warn!("cloud write failed: {e}");
                handle.closed.store(true, Ordering::SeqCst);
                return Outcome::Disconnected;
            }
        }

        if !expects_response(frame) {
            return Outcome::AckFromCloud(Bytes::new());
        }

        let (tx, rx) = oneshot::channel();
        handle.pending.lock().unwrap().push_back(tx);

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(Ok(bytes))) => Outcome::AckFromCloud(bytes),
            Ok(Ok(Err(ReadFailure::Malformed))) => Outcome::ProtocolError,
            Ok(Ok(Err(ReadFailure::Eof))) => Outcome::Disconnected,
            Ok(Err(_dropped)) => Outcome::Disconnected,
            Err(_elapsed) => Outcome::Timeout,
        }
    }

    async fn ensure_open(&self) -> Result<Arc<CloudSessionHandle>, CloudError> {
        {
            let guard = self.session.lock().unwrap();
            if let Some(handle) = guard.as_ref() {
                if !handle.closed.load(Ordering::SeqCst) {
                    return Ok(handle.clone());
                }
            }
        }

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.target_host.as_str(), self.target_port)),
        )
        .await
        .map_err(|_| CloudErrorKind::ConnectTimeout(self.connect_timeout))?
        .map_err(CloudErrorKind::Io)?;

        let (read_half, write_half) = stream.into_split();
        let pending: PendingQueue = Arc::new(StdMutex::new(VecDeque::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(reader_loop(read_half, pending.clone(), closed.clone()));

        let handle = Arc::new(CloudSessionHandle {
            write_half: AsyncMutex::new(write_half),
            pending,
            closed,
        });
        *self.session.lock().unwrap() = Some(handle.clone());
        Ok(handle)
    }
}

/// Whether forwarding `frame` to the cloud should await a reply. Upstream echoes of
/// our own `ACK` don't: the cloud never answers its own acknowledgement, the same
/// way the local responder treats an `ACK` echo as needing no reply.
fn expects_response(frame: &Frame) -> bool {
    !matches!(
        frame.kind,
        crate::frame::TableKind::Control(crate::frame::ControlVerb::Ack)
    )
}

async fn reader_loop(mut read_half: OwnedReadHalf, pending: PendingQueue, closed: Arc<AtomicBool>) {
    use tokio::io::AsyncReadExt;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                log::info!("cloud connection closed by peer (EOF)");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("cloud read error: {e}");
                break;
            }
        }

        loop {
            match crate::frame::codec::parse(&buf) {
                Ok(Some((frame, consumed))) => {
                    use bytes::Buf;
                    buf.advance(consumed);
                    let mut pending = pending.lock().unwrap();
                    if let Some(sender) = pending.pop_front() {
                        if sender.send(Ok(frame.raw)).is_err() {
                            // The waiter already timed out and dropped its receiver;
                            // we can no longer trust the FIFO pairing for anything
                            // still queued behind it.
                            log::warn!(
                                "cloud reply arrived after its waiter timed out; closing session"
                            );
                            closed.store(true, Ordering::SeqCst);
                            drain(&mut pending);
                            return;
                        }
                    } else {
                        log::warn!("unsolicited frame from cloud with no pending request");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("malformed frame from cloud: {e}");
                    closed.store(true, Ordering::SeqCst);
                    let mut pending = pending.lock().unwrap();
                    if let Some(sender) = pending.pop_front() {
                        let _ = sender.send(Err(ReadFailure::Malformed));
                    }
                    drain(&mut pending);
                    return;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    let mut pending = pending.lock().unwrap();
    drain(&mut pending);
}

fn drain(pending: &mut VecDeque<oneshot::Sender<Result<Bytes, ReadFailure>>>) {
    for sender in pending.drain(..) {
        let _ = sender.send(Err(ReadFailure::Eof));
    }
}
