// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Listener: accepts BOX connections and spawns one [`BoxSession`] per socket.
//!
//! The accept loop's `tokio::select! { biased; ... }` against a shutdown signal
//! follows the same shape as `azure_iot_operations_mqtt`'s `Session::run`, which
//! checks its force-exit notification ahead of the next event on every iteration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::engine::BoxSession;
use crate::events::EventBus;

/// Connections beyond this count are refused outright rather than queued: a
/// small, bounded backlog, then refuse.
const MAX_CONCURRENT_SESSIONS: usize = 64;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct ListenerError(#[from] pub(crate) ListenerErrorKind);

#[derive(Debug, Error)]
pub enum ListenerErrorKind {
    #[error("failed to bind {0}: {1}")]
    Bind(String, #[source] std::io::Error),
    #[error("accept loop failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// Runs the accept loop until `shutdown` is cancelled. Each accepted connection is
/// handed to its own spawned [`BoxSession`].
pub async fn run(config: Arc<ProxyConfig>, events: EventBus, shutdown: CancellationToken) -> Result<(), ListenerError> {
    let bind_addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| ListenerErrorKind::Bind(bind_addr.clone(), e))?;
    log::info!("listening on {bind_addr}");

    let active = Arc::new(AtomicUsize::new(0));

    loop {
        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                log::info!("listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };

        if active.load(Ordering::Acquire) >= MAX_CONCURRENT_SESSIONS {
            log::warn!("refusing connection from {peer}: at capacity ({MAX_CONCURRENT_SESSIONS})");
            drop(stream);
            continue;
        }

        let session = BoxSession::new(peer, &config, events.clone());
        let session_id = session.id();
        let active = active.clone();
        active.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            log::info!("session {session_id} accepted from {peer}");
            if let Err(e) = session.run(stream).await {
                log::warn!("session {session_id} ended with error: {e}");
            }
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }
}
