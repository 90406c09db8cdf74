// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::process::ExitCode;
use std::sync::Arc;

use oig_proxy::config::ProxyConfig;
use oig_proxy::events::EventBus;
use oig_proxy::listener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .init();

    let config = match ProxyConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            log::error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let events = EventBus::new();
    let shutdown = CancellationToken::new();

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("received interrupt, shutting down");
            ctrl_c_shutdown.cancel();
        }
    });

    match listener::run(config, events, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("listener failed: {e}");
            ExitCode::from(1)
        }
    }
}
