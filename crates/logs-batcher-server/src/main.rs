// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logs_batcher::{
    aggregator_service::AggregatorService,
    config::Config,
    flusher::HttpFlusher,
    lifecycle::{BatchController, LifecycleState},
    receiver::LogReceiver,
    trigger::BatchTrigger,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = Config::from_env();

    let log_level = match &config {
        Ok(config) => config.log_level.clone(),
        Err(_) => "info".to_string(),
    };
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Error creating config on logs batcher startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (service, aggregator) = AggregatorService::new();
    tokio::spawn(service.run());

    let shutdown = CancellationToken::new();
    let controller = Arc::new(BatchController::new(
        aggregator.clone(),
        Arc::new(HttpFlusher::from_config(&config)),
        BatchTrigger::new(
            config.batch_size,
            config.batch_interval,
            config.check_frequency,
        ),
        config.failure_policy,
        shutdown.clone(),
    ));

    let timer = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run_timer().await })
    };

    let receiver = LogReceiver {
        config: Arc::clone(&config),
        aggregator: aggregator.clone(),
        controller: Arc::clone(&controller),
        shutdown: shutdown.clone(),
    };
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = receiver.start().await {
                error!("Error when starting log receiver: {e:?}");
                shutdown.cancel();
            }
        })
    };

    info!(
        port = config.port,
        endpoint = %config.post_endpoint,
        "Logs batcher started"
    );

    tokio::select! {
        () = shutdown.cancelled() => {}
        () = shutdown_signal() => {
            info!("Shutdown signal received, stopping logs batcher");
            shutdown.cancel();
        }
    }

    let _ = tokio::join!(timer, server);
    if let Err(e) = aggregator.shutdown() {
        debug!("Aggregator service already stopped: {e}");
    }

    if controller.state() == LifecycleState::Terminated {
        error!("Logs batcher terminated after a failed delivery");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
