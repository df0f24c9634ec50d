// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use logs_batcher::{
    aggregator_service::{AggregatorHandle, AggregatorService},
    config::Config,
    flusher::HttpFlusher,
    lifecycle::BatchController,
    receiver::LogReceiver,
    trigger::BatchTrigger,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// A receiver, aggregator and controller wired together the way the server binary does it.
pub struct TestStack {
    pub port: u16,
    pub aggregator: AggregatorHandle,
    pub controller: Arc<BatchController>,
    pub shutdown: CancellationToken,
    pub server: JoinHandle<()>,
}

pub fn test_config(post_endpoint: String) -> Config {
    Config {
        post_endpoint,
        retry_wait: Duration::from_millis(10),
        request_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Starts the full stack on an ephemeral loopback port.
pub async fn start_stack(config: Config) -> TestStack {
    let config = Arc::new(config);
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

    {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run_timer().await });
    }

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let port = listener.local_addr().expect("No local address").port();

    let receiver = LogReceiver {
        config,
        aggregator: aggregator.clone(),
        controller: Arc::clone(&controller),
        shutdown: shutdown.clone(),
    };
    let server = tokio::spawn(async move {
        receiver
            .serve(listener)
            .await
            .expect("Log receiver failed");
    });

    TestStack {
        port,
        aggregator,
        controller,
        shutdown,
        server,
    }
}

/// Send an HTTP request over TCP and return the status and body
pub async fn send_tcp_request(
    port: u16,
    uri: &str,
    method: &str,
    body: Option<&str>,
) -> Result<(StatusCode, String), Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", format!("127.0.0.1:{}", port))
        .header("Content-Type", "application/json");

    let body_data = body.unwrap_or_default().to_string();
    request_builder = request_builder.header("Content-Length", body_data.len().to_string());
    let request = request_builder.body(Full::new(Bytes::from(body_data)))?;
    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;

    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8(bytes.to_vec())?))
}

/// Polls `check` until it holds or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
