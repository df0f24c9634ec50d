// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::aggregator_service::AggregatorHandle;
use crate::config::Config;
use crate::http_utils::{
    client_ip, create_text_response, log_and_create_json_response, verify_request_content_length,
    HttpResponse,
};
use crate::lifecycle::BatchController;
use crate::record::{validate, LogRecord};

const LOG_ENDPOINT_PATH: &str = "/log";
const HEALTH_ENDPOINT_PATH: &str = "/healthz";
const LISTEN_HOST: [u8; 4] = [0, 0, 0, 0];

/// HTTP front end: accepts records on `POST /log` and answers `GET /healthz`.
#[derive(Clone)]
pub struct LogReceiver {
    pub config: Arc<Config>,
    pub aggregator: AggregatorHandle,
    pub controller: Arc<BatchController>,
    pub shutdown: CancellationToken,
}

impl LogReceiver {
    /// Binds `0.0.0.0:<port>` and serves until the shutdown token is cancelled.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from((LISTEN_HOST, self.config.port));
        let listener = TcpListener::bind(&addr).await?;
        debug!("Log receiver listening on {addr}");
        self.serve(listener).await
    }

    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let (conn, peer) = tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("Log receiver shutting down");
                    joinset.abort_all();
                    return Ok(());
                }
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok(accepted) => accepted,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };

            let receiver = self.clone();
            let service = service_fn(move |req| {
                let receiver = receiver.clone();
                async move { receiver.handle(req, peer).await }
            });
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Connection error: {e}");
                }
            });
        }
    }

    /// Routes one request.
    pub async fn handle<B>(&self, req: Request<B>, peer: SocketAddr) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let client = client_ip(peer, req.headers(), &self.config.trusted_proxy);
        debug!("{} {} from {client}", req.method(), req.uri().path());

        match (req.method(), req.uri().path()) {
            (&Method::POST, LOG_ENDPOINT_PATH) => self.log_handler(req).await,
            (&Method::GET, HEALTH_ENDPOINT_PATH) => create_text_response("OK", StatusCode::OK),
            _ => log_and_create_json_response("error", "Not found", StatusCode::NOT_FOUND),
        }
    }

    async fn log_handler<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let max_content_length = self.config.max_request_content_length;
        if let Some(response) =
            verify_request_content_length(req.headers(), max_content_length, "Error storing log")
        {
            return response;
        }

        let body = match Limited::new(req.into_body(), max_content_length)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                return log_and_create_json_response(
                    "error",
                    "Error storing log: Payload too large",
                    StatusCode::PAYLOAD_TOO_LARGE,
                );
            }
            Err(e) => {
                return log_and_create_json_response(
                    "error",
                    &format!("Error storing log: unable to read body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let record = match LogRecord::from_slice(&body).and_then(validate) {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to store log: {e}");
                return log_and_create_json_response(
                    "error",
                    &e.to_string(),
                    StatusCode::INTERNAL_SERVER_ERROR,
                );
            }
        };

        match self.aggregator.put(record).await {
            Ok(size) => debug!("Log stored, {size} users waiting for the next batch"),
            Err(e) => {
                error!("Failed to store log: {e}");
                return log_and_create_json_response(
                    "error",
                    &e.to_string(),
                    StatusCode::INTERNAL_SERVER_ERROR,
                );
            }
        }

        // size stimulus runs off the request path so delivery never delays the response
        let controller = Arc::clone(&self.controller);
        tokio::spawn(async move {
            if let Err(e) = controller.on_ingest().await {
                warn!("Failed to send batch: {e}");
            }
        });

        log_and_create_json_response("success", "Log successfully stored", StatusCode::OK)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregator_service::AggregatorService;
    use crate::errors::DeliveryError;
    use crate::flusher::{BatchDelivery, DeliveryStats};
    use crate::lifecycle::FailurePolicy;
    use crate::record::Batch;
    use crate::trigger::BatchTrigger;
    use async_trait::async_trait;
    use http_body_util::Full;
    use hyper::body::Frame;
    use hyper::header;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::Duration;

    const DEFAULT_TOO_LARGE: usize = crate::config::DEFAULT_MAX_CONTENT_LENGTH + 1;

    #[derive(Default)]
    struct RecordingDelivery {
        batches: Mutex<Vec<Batch>>,
    }

    #[async_trait]
    impl BatchDelivery for RecordingDelivery {
        async fn deliver(&self, batch: &Batch) -> Result<DeliveryStats, DeliveryError> {
            self.batches.lock().unwrap().push(batch.clone());
            Ok(DeliveryStats {
                duration: Duration::ZERO,
                status_code: StatusCode::OK,
            })
        }
    }

    fn receiver(batch_size: usize) -> (LogReceiver, Arc<RecordingDelivery>) {
        let (service, aggregator) = AggregatorService::new();
        tokio::spawn(service.run());
        let delivery = Arc::new(RecordingDelivery::default());
        let shutdown = CancellationToken::new();
        let controller = Arc::new(BatchController::new(
            aggregator.clone(),
            delivery.clone(),
            BatchTrigger::new(batch_size, 10, 10),
            FailurePolicy::Requeue,
            shutdown.clone(),
        ));
        let receiver = LogReceiver {
            config: Arc::new(Config {
                post_endpoint: "http://collector/logs".to_string(),
                batch_size,
                ..Config::default()
            }),
            aggregator,
            controller,
            shutdown,
        };
        (receiver, delivery)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn post_log(body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(LOG_ENDPOINT_PATH)
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_string(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let (receiver, _) = receiver(20);
        let req = Request::builder()
            .method(Method::GET)
            .uri(HEALTH_ENDPOINT_PATH)
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = receiver.handle(req, peer()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn test_post_log_stores_record() {
        let (receiver, _) = receiver(20);

        let response = receiver
            .handle(post_log(r#"{"user_id": 1, "title": "t"}"#), peer())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_string(response).await,
            r#"{"success":"Log successfully stored"}"#
        );
        assert_eq!(receiver.aggregator.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_post_log_without_user_id_is_rejected() {
        let (receiver, _) = receiver(20);

        let response = receiver
            .handle(post_log(r#"{"title": "nobody"}"#), peer())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_string(response).await,
            r#"{"error":"UserID is required"}"#
        );
        assert_eq!(receiver.aggregator.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_post_log_malformed_body_is_rejected() {
        let (receiver, _) = receiver(20);

        let response = receiver.handle(post_log("{"), peer()).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response).await.contains("Invalid log payload"));
    }

    #[tokio::test]
    async fn test_post_log_too_large() {
        let (receiver, _) = receiver(20);
        let req = Request::builder()
            .method(Method::POST)
            .uri(LOG_ENDPOINT_PATH)
            .header(header::CONTENT_LENGTH, DEFAULT_TOO_LARGE)
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = receiver.handle(req, peer()).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    /// A body whose read fails, as when the client goes away mid-request.
    struct BrokenBody;

    impl Body for BrokenBody {
        type Data = Bytes;
        type Error = io::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "client went away",
            ))))
        }
    }

    #[tokio::test]
    async fn test_chunked_body_over_limit_is_too_large() {
        let (mut receiver, _) = receiver(20);
        receiver.config = Arc::new(Config {
            max_request_content_length: 8,
            ..(*receiver.config).clone()
        });
        let req = Request::builder()
            .method(Method::POST)
            .uri(LOG_ENDPOINT_PATH)
            .header(header::TRANSFER_ENCODING, "chunked")
            .body(Full::new(Bytes::from_static(br#"{"user_id": 12345}"#)))
            .unwrap();

        let response = receiver.handle(req, peer()).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(receiver.aggregator.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_body_read_error_is_bad_request() {
        let (receiver, _) = receiver(20);
        let req = Request::builder()
            .method(Method::POST)
            .uri(LOG_ENDPOINT_PATH)
            .header(header::TRANSFER_ENCODING, "chunked")
            .body(BrokenBody)
            .unwrap();

        let response = receiver.handle(req, peer()).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("client went away"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (receiver, _) = receiver(20);
        let req = Request::builder()
            .method(Method::GET)
            .uri("/log")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = receiver.handle(req, peer()).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_second_record_reaching_batch_size_triggers_flush() {
        let (receiver, delivery) = receiver(2);

        let first = receiver
            .handle(post_log(r#"{"user_id": 1}"#), peer())
            .await
            .unwrap();
        let second = receiver
            .handle(post_log(r#"{"user_id": 2}"#), peer())
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);

        // the flush runs on a spawned task
        for _ in 0..100 {
            if !delivery.batches.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let batches = delivery.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }
}
