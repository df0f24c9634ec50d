// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    header,
    http::{self, HeaderMap, HeaderValue},
    Response, StatusCode,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

pub type HttpResponse = Response<Full<Bytes>>;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Returns `{"<key>": message}` with the given status code.
///
/// Non-success statuses are logged at warn level, the rest at debug.
pub fn log_and_create_json_response(
    key: &str,
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        warn!("{message}");
    }
    let body = json!({ key: message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Full::new(Bytes::from(body)))
}

pub fn create_text_response(body: &'static str, status: StatusCode) -> http::Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(Full::new(Bytes::from_static(body.as_bytes())))
}

/// Takes a request's header map, and verifies that the "content-length" and/or "Transfer-Encoding" header
/// is present, valid, and less than the given max_content_length.
///
/// Will return None if no issues are found. Otherwise returns an HTTP Response with the
/// appropriate error status code.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
    error_message_prefix: &str,
) -> Option<http::Result<HttpResponse>> {
    let Some(content_length_header) = header_map.get(header::CONTENT_LENGTH) else {
        if header_map.contains_key(header::TRANSFER_ENCODING) {
            return None;
        }
        return Some(log_and_create_json_response(
            "error",
            &format!("{error_message_prefix}: Missing Content-Length and Transfer-Encoding header"),
            StatusCode::LENGTH_REQUIRED,
        ));
    };
    let content_length = match content_length_header
        .to_str()
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        Some(res) => res,
        None => {
            return Some(log_and_create_json_response(
                "error",
                &format!("{error_message_prefix}: Invalid Content-Length header"),
                StatusCode::BAD_REQUEST,
            ));
        }
    };
    if content_length > max_content_length {
        return Some(log_and_create_json_response(
            "error",
            &format!("{error_message_prefix}: Payload too large"),
            StatusCode::PAYLOAD_TOO_LARGE,
        ));
    }
    None
}

/// Resolves the address a request originated from.
///
/// The first `X-Forwarded-For` entry is only believed when the connection
/// comes from `trusted_proxy`. `localhost` matches any loopback address.
pub fn client_ip(peer: SocketAddr, headers: &HeaderMap, trusted_proxy: &str) -> IpAddr {
    let peer_ip = peer.ip();
    if !is_trusted_proxy(peer_ip, trusted_proxy) {
        return peer_ip;
    }
    headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or(peer_ip)
}

fn is_trusted_proxy(ip: IpAddr, trusted_proxy: &str) -> bool {
    if trusted_proxy.eq_ignore_ascii_case("localhost") {
        return ip.is_loopback();
    }
    trusted_proxy
        .parse::<IpAddr>()
        .map_or(false, |trusted| trusted == ip)
}
