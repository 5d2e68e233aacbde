// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Replays intercepted requests against their origin.

use super::fingerprint::Capture;
use super::{full, ProxyBody, ProxyContext};
use crate::classify;
use crate::connection::ConnectionMetadata;
use crate::fetch::{method_has_body, FetchError};
use http_body_util::BodyExt;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
};
use hyper::http::uri::Scheme;
use hyper::{Request, Response, StatusCode};
use std::collections::HashSet;
use tracing::{debug, error, trace};

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
pub(crate) static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static TEXT_MARKERS: &[&str] = &[
    "text",
    "json",
    "xml",
    "javascript",
    "x-www-form-urlencoded",
];

/// Whether a response with this `Content-Type` is buffered and fingerprinted.
///
/// A missing content type counts as text.
pub fn is_text_content(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.trim().is_empty() || TEXT_MARKERS.iter().any(|m| ct.contains(m))
}

/// Largest image body buffered for favicon hashing.
pub(crate) const FAVICON_CAPTURE_LIMIT: u64 = 1024 * 1024;

/// Whether an image response looks like a site icon small enough to hash.
///
/// Only 200 `image/*` responses with a declared length under the cap and a
/// file name ending in `.ico` or containing `icon` qualify.
pub fn is_favicon_response(
    status: StatusCode,
    content_type: &str,
    url: &str,
    content_length: Option<u64>,
) -> bool {
    if status != StatusCode::OK
        || !content_type.trim().to_ascii_lowercase().starts_with("image/")
    {
        return false;
    }
    if !matches!(content_length, Some(n) if n <= FAVICON_CAPTURE_LIMIT) {
        return false;
    }
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let name = path.rsplit('/').next().unwrap_or_default();
    name.ends_with(".ico") || name.contains("icon")
}

// Parse a Connection header value into a lowercased set of tokens
pub(crate) fn parse_connection_tokens(val: Option<&HeaderValue>) -> HashSet<String> {
    let mut set = HashSet::new();
    if let Some(conn_str) = val.and_then(|v| v.to_str().ok()) {
        for token in conn_str.split(',') {
            let trimmed = token.trim().to_ascii_lowercase();
            if !trimmed.is_empty() {
                set.insert(trimmed);
            }
        }
    }
    set
}

pub(crate) fn is_hop_by_hop_header(name: &str, connection_tokens: &HashSet<String>) -> bool {
    connection_tokens.contains(name) || HOP_BY_HOP_HEADERS.contains(&name)
}

/// Copy end-to-end headers, dropping hop-by-hop ones and anything in `skip`.
fn end_to_end(headers: &HeaderMap, skip: &[HeaderName]) -> HeaderMap {
    let tokens = parse_connection_tokens(headers.get(CONNECTION));
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if skip.contains(name) || is_hop_by_hop_header(name.as_str(), &tokens) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Absolute URL of an intercepted request.
///
/// Origin-form targets are rebuilt from the `Host` header, falling back to
/// `default_host` (the CONNECT authority inside tunnels).
pub(crate) fn absolute_url<B>(req: &Request<B>, scheme: &Scheme, default_host: &str) -> String {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or(default_host);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
}

fn error_response(status: StatusCode, msg: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full(msg.clone()))
        .unwrap_or_else(|_| Response::new(full(msg)))
}

/// Forward one request and relay the origin's answer.
///
/// Text responses and small site icons are buffered, returned whole and
/// queued for fingerprinting; anything else streams straight through.
pub(crate) async fn forward<B>(
    req: Request<B>,
    ctx: &ProxyContext,
    scheme: Scheme,
    default_host: &str,
    conn: &ConnectionMetadata,
) -> Response<ProxyBody>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let url = absolute_url(&req, &scheme, default_host);
    let method = req.method().clone();
    let headers = end_to_end(req.headers(), &[HOST]);
    trace!(conn_id = %conn.id, %method, %url, "forwarding");

    let body = if method_has_body(&method) {
        match req.into_body().collect().await {
            Ok(collected) => Some(collected.to_bytes()),
            Err(e) => {
                let boxed: Box<dyn std::error::Error + Send + Sync> = e.into();
                error!(conn_id = %conn.id, "failed to collect request body: {}", boxed);
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "request body collect error".to_string(),
                );
            }
        }
    } else {
        None
    };

    let resp = match ctx.fetcher.send(&method, &url, Some(&headers), body).await {
        Ok(r) => r,
        Err(e @ FetchError::UnsupportedMethod(_)) => {
            debug!(conn_id = %conn.id, %url, "{}", e);
            return error_response(StatusCode::METHOD_NOT_ALLOWED, e.to_string());
        }
        Err(e) => {
            classify::log_error(&e, &url);
            return error_response(StatusCode::BAD_GATEWAY, format!("upstream error: {}", e));
        }
    };

    let status = resp.status();
    let resp_headers = end_to_end(resp.headers(), &[]);
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let content_length = resp
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let buffered = is_text_content(&content_type)
        || is_favicon_response(status, &content_type, &url, content_length);
    let body = if buffered {
        let fetched = match ctx.fetcher.collect(&url, resp).await {
            Ok(f) => f,
            Err(e) => {
                classify::log_error(&e, &url);
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    format!("upstream body error: {}", e),
                );
            }
        };
        ctx.fingerprints.submit(Capture {
            url: url.clone(),
            status: status.as_u16(),
            headers: fetched.headers,
            body: fetched.body.clone(),
        });
        full(fetched.body)
    } else {
        trace!(conn_id = %conn.id, %url, %content_type, "streaming binary response");
        resp.into_body().boxed()
    };

    let mut out = Response::new(body);
    *out.status_mut() = status;
    *out.headers_mut() = resp_headers;
    out
}
