// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Outbound HTTP client used by probes and by the intercepting proxy.
//!
//! Every request gets a random browser User-Agent and a permissive `Accept`
//! header; caller overrides win. Redirects are never followed here, except by
//! `fetch_following`.

pub mod connector;
pub mod tls;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, LOCATION, USER_AGENT};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rand::seq::SliceRandom;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::redirect;
use connector::{Upstream, UpstreamConnector};
use tls::NegotiatingConnector;

pub const ACCEPT_VALUE: &str = "*/*;q=0.8";
pub const DEFAULT_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";

static USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:91.0) Gecko/20100101 Firefox/91.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edg/91.0.864.64 Safari/537.36",
    "Mozilla/5.0 (Windows NT 6.1; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) AppleWebKit/537.36 (KHTML, like Gecko) Version/14.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 14_6 like Mac OS X) AppleWebKit/537.36 (KHTML, like Gecko) Version/14.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Android 11; Mobile; rv:91.0) Gecko/91.0 Firefox/91.0",
    "Mozilla/5.0 (Linux; Android 11; Pixel 4 XL Build/RQ3A.210605.001) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 11; SM-G998U Build/RP1A.200720.012) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 11; SM-A515F Build/RP1A.200720.012) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Mobile Safari/537.36",
    "Mozilla/5.0 (Android 10; Mobile; rv:84.0) Gecko/84.0 Firefox/84.0",
    "Mozilla/5.0 (Android 10; Tablet; rv:84.0) Gecko/84.0 Firefox/84.0",
    "Mozilla/5.0 (Windows NT 6.1; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/90.0.4430.85 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/89.0.4389.82 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:90.0) Gecko/20100101 Firefox/90.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; Trident/7.0; AS; rv:11.0) like Gecko",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("unsupported method: {0}")]
    UnsupportedMethod(Method),
    #[error("stopped after {0} redirects")]
    RedirectLimit(usize),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request build error: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("{0}")]
    Transport(#[source] hyper_util::client::legacy::Error),
    #[error("failed to read body: {0}")]
    Body(#[source] hyper::Error),
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub proxy: Option<String>,
    pub national_fallback: bool,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 5,
            proxy: None,
            national_fallback: true,
        }
    }
}

pub struct Fetcher {
    client: LegacyClient<NegotiatingConnector, Full<Bytes>>,
    timeout: Duration,
    max_redirects: usize,
}

impl Fetcher {
    pub fn new(opts: &FetcherOptions) -> anyhow::Result<Self> {
        let upstream = match &opts.proxy {
            Some(p) => Upstream::parse(p)?,
            None => Upstream::Direct,
        };
        let connector = NegotiatingConnector::new(
            UpstreamConnector::new(upstream, opts.timeout),
            opts.national_fallback,
        )?;
        let client = LegacyClient::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(120))
            .pool_max_idle_per_host(50)
            .build(connector);
        Ok(Self {
            client,
            timeout: opts.timeout,
            max_redirects: opts.max_redirects,
        })
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn get(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<Response<Incoming>, FetchError> {
        self.send(&Method::GET, url, headers, None).await
    }

    pub async fn head(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<Response<Incoming>, FetchError> {
        self.send(&Method::HEAD, url, headers, None).await
    }

    pub async fn options(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<Response<Incoming>, FetchError> {
        self.send(&Method::OPTIONS, url, headers, None).await
    }

    pub async fn trace(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<Response<Incoming>, FetchError> {
        self.send(&Method::TRACE, url, headers, None).await
    }

    pub async fn post(
        &self,
        url: &str,
        body: Bytes,
        headers: Option<&HeaderMap>,
    ) -> Result<Response<Incoming>, FetchError> {
        self.send(&Method::POST, url, headers, Some(body)).await
    }

    pub async fn put(
        &self,
        url: &str,
        body: Bytes,
        headers: Option<&HeaderMap>,
    ) -> Result<Response<Incoming>, FetchError> {
        self.send(&Method::PUT, url, headers, Some(body)).await
    }

    pub async fn delete(
        &self,
        url: &str,
        body: Bytes,
        headers: Option<&HeaderMap>,
    ) -> Result<Response<Incoming>, FetchError> {
        self.send(&Method::DELETE, url, headers, Some(body)).await
    }

    /// Issue `method` against `url`.
    ///
    /// Only GET, HEAD, OPTIONS, TRACE, POST, PUT and DELETE are accepted; the
    /// body is dropped for the first four.
    pub async fn send(
        &self,
        method: &Method,
        url: &str,
        headers: Option<&HeaderMap>,
        body: Option<Bytes>,
    ) -> Result<Response<Incoming>, FetchError> {
        let req = build_request(method, url, headers, body)?;
        trace!(%method, %url, "outbound request");
        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(res) => res.map_err(FetchError::Transport),
            Err(_) => Err(FetchError::Timeout(url.to_string())),
        }
    }

    /// Buffer a response body within the request timeout.
    pub async fn collect(&self, url: &str, resp: Response<Incoming>) -> Result<Fetched, FetchError> {
        let (parts, body) = resp.into_parts();
        let bytes = match tokio::time::timeout(self.timeout, body.collect()).await {
            Ok(res) => res.map_err(FetchError::Body)?.to_bytes(),
            Err(_) => return Err(FetchError::Timeout(url.to_string())),
        };
        Ok(Fetched {
            url: url.to_string(),
            status: parts.status,
            headers: parts.headers,
            body: bytes,
        })
    }

    /// GET `url`, following `Location` redirects up to the configured ceiling.
    pub async fn fetch_following(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<Fetched, FetchError> {
        let mut current = url.to_string();
        let mut hops = 0;
        loop {
            let resp = self.get(&current, headers).await?;
            let target = if resp.status().is_redirection() {
                resp.headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string())
            } else {
                None
            };
            match target {
                Some(loc) => {
                    if hops >= self.max_redirects {
                        return Err(FetchError::RedirectLimit(self.max_redirects));
                    }
                    hops += 1;
                    let next =
                        redirect::resolve(&current, &loc).map_err(|e| FetchError::InvalidUrl {
                            url: loc.clone(),
                            reason: e.to_string(),
                        })?;
                    debug!(from = %current, to = %next, "following redirect");
                    current = next;
                }
                None => return self.collect(&current, resp).await,
            }
        }
    }
}

/// Whether a method carries a request body when replayed.
pub fn method_has_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE)
}

pub(crate) fn build_request(
    method: &Method,
    url: &str,
    overrides: Option<&HeaderMap>,
    body: Option<Bytes>,
) -> Result<Request<Full<Bytes>>, FetchError> {
    let body = match *method {
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE => Bytes::new(),
        Method::POST | Method::PUT | Method::DELETE => body.unwrap_or_default(),
        _ => return Err(FetchError::UnsupportedMethod(method.clone())),
    };
    let uri: Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match uri.scheme_str() {
        Some("http") | Some("https") if uri.host().is_some() => {}
        _ => {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: "expected an absolute http or https url".to_string(),
            })
        }
    }

    let mut req = Request::builder()
        .method(method.clone())
        .uri(uri)
        .body(Full::new(body))?;
    let headers = req.headers_mut();
    headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
    if let Some(overrides) = overrides {
        for name in overrides.keys() {
            headers.remove(name);
        }
        for (name, value) in overrides.iter() {
            headers.append(name.clone(), value.clone());
        }
    }
    if method_has_body(method) && !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max_redirects: usize) -> anyhow::Result<Fetcher> {
        Fetcher::new(&FetcherOptions {
            timeout: Duration::from_secs(5),
            max_redirects,
            proxy: None,
            national_fallback: false,
        })
    }

    #[test]
    fn injects_probe_headers() -> anyhow::Result<()> {
        let req = build_request(&Method::GET, "http://example.test/", None, None)?;
        let ua = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok());
        assert!(ua.map(|u| USER_AGENTS.contains(&u)).unwrap_or(false));
        assert_eq!(req.headers().get(ACCEPT), Some(&HeaderValue::from_static(ACCEPT_VALUE)));
        assert!(req.headers().get(CONTENT_TYPE).is_none());
        Ok(())
    }

    #[test]
    fn overrides_take_precedence() -> anyhow::Result<()> {
        let mut o = HeaderMap::new();
        o.insert(USER_AGENT, HeaderValue::from_static("custom/1.0"));
        o.insert("cookie", HeaderValue::from_static("rememberMe=1"));
        let req = build_request(&Method::GET, "http://example.test/", Some(&o), None)?;
        assert_eq!(req.headers().get(USER_AGENT), Some(&HeaderValue::from_static("custom/1.0")));
        assert_eq!(req.headers().get_all(USER_AGENT).iter().count(), 1);
        assert_eq!(
            req.headers().get("cookie"),
            Some(&HeaderValue::from_static("rememberMe=1"))
        );
        Ok(())
    }

    #[rstest]
    #[case(Method::POST)]
    #[case(Method::PUT)]
    #[case(Method::DELETE)]
    fn body_verbs_get_default_content_type(#[case] m: Method) -> anyhow::Result<()> {
        let req = build_request(&m, "http://example.test/", None, Some(Bytes::from("a=1")))?;
        assert_eq!(
            req.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static(DEFAULT_CONTENT_TYPE))
        );

        let mut o = HeaderMap::new();
        o.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let req = build_request(&m, "http://example.test/", Some(&o), Some(Bytes::from("{}")))?;
        assert_eq!(
            req.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
        Ok(())
    }

    #[rstest]
    #[case(Method::PATCH)]
    #[case(Method::CONNECT)]
    fn rejects_unsupported_methods(#[case] m: Method) {
        let res = build_request(&m, "http://example.test/", None, None);
        assert!(matches!(res, Err(FetchError::UnsupportedMethod(_))));
    }

    #[rstest]
    #[case("example.test/no-scheme")]
    #[case("ftp://example.test/")]
    #[case("http://")]
    fn rejects_bad_urls(#[case] url: &str) {
        let res = build_request(&Method::GET, url, None, None);
        assert!(matches!(res, Err(FetchError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn get_reaches_origin_with_headers() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("accept", ACCEPT_VALUE))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .expect(1)
            .mount(&mock)
            .await;

        let f = fetcher(5)?;
        let url = format!("{}/", mock.uri());
        let resp = f.get(&url, None).await?;
        let fetched = f.collect(&url, resp).await?;
        assert_eq!(fetched.status, StatusCode::OK);
        assert_eq!(&fetched.body[..], b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn does_not_follow_redirects_by_itself() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/next"))
            .mount(&mock)
            .await;

        let f = fetcher(5)?;
        let resp = f.get(&format!("{}/", mock.uri()), None).await?;
        assert_eq!(resp.status(), StatusCode::FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn post_sends_body() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form"))
            .and(header("content-type", DEFAULT_CONTENT_TYPE))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock)
            .await;

        let f = fetcher(5)?;
        let resp = f
            .post(&format!("{}/form", mock.uri()), Bytes::from("a=1"), None)
            .await?;
        assert_eq!(resp.status(), StatusCode::CREATED);
        Ok(())
    }

    #[tokio::test]
    async fn verb_helpers_reach_origin() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        for m in ["HEAD", "OPTIONS", "TRACE", "PUT", "DELETE"] {
            Mock::given(method(m))
                .and(path("/v"))
                .respond_with(ResponseTemplate::new(204))
                .expect(1)
                .mount(&mock)
                .await;
        }

        let f = fetcher(5)?;
        let url = format!("{}/v", mock.uri());
        assert_eq!(f.head(&url, None).await?.status(), StatusCode::NO_CONTENT);
        assert_eq!(f.options(&url, None).await?.status(), StatusCode::NO_CONTENT);
        assert_eq!(f.trace(&url, None).await?.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            f.put(&url, Bytes::from("x"), None).await?.status(),
            StatusCode::NO_CONTENT
        );
        assert_eq!(
            f.delete(&url, Bytes::new(), None).await?.status(),
            StatusCode::NO_CONTENT
        );
        Ok(())
    }

    #[tokio::test]
    async fn fetch_following_resolves_relative_locations() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/b"))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"icon".to_vec()))
            .mount(&mock)
            .await;

        let f = fetcher(5)?;
        let fetched = f.fetch_following(&format!("{}/a", mock.uri()), None).await?;
        assert_eq!(fetched.url, format!("{}/b", mock.uri()));
        assert_eq!(&fetched.body[..], b"icon");
        Ok(())
    }

    #[tokio::test]
    async fn fetch_following_enforces_ceiling() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
            .mount(&mock)
            .await;

        let f = fetcher(2)?;
        let res = f.fetch_following(&format!("{}/loop", mock.uri()), None).await;
        assert!(matches!(res, Err(FetchError::RedirectLimit(2))));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_origin_is_transport_error() -> anyhow::Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let f = fetcher(5)?;
        let res = f.get(&format!("http://127.0.0.1:{}/", port), None).await;
        let err = res.err().ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        assert!(matches!(err, FetchError::Transport(_)));
        assert_eq!(
            crate::classify::classify(&err).category,
            crate::classify::ErrorCategory::Connection
        );
        Ok(())
    }
}
