// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! TLS-intercepting forward proxy that fingerprints what passes through it.
//!
//! Plain requests are forwarded as-is. `CONNECT` tunnels are terminated with a
//! leaf issued for the tunneled host; the certificate profile is picked from
//! the ClientHello, and `h2` sessions are served by an embedded HTTP/2 server.

pub mod client_hello;
pub mod fingerprint;
pub mod forward;

use crate::ca::CertificateAuthority;
use crate::classify;
use crate::config::Config;
use crate::connection::ConnectionMetadata;
use crate::fetch::{Fetcher, FetcherOptions};
use crate::output::ResultCollector;
use crate::rules::RuleStore;
use anyhow::Context;
use bytes::Bytes;
use client_hello::{PrefixedStream, TlsProfile};
use fingerprint::{FingerprintError, FingerprintQueue};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::http::uri::Scheme;
use hyper::upgrade::Upgraded;
use hyper::{service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use openssl::ssl::Ssl;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Semaphore};
use tokio_openssl::SslStream;
use tracing::{debug, error, info, trace, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response<ProxyBody>, Infallible>> + Send>>;

/// Path under which the proxy serves its root certificate to plain clients.
pub const CERT_PATH: &str = "/_hfinger/cert";

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, msg: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full(msg))
        .unwrap_or_else(|_| Response::new(full(msg)))
}

/// State shared by every connection the proxy accepts.
pub struct ProxyContext {
    pub(crate) fetcher: Fetcher,
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) fingerprints: FingerprintQueue,
    threads: usize,
}

impl ProxyContext {
    pub fn new(
        fetcher: Fetcher,
        ca: Arc<CertificateAuthority>,
        fingerprints: FingerprintQueue,
        threads: usize,
    ) -> Self {
        Self {
            fetcher,
            ca,
            fingerprints,
            threads: threads.max(1),
        }
    }

    /// Load the CA, build the outbound client and start the fingerprint
    /// worker. The returned receiver yields worker failures.
    pub async fn build(
        cfg: &Config,
        rules: Arc<RuleStore>,
        collector: ResultCollector,
    ) -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<FingerprintError>)> {
        let fetcher = Fetcher::new(&FetcherOptions {
            timeout: cfg.probe.timeout(),
            max_redirects: cfg.probe.max_redirects,
            proxy: cfg.probe.proxy.clone(),
            national_fallback: cfg.mitm.national,
        })?;
        let ca = CertificateAuthority::load_or_generate(
            &cfg.mitm.ca_cert_path,
            &cfg.mitm.ca_key_path,
            cfg.mitm.national,
        )
        .await
        .context("failed to prepare root CA")?;
        let (fingerprints, errors, worker) =
            FingerprintQueue::spawn(rules, collector, cfg.mitm.fingerprint_queue);
        tokio::spawn(fingerprint::watch_worker(worker));
        let ctx = Self::new(fetcher, ca, fingerprints, cfg.probe.threads);
        Ok((Arc::new(ctx), errors))
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }
}

pub async fn run_proxy(listen: SocketAddr, ctx: Arc<ProxyContext>) -> anyhow::Result<()> {
    run_proxy_with_limit(listen, ctx, None).await
}

/// Testable variant of `run_proxy` that accepts an optional `accept_limit`.
/// When `accept_limit` is `Some(n)`, the accept loop returns after accepting
/// the Nth connection; handlers already spawned keep running.
pub async fn run_proxy_with_limit(
    listen: SocketAddr,
    ctx: Arc<ProxyContext>,
    accept_limit: Option<usize>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "listening");

    let limiter = Arc::new(Semaphore::new(ctx.threads));
    let mut server_builder = AutoConnBuilder::new(TokioExecutor::new());
    server_builder.http1().keep_alive(false);

    let mut remaining = accept_limit;
    loop {
        if let Some(0) = remaining {
            break;
        }

        let permit = limiter.clone().acquire_owned().await?;
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        if let Some(ref mut n) = remaining {
            *n -= 1;
        }

        let ctx = ctx.clone();
        let builder = server_builder.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let conn = Arc::new(ConnectionMetadata::new(remote_addr));
            let meta = conn.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let ctx = ctx.clone();
                let conn = conn.clone();
                let fut: ServiceFuture = Box::pin(async move { handle_request(req, ctx, conn).await });
                fut
            });

            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                debug!(conn_id = %meta.id, "connection error: {}", e);
            }
            trace!(
                conn_id = %meta.id,
                remote = %meta.remote_addr,
                elapsed_ms = meta.age_ms(),
                "connection closed"
            );
        });
    }

    Ok(())
}

async fn handle_request<B>(
    req: Request<B>,
    ctx: Arc<ProxyContext>,
    conn: Arc<ConnectionMetadata>,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        let (Some(host), Some(authority)) = (
            req.uri().host().map(str::to_string),
            req.uri().authority().map(|a| a.to_string()),
        ) else {
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "CONNECT target must be host:port",
            ));
        };
        info!(conn_id = %conn.id, remote = %conn.remote_addr, %authority, "CONNECT");

        tokio::task::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let meta = conn.clone();
                    if let Err(e) = handle_connect(upgraded, &host, &authority, ctx, conn).await {
                        classify::log_error(&*e, &authority);
                    }
                    debug!(
                        conn_id = %meta.id,
                        %authority,
                        elapsed_ms = meta.age_ms(),
                        "tunnel closed"
                    );
                }
                Err(e) => error!("upgrade error for {}: {}", authority, e),
            }
        });

        let mut resp = Response::new(full(Bytes::new()));
        resp.extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection established"));
        return Ok(resp);
    }

    if req.method() == Method::GET
        && req.uri().authority().is_none()
        && req.uri().path() == CERT_PATH
    {
        let pem = ctx.ca.get_ca_cert_pem();
        return Ok(Response::builder()
            .header("Content-Type", "application/x-x509-ca-cert")
            .header(
                "Content-Disposition",
                "attachment; filename=\"hfinger-ca.crt\"",
            )
            .body(full(pem.clone()))
            .unwrap_or_else(|_| Response::new(full(pem))));
    }

    Ok(forward::forward(req, &ctx, Scheme::HTTP, "localhost", &conn).await)
}

async fn handle_inner_request<B>(
    req: Request<B>,
    ctx: Arc<ProxyContext>,
    conn: Arc<ConnectionMetadata>,
    authority: &str,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Nested CONNECT not supported",
        ));
    }
    Ok(forward::forward(req, &ctx, Scheme::HTTPS, authority, &conn).await)
}

async fn handle_connect(
    upgraded: Upgraded,
    host: &str,
    authority: &str,
    ctx: Arc<ProxyContext>,
    conn: Arc<ConnectionMetadata>,
) -> anyhow::Result<()> {
    let identity = ctx.ca.identity_for(host).await?;

    let mut io = TokioIo::new(upgraded);
    let (prefix, hello) = client_hello::read_client_hello(&mut io)
        .await
        .context("failed to read ClientHello")?;
    let profile = hello
        .as_ref()
        .map(client_hello::select_profile)
        .unwrap_or(TlsProfile::Standard);
    debug!(
        conn_id = %conn.id,
        %host,
        ?profile,
        sni = ?hello.as_ref().and_then(|h| h.server_name.as_deref()),
        "terminating TLS"
    );
    let stream = PrefixedStream::new(prefix, io);

    if let (TlsProfile::National, Some(acceptor)) = (profile, identity.national.as_ref()) {
        let ssl = Ssl::new(acceptor.context())?;
        let mut tls = SslStream::new(ssl, stream)?;
        Pin::new(&mut tls)
            .accept()
            .await
            .map_err(|e| anyhow::anyhow!("national TLS handshake failed: {}", e))?;
        return serve_tunnel(tls, false, authority, ctx, conn).await;
    }
    if profile == TlsProfile::National {
        warn!(%host, "no national identity available, serving standard certificate");
    }

    let tls = identity
        .standard_acceptor()
        .accept(stream)
        .await
        .context("TLS handshake failed")?;
    let h2 = tls.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
    serve_tunnel(tls, h2, authority, ctx, conn).await
}

/// Serve decrypted tunnel traffic: every stream of an `h2` session, or a
/// single HTTP/1.1 request.
async fn serve_tunnel<S>(
    stream: S,
    h2: bool,
    authority: &str,
    ctx: Arc<ProxyContext>,
    conn: Arc<ConnectionMetadata>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let authority = authority.to_string();
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let conn = conn.clone();
        let authority = authority.clone();
        let fut: ServiceFuture =
            Box::pin(async move { handle_inner_request(req, ctx, conn, &authority).await });
        fut
    });

    let io = TokioIo::new(stream);
    if h2 {
        hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await?;
    } else {
        hyper::server::conn::http1::Builder::new()
            .keep_alive(false)
            .serve_connection(io, service)
            .await?;
    }
    Ok(())
}
