// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use hfinger::ca::CertificateAuthority;
use hfinger::config::Config;
use hfinger::output::{FingerResult, ResultCollector};
use hfinger::proxy::{run_proxy, ProxyContext};
use hfinger::rules::RuleStore;

pub const RULES: &str = r#"{"finger":[
    {"cms":"Nginx","method":"keyword","location":"header","logic":"or","rule":["nginx"]},
    {"cms":"Tomcat","method":"keyword","location":"title","logic":"or","rule":["Apache Tomcat"]}
]}"#;

pub struct RunningProxy {
    pub handle: tokio::task::JoinHandle<()>,
    pub addr: SocketAddr,
    pub ctx: Arc<ProxyContext>,
    pub collector: ResultCollector,
    pub dir: PathBuf,
}

impl RunningProxy {
    pub fn ca_pem(&self) -> String {
        self.ctx.ca().get_ca_cert_pem()
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
        let _ = tokio::fs::remove_dir_all(&self.dir).await;
    }
}

fn free_addr() -> anyhow::Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

async fn wait_accepting(addr: SocketAddr) -> anyhow::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            return Err(anyhow::anyhow!("timeout waiting for {} to accept", addr));
        }
        if let Ok(mut s) = TcpStream::connect(addr).await {
            let _ = s.shutdown().await;
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Start the proxy on a free port with a fresh CA and the test rules.
pub async fn start_proxy() -> anyhow::Result<RunningProxy> {
    let dir = std::env::temp_dir().join(format!("hfinger_integ_{}", uuid::Uuid::new_v4()));
    let mut cfg = Config::default();
    cfg.probe.threads = 8;
    cfg.probe.timeout_secs = 5;
    cfg.mitm.ca_cert_path = dir.join("ca.crt");
    cfg.mitm.ca_key_path = dir.join("ca.key");
    cfg.mitm.national = false;
    cfg.output.json = Some(dir.join("results.json"));

    let collector = ResultCollector::new(cfg.output.json.clone());
    let rules = Arc::new(RuleStore::from_json(RULES)?);
    let (ctx, _errors) = ProxyContext::build(&cfg, rules, collector.clone()).await?;

    let addr = free_addr()?;
    let ctx_for_spawn = ctx.clone();
    let handle = tokio::spawn(async move {
        let _ = run_proxy(addr, ctx_for_spawn).await;
    });
    wait_accepting(addr).await?;

    Ok(RunningProxy {
        handle,
        addr,
        ctx,
        collector,
        dir,
    })
}

/// HTTPS origin on 127.0.0.1 answering every request with `body` and an
/// nginx `Server` header. Speaks HTTP/1.1 and h2.
pub async fn start_https_origin(
    body: &'static str,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>, PathBuf)> {
    let dir = std::env::temp_dir().join(format!("hfinger_origin_ca_{}", uuid::Uuid::new_v4()));
    let ca = CertificateAuthority::load_or_generate(&dir.join("ca.crt"), &dir.join("ca.key"), false)
        .await?;
    let identity = ca.identity_for("127.0.0.1").await?;
    let acceptor = identity.standard_acceptor();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let service = service_fn(move |_req: Request<hyper::body::Incoming>| async move {
                    Response::builder()
                        .header("server", "nginx/1.18.0")
                        .header("content-type", "text/html")
                        .body(Full::new(Bytes::from_static(body.as_bytes())))
                });
                let _ = AutoConnBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });
    Ok((addr, handle, dir))
}

/// Send CONNECT and return the stream plus the proxy's response head.
pub async fn connect_tunnel(
    proxy: SocketAddr,
    authority: &str,
) -> anyhow::Result<(TcpStream, String)> {
    let mut stream = TcpStream::connect(proxy).await?;
    let connect = format!(
        "CONNECT {a} HTTP/1.1\r\nHost: {a}\r\n\r\n",
        a = authority
    );
    stream.write_all(connect.as_bytes()).await?;

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    let deadline = Instant::now() + Duration::from_secs(3);
    while !head.ends_with(b"\r\n\r\n") {
        if Instant::now() > deadline {
            return Err(anyhow::anyhow!("timeout reading CONNECT response"));
        }
        match timeout(Duration::from_millis(500), stream.read(&mut byte)).await {
            Ok(Ok(0)) => return Err(anyhow::anyhow!("proxy closed during CONNECT")),
            Ok(Ok(_)) => head.push(byte[0]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
    Ok((stream, String::from_utf8_lossy(&head).into_owned()))
}

/// rustls client trusting only `ca_pem`.
pub fn tls_client(ca_pem: &str, alpn: &[&[u8]]) -> anyhow::Result<tokio_rustls::TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    roots.add_parsable_certificates(certs);
    let mut cfg = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    cfg.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(cfg)))
}

/// Poll the collector until it holds at least `n` results.
pub async fn wait_for_results(
    collector: &ResultCollector,
    n: usize,
) -> anyhow::Result<Vec<FingerResult>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let results = collector.snapshot().await;
        if results.len() >= n {
            return Ok(results);
        }
        if Instant::now() > deadline {
            return Err(anyhow::anyhow!(
                "expected {} results, got {:?}",
                n,
                results
            ));
        }
        sleep(Duration::from_millis(50)).await;
    }
}

pub async fn read_to_end_with_timeout<S>(stream: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut out)).await??;
    Ok(out)
}
