// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! TCP dialing, either directly or through an upstream proxy.
//!
//! HTTP proxies are always asked for a `CONNECT` tunnel, for plain and TLS
//! targets alike, so the layers above see a raw byte stream to the origin.

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::Uri;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;
use url::Url;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_NO_AUTH: u8 = 0x00;
const SOCKS5_USER_PASS: u8 = 0x02;
const SOCKS5_NO_ACCEPTABLE: u8 = 0xFF;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Direct,
    Http {
        host: String,
        port: u16,
        /// Pre-encoded `Basic` credentials.
        authorization: Option<String>,
    },
    Socks5 {
        host: String,
        port: u16,
        credentials: Option<(String, String)>,
        /// `socks5h`: let the proxy resolve target names.
        remote_dns: bool,
    },
}

impl Upstream {
    /// Parse `http://[user:pass@]host:port`, `socks5://...` or `socks5h://...`.
    pub fn parse(proxy: &str) -> anyhow::Result<Self> {
        let url = Url::parse(proxy).with_context(|| format!("invalid proxy url {}", proxy))?;
        let host = url
            .host_str()
            .map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string())
            .ok_or_else(|| anyhow::anyhow!("proxy url {} has no host", proxy))?;
        let user = url.username().to_string();
        let password = url.password().map(|p| p.to_string());

        match url.scheme() {
            "http" => Ok(Upstream::Http {
                host,
                port: url.port().unwrap_or(8080),
                authorization: password.map(|p| {
                    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, p)))
                }),
            }),
            scheme @ ("socks5" | "socks5h") => Ok(Upstream::Socks5 {
                host,
                port: url.port().unwrap_or(1080),
                credentials: if user.is_empty() {
                    None
                } else {
                    Some((user, password.unwrap_or_default()))
                },
                remote_dns: scheme == "socks5h",
            }),
            other => bail!("unsupported proxy scheme {}", other),
        }
    }
}

/// Dials origins for the HTTP client, optionally through an upstream proxy.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    upstream: Arc<Upstream>,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(upstream: Upstream, connect_timeout: Duration) -> Self {
        Self {
            upstream: Arc::new(upstream),
            connect_timeout,
        }
    }

    /// Open a TCP stream that reaches `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let fut = async {
            match &*self.upstream {
                Upstream::Direct => TcpStream::connect((host, port)).await,
                Upstream::Http {
                    host: phost,
                    port: pport,
                    authorization,
                } => {
                    let stream = TcpStream::connect((phost.as_str(), *pport)).await?;
                    http_connect(stream, host, port, authorization.as_deref()).await
                }
                Upstream::Socks5 {
                    host: phost,
                    port: pport,
                    credentials,
                    remote_dns,
                } => {
                    let stream = TcpStream::connect((phost.as_str(), *pport)).await?;
                    socks5_connect(stream, host, port, credentials.as_ref(), *remote_dns).await
                }
            }
        };
        match tokio::time::timeout(self.connect_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {}:{} timed out", host, port),
            )),
        }
    }
}

/// Host and port of a request URI, with the scheme's default port.
pub fn uri_host_port(uri: &Uri) -> io::Result<(String, u16)> {
    let host = uri
        .host()
        .map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no host in {}", uri)))?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Ok((host, port))
}

impl tower_service::Service<Uri> for UpstreamConnector {
    type Response = TokioIo<TcpStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let (host, port) = uri_host_port(&uri)?;
            let stream = this.connect(&host, port).await?;
            let _ = stream.set_nodelay(true);
            Ok(TokioIo::new(stream))
        })
    }
}

async fn http_connect(
    stream: TcpStream,
    host: &str,
    port: u16,
    authorization: Option<&str>,
) -> io::Result<TcpStream> {
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let mut req = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some(auth) = authorization {
        req.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    req.push_str("\r\n");

    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(req.as_bytes()).await?;

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .unwrap_or(0);
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    if code != 200 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy CONNECT to {} failed: {}", authority, status_line.trim()),
        ));
    }
    trace!(%authority, "proxy tunnel established");
    // a proxy must not send tunnel bytes before the client does
    Ok(reader.into_inner())
}

async fn socks5_connect(
    mut stream: TcpStream,
    host: &str,
    port: u16,
    credentials: Option<&(String, String)>,
    remote_dns: bool,
) -> io::Result<TcpStream> {
    let method = if credentials.is_some() {
        SOCKS5_USER_PASS
    } else {
        SOCKS5_NO_AUTH
    };
    stream.write_all(&[SOCKS5_VERSION, 1, method]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION || choice[1] == SOCKS5_NO_ACCEPTABLE || choice[1] != method {
        return Err(socks_error("no acceptable authentication method"));
    }

    if let Some((user, pass)) = credentials {
        if user.len() > 255 || pass.len() > 255 {
            return Err(socks_error("credentials too long"));
        }
        let mut auth = vec![0x01, user.len() as u8];
        auth.extend_from_slice(user.as_bytes());
        auth.push(pass.len() as u8);
        auth.extend_from_slice(pass.as_bytes());
        stream.write_all(&auth).await?;
        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0x00 {
            return Err(socks_error("authentication rejected"));
        }
    }

    let mut req = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
    let literal = host.parse::<IpAddr>().ok();
    let addr = match literal {
        Some(ip) => Some(ip),
        None if !remote_dns => tokio::net::lookup_host((host, port))
            .await?
            .next()
            .map(|sa| sa.ip()),
        None => None,
    };
    match addr {
        Some(IpAddr::V4(v4)) => {
            req.push(SOCKS5_ATYP_IPV4);
            req.extend_from_slice(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            req.push(SOCKS5_ATYP_IPV6);
            req.extend_from_slice(&v6.octets());
        }
        None => {
            if host.len() > 255 {
                return Err(socks_error("hostname too long"));
            }
            req.push(SOCKS5_ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(socks_error(socks_reply_text(head[1])));
    }
    let skip = match head[3] {
        SOCKS5_ATYP_IPV4 => 4,
        SOCKS5_ATYP_IPV6 => 16,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(socks_error("malformed reply address")),
    };
    let mut rest = vec![0u8; skip + 2];
    stream.read_exact(&mut rest).await?;
    Ok(stream)
}

fn socks_reply_text(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS error",
    }
}

fn socks_error(msg: &str) -> io::Error {
    io::Error::other(format!("socks5: {}", msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::net::TcpListener;

    #[rstest]
    #[case("http://127.0.0.1:3128", Upstream::Http { host: "127.0.0.1".into(), port: 3128, authorization: None })]
    #[case("http://u:p@proxy.local", Upstream::Http { host: "proxy.local".into(), port: 8080, authorization: Some("Basic dTpw".into()) })]
    #[case("socks5://127.0.0.1", Upstream::Socks5 { host: "127.0.0.1".into(), port: 1080, credentials: None, remote_dns: false })]
    #[case("socks5h://a:b@10.0.0.1:9050", Upstream::Socks5 { host: "10.0.0.1".into(), port: 9050, credentials: Some(("a".into(), "b".into())), remote_dns: true })]
    fn parses_proxy_urls(#[case] input: &str, #[case] expected: Upstream) -> anyhow::Result<()> {
        assert_eq!(Upstream::parse(input)?, expected);
        Ok(())
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Upstream::parse("ftp://127.0.0.1:21").is_err());
    }

    #[rstest]
    #[case("http://example.test/a", "example.test", 80)]
    #[case("https://example.test/a", "example.test", 443)]
    #[case("https://example.test:8443/", "example.test", 8443)]
    #[case("http://[::1]:8080/", "::1", 8080)]
    fn host_port_from_uri(#[case] uri: &str, #[case] host: &str, #[case] port: u16) -> anyhow::Result<()> {
        let uri: Uri = uri.parse()?;
        assert_eq!(uri_host_port(&uri)?, (host.to_string(), port));
        Ok(())
    }

    #[tokio::test]
    async fn http_connect_sends_credentials_and_returns_tunnel() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await?;
            let mut reader = BufReader::new(sock);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await?;
                if line == "\r\n" {
                    break;
                }
                head.push_str(&line);
            }
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            let mut ping = [0u8; 4];
            reader.read_exact(&mut ping).await?;
            reader.get_mut().write_all(b"pong").await?;
            Ok::<_, io::Error>((head, ping))
        });

        let upstream = Upstream::parse(&format!("http://u:p@{}", addr))?;
        let connector = UpstreamConnector::new(upstream, Duration::from_secs(5));
        let mut stream = connector.connect("origin.test", 443).await?;
        stream.write_all(b"ping").await?;
        let mut pong = [0u8; 4];
        stream.read_exact(&mut pong).await?;
        assert_eq!(&pong, b"pong");

        let (head, ping) = server.await??;
        assert!(head.starts_with("CONNECT origin.test:443 HTTP/1.1"));
        assert!(head.contains("Proxy-Authorization: Basic dTpw"));
        assert_eq!(&ping, b"ping");
        Ok(())
    }

    #[tokio::test]
    async fn http_connect_refusal_is_an_error() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 512];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                    .await;
            }
        });

        let connector =
            UpstreamConnector::new(Upstream::parse(&format!("http://{}", addr))?, Duration::from_secs(5));
        let err = connector.connect("origin.test", 80).await.err();
        assert!(err.map(|e| e.to_string().contains("407")).unwrap_or(false));
        Ok(())
    }

    #[tokio::test]
    async fn socks5_handshake_with_domain_address() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await?;
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await?;
            sock.write_all(&[0x05, 0x02]).await?;

            let mut auth_head = [0u8; 2];
            sock.read_exact(&mut auth_head).await?;
            let mut user = vec![0u8; auth_head[1] as usize];
            sock.read_exact(&mut user).await?;
            let mut plen = [0u8; 1];
            sock.read_exact(&mut plen).await?;
            let mut pass = vec![0u8; plen[0] as usize];
            sock.read_exact(&mut pass).await?;
            sock.write_all(&[0x01, 0x00]).await?;

            let mut req = [0u8; 5];
            sock.read_exact(&mut req).await?;
            let mut name = vec![0u8; req[4] as usize];
            sock.read_exact(&mut name).await?;
            let mut port = [0u8; 2];
            sock.read_exact(&mut port).await?;
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
                .await?;
            Ok::<_, io::Error>((greeting, user, pass, req[3], name, u16::from_be_bytes(port)))
        });

        let upstream = Upstream::parse(&format!("socks5h://alice:secret@{}", addr))?;
        let connector = UpstreamConnector::new(upstream, Duration::from_secs(5));
        let _stream = connector.connect("origin.test", 8443).await?;

        let (greeting, user, pass, atyp, name, port) = server.await??;
        assert_eq!(greeting, [0x05, 0x01, 0x02]);
        assert_eq!(user, b"alice");
        assert_eq!(pass, b"secret");
        assert_eq!(atyp, SOCKS5_ATYP_DOMAIN);
        assert_eq!(name, b"origin.test");
        assert_eq!(port, 8443);
        Ok(())
    }

    #[tokio::test]
    async fn socks5_failure_reply_is_an_error() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut greeting = [0u8; 3];
                let _ = sock.read_exact(&mut greeting).await;
                let _ = sock.write_all(&[0x05, 0x00]).await;
                let mut req = [0u8; 10];
                let _ = sock.read_exact(&mut req).await;
                let _ = sock.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await;
            }
        });

        let connector =
            UpstreamConnector::new(Upstream::parse(&format!("socks5://{}", addr))?, Duration::from_secs(5));
        let err = connector.connect("127.0.0.1", 80).await.err();
        assert!(err
            .map(|e| e.to_string().contains("connection refused"))
            .unwrap_or(false));
        Ok(())
    }
}
