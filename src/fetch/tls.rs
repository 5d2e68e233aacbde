// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Outbound TLS: rustls first, openssl when the origin refuses our versions.
//!
//! Certificates are never validated; targets are routinely self-signed.

use super::connector::{uri_host_port, UpstreamConnector};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder, MaybeHttpsStream};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{AlertDescription, DigitallySignedStruct, SignatureScheme};
use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tower_service::Service;
use tracing::debug;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
pub struct AcceptAnyCert(Arc<CryptoProvider>);

impl AcceptAnyCert {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self(provider)
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// rustls client configuration that trusts every server.
pub fn insecure_client_config() -> anyhow::Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let cfg = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new(provider)))
        .with_no_client_auth();
    Ok(cfg)
}

/// openssl client used for origins that only speak national-cryptography TLS.
pub fn national_connector() -> anyhow::Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_alpn_protos(b"\x02h2\x08http/1.1")?;
    Ok(builder.build())
}

/// Whether a handshake failure means the origin rejected our protocol versions.
pub fn is_protocol_version_error(err: &(dyn StdError + 'static)) -> bool {
    let mut cur = Some(err);
    while let Some(e) = cur {
        let tls = e.downcast_ref::<rustls::Error>().or_else(|| {
            e.downcast_ref::<io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        });
        match tls {
            Some(rustls::Error::AlertReceived(AlertDescription::ProtocolVersion))
            | Some(rustls::Error::PeerIncompatible(_)) => return true,
            _ => {}
        }
        if e.to_string().to_ascii_lowercase().contains("protocol version") {
            return true;
        }
        cur = e.source();
    }
    false
}

/// A connection to an origin, over rustls, plain TCP, or openssl.
pub enum OutboundStream {
    Standard(MaybeHttpsStream<TokioIo<TcpStream>>),
    National(TokioIo<SslStream<TcpStream>>),
}

impl Read for OutboundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OutboundStream::Standard(s) => Pin::new(s).poll_read(cx, buf),
            OutboundStream::National(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl Write for OutboundStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            OutboundStream::Standard(s) => Pin::new(s).poll_write(cx, buf),
            OutboundStream::National(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OutboundStream::Standard(s) => Pin::new(s).poll_flush(cx),
            OutboundStream::National(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OutboundStream::Standard(s) => Pin::new(s).poll_shutdown(cx),
            OutboundStream::National(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Connection for OutboundStream {
    fn connected(&self) -> Connected {
        match self {
            OutboundStream::Standard(s) => s.connected(),
            OutboundStream::National(s) => {
                let connected = Connected::new();
                if s.inner().ssl().selected_alpn_protocol() == Some(b"h2") {
                    connected.negotiated_h2()
                } else {
                    connected
                }
            }
        }
    }
}

/// HTTPS connector that retries over the national stack on version refusal.
#[derive(Clone)]
pub struct NegotiatingConnector {
    https: HttpsConnector<UpstreamConnector>,
    upstream: UpstreamConnector,
    national: Option<Arc<SslConnector>>,
}

impl NegotiatingConnector {
    pub fn new(upstream: UpstreamConnector, national_fallback: bool) -> anyhow::Result<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(insecure_client_config()?)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(upstream.clone());
        let national = if national_fallback {
            Some(Arc::new(national_connector()?))
        } else {
            None
        };
        Ok(Self {
            https,
            upstream,
            national,
        })
    }
}

async fn connect_national(
    upstream: UpstreamConnector,
    connector: Arc<SslConnector>,
    uri: Uri,
) -> Result<OutboundStream, BoxError> {
    let (host, port) = uri_host_port(&uri)?;
    let tcp = upstream.connect(&host, port).await?;
    let ssl = connector.configure()?.into_ssl(&host)?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| -> BoxError { format!("national TLS handshake failed: {}", e).into() })?;
    Ok(OutboundStream::National(TokioIo::new(stream)))
}

impl Service<Uri> for NegotiatingConnector {
    type Response = OutboundStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.https.poll_ready(cx)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let standard = self.https.call(uri.clone());
        let upstream = self.upstream.clone();
        let national = self.national.clone();
        Box::pin(async move {
            match standard.await {
                Ok(stream) => Ok(OutboundStream::Standard(stream)),
                Err(e) => match national {
                    Some(connector)
                        if uri.scheme_str() == Some("https")
                            && is_protocol_version_error(e.as_ref()) =>
                    {
                        debug!(%uri, error = %e, "retrying with national TLS");
                        connect_national(upstream, connector, uri).await
                    }
                    _ => Err(e),
                },
            }
        })
    }
}
