// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! ClientHello inspection for choosing which certificate profile to serve.
//!
//! The hello is read off the tunnel before any TLS library sees it, then
//! replayed through [`PrefixedStream`] into the selected acceptor.
//!
//! Record layout:
//!   [0]       content_type (0x16 = Handshake)
//!   [1..3]    record version
//!   [3..5]    record length
//! Handshake layout:
//!   [0]       handshake_type (0x01 = ClientHello)
//!   [1..4]    handshake length (3 bytes)
//!   [4..6]    client_version
//!   [6..38]   random
//!   ...       session_id, cipher_suites, compression_methods, extensions

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const CONTENT_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const MAX_HELLO_LEN: usize = 64 * 1024;

/// Cipher suites that only national-cryptography (SM2/SM4) clients offer.
pub const NATIONAL_SUITES: [u16; 2] = [0xE011, 0xE013];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub cipher_suites: Vec<u16>,
    pub alpn: Vec<String>,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProfile {
    Standard,
    National,
}

/// Pick the certificate profile for a client.
///
/// Any standard ALPN token wins; otherwise a known national suite selects the
/// national profile. This is a heuristic, not a negotiation.
pub fn select_profile(hello: &ClientHelloInfo) -> TlsProfile {
    if hello.alpn.iter().any(|p| p == "h2" || p == "http/1.1") {
        return TlsProfile::Standard;
    }
    if hello
        .cipher_suites
        .iter()
        .any(|cs| NATIONAL_SUITES.contains(cs))
    {
        return TlsProfile::National;
    }
    TlsProfile::Standard
}

fn be16(data: &[u8], pos: usize) -> Option<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Parse a ClientHello handshake message (without the record header).
pub fn parse_client_hello(hs: &[u8]) -> Result<ClientHelloInfo, String> {
    if hs.len() < 4 {
        return Err("truncated handshake header".into());
    }
    if hs[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(format!("not a ClientHello (handshake type 0x{:02x})", hs[0]));
    }
    let body_len = ((hs[1] as usize) << 16) | ((hs[2] as usize) << 8) | hs[3] as usize;
    let data = hs
        .get(4..4 + body_len)
        .ok_or_else(|| "truncated ClientHello body".to_string())?;

    // version + random
    let mut pos = 2 + 32;

    let sid_len = *data.get(pos).ok_or("truncated at session id")? as usize;
    pos += 1 + sid_len;

    let cs_len = be16(data, pos).ok_or("truncated at cipher suites length")? as usize;
    pos += 2;
    let cs = data
        .get(pos..pos + cs_len)
        .ok_or("truncated in cipher suites")?;
    let cipher_suites = cs
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    pos += cs_len;

    let comp_len = *data.get(pos).ok_or("truncated at compression methods")? as usize;
    pos += 1 + comp_len;

    let mut info = ClientHelloInfo {
        cipher_suites,
        ..Default::default()
    };

    let Some(ext_total) = be16(data, pos) else {
        return Ok(info);
    };
    pos += 2;
    let ext_end = (pos + ext_total as usize).min(data.len());
    while pos + 4 <= ext_end {
        let ext_type = be16(data, pos).unwrap_or_default();
        let ext_len = be16(data, pos + 2).unwrap_or_default() as usize;
        pos += 4;
        let Some(ext) = data.get(pos..pos + ext_len) else {
            break;
        };
        match ext_type {
            EXT_ALPN => info.alpn = parse_alpn(ext),
            EXT_SERVER_NAME => info.server_name = parse_sni(ext),
            _ => {}
        }
        pos += ext_len;
    }
    Ok(info)
}

fn parse_alpn(ext: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let Some(list_len) = be16(ext, 0) else {
        return out;
    };
    let list = ext.get(2..2 + list_len as usize).unwrap_or_default();
    let mut i = 0;
    while i < list.len() {
        let n = list[i] as usize;
        match list.get(i + 1..i + 1 + n) {
            Some(proto) => out.push(String::from_utf8_lossy(proto).into_owned()),
            None => break,
        }
        i += 1 + n;
    }
    out
}

fn parse_sni(ext: &[u8]) -> Option<String> {
    // server_name_list length, then name_type(1) + length(2) + name
    let name_type = *ext.get(2)?;
    if name_type != 0 {
        return None;
    }
    let len = be16(ext, 3)? as usize;
    ext.get(5..5 + len)
        .map(|n| String::from_utf8_lossy(n).into_owned())
}

/// Read the TLS records carrying the ClientHello.
///
/// Returns every byte consumed (for replay) and the parsed hello, if the
/// bytes were a well-formed ClientHello.
pub async fn read_client_hello<S>(stream: &mut S) -> io::Result<(Vec<u8>, Option<ClientHelloInfo>)>
where
    S: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    let mut handshake = Vec::new();
    loop {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await?;
        raw.extend_from_slice(&header);
        if header[0] != CONTENT_HANDSHAKE {
            return Ok((raw, None));
        }
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        let start = raw.len();
        raw.resize(start + len, 0);
        stream.read_exact(&mut raw[start..]).await?;
        handshake.extend_from_slice(&raw[start..]);

        if handshake.len() >= 4 {
            let need = 4 + (((handshake[1] as usize) << 16)
                | ((handshake[2] as usize) << 8)
                | handshake[3] as usize);
            if handshake.len() >= need {
                return Ok((raw, parse_client_hello(&handshake).ok()));
            }
        }
        if raw.len() > MAX_HELLO_LEN {
            return Ok((raw, None));
        }
    }
}

/// A stream that yields `prefix` before reading from `inner`.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let rest = &this.prefix[this.pos..];
            let n = rest.len().min(buf.remaining());
            buf.put_slice(&rest[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
