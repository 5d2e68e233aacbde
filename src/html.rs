// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Lightweight HTML extraction: page title, favicon link, body decoding.

use flate2::read::{GzDecoder, ZlibDecoder};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::io::Read;

static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"));

static LINK_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<link\b[^>]*>").expect("valid link regex"));

static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\b(rel|href)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .expect("valid attribute regex")
});

pub const DEFAULT_FAVICON: &str = "/favicon.ico";

static ENTITY: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z][a-zA-Z0-9]{1,7});")
        .expect("valid entity regex")
});

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "copy" => '\u{a9}',
        "reg" => '\u{ae}',
        "trade" => '\u{2122}',
        "middot" => '\u{b7}',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "hellip" => '\u{2026}',
        "laquo" => '\u{ab}',
        "raquo" => '\u{bb}',
        _ => return None,
    })
}

/// Decode named and numeric character references in one pass.
/// Unknown or invalid references are kept as written.
fn decode_entities(s: &str) -> String {
    ENTITY
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body
                .strip_prefix("#x")
                .or_else(|| body.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(body)
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

/// Text of the first `<title>` element, trimmed; empty when absent.
pub fn extract_title(body: &[u8]) -> String {
    TITLE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(String::from_utf8_lossy(m.as_bytes()).trim()))
        .unwrap_or_default()
}

/// Favicon href declared by `<link rel="icon">` or `<link rel="shortcut icon">`.
///
/// The last declaration wins. Pages without one fall back to `/favicon.ico`.
pub fn extract_favicon_href(body: &[u8]) -> String {
    let mut found: Option<String> = None;
    for tag in LINK_TAG.find_iter(body) {
        let mut rel = None;
        let mut href = None;
        for attr in ATTR.captures_iter(tag.as_bytes()) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map(|m| String::from_utf8_lossy(m.as_bytes()).trim().to_string());
            match attr.get(1).map(|m| m.as_bytes().to_ascii_lowercase()) {
                Some(name) if name == b"rel" => rel = value,
                Some(name) if name == b"href" => href = value,
                _ => {}
            }
        }
        let is_icon = rel
            .map(|r| {
                let r = r.to_ascii_lowercase();
                r == "icon" || r == "shortcut icon"
            })
            .unwrap_or(false);
        if let (true, Some(h)) = (is_icon, href) {
            if !h.is_empty() {
                found = Some(h);
            }
        }
    }
    found.unwrap_or_else(|| DEFAULT_FAVICON.to_string())
}

/// Decode a response body according to its `Content-Encoding`.
///
/// Unknown encodings pass through untouched.
pub fn decode_body(content_encoding: Option<&str>, body: &[u8]) -> std::io::Result<Vec<u8>> {
    let encoding = content_encoding
        .map(|e| e.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let mut out = Vec::new();
    match encoding.as_str() {
        "gzip" | "x-gzip" => {
            GzDecoder::new(body).read_to_end(&mut out)?;
        }
        "deflate" => {
            ZlibDecoder::new(body).read_to_end(&mut out)?;
        }
        _ => return Ok(body.to_vec()),
    }
    Ok(out)
}
