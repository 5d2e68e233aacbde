// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Redirect discovery for probe hops.
//!
//! Sources, in priority order: `Location` header, `Refresh` header, an HTML
//! meta refresh outside `<noscript>`, then two inline script idioms. Broader
//! script-driven redirects are deliberately not recognised.

use hyper::header::{HeaderMap, LOCATION};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use url::Url;

static NOSCRIPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<noscript[^>]*>.*?</noscript>").expect("valid noscript regex")
});

static META_REFRESH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<meta\b[^>]*http-equiv\s*=\s*["']?refresh["']?[^>]*>"#)
        .expect("valid meta regex")
});

static META_CONTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\bcontent\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid content regex")
});

static JS_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#">\s*window\.location\.href\s*=\s*['"]([^'"]+)['"]\s*;?\s*</script>"#)
        .expect("valid href regex")
});

static JS_REPLACE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#">\s*window\.location\.replace\s*\(\s*['"]([^'"]+)['"]\s*\)\s*;?\s*</script>"#)
        .expect("valid replace regex")
});

/// Extract the `url=` part of a refresh directive such as `0; url=/next`.
fn refresh_target(value: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let idx = lower.find("url=")?;
    let target = value[idx + 4..]
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .trim();
    if target.is_empty() {
        None
    } else {
        Some(target.to_string())
    }
}

fn meta_refresh(body: &[u8]) -> Option<String> {
    let clean = NOSCRIPT.replace_all(body, &b""[..]);
    let tag = META_REFRESH.find(&clean)?;
    let caps = META_CONTENT.captures(tag.as_bytes())?;
    let content = caps.get(1).or_else(|| caps.get(2))?;
    refresh_target(&String::from_utf8_lossy(content.as_bytes()))
}

fn script_redirect(body: &[u8]) -> Option<String> {
    [&*JS_HREF, &*JS_REPLACE].iter().find_map(|re| {
        re.captures(body)
            .and_then(|c| c.get(1))
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
    })
}

/// Find the next hop announced by a response, if any.
pub fn extract_redirect(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Some(loc) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
        let loc = loc.trim();
        if !loc.is_empty() {
            return Some(loc.to_string());
        }
    }
    if let Some(target) = headers
        .get("refresh")
        .and_then(|v| v.to_str().ok())
        .and_then(refresh_target)
    {
        return Some(target);
    }
    meta_refresh(body).or_else(|| script_redirect(body))
}

/// Resolve a possibly relative redirect target against the current URL.
pub fn resolve(base: &str, target: &str) -> Result<String, url::ParseError> {
    let base = Url::parse(base)?;
    Ok(base.join(target)?.to_string())
}
