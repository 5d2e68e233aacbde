// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Rule evaluation against a single response view.
//!
//! Matching is a pure read of the rule and the view; any combination of
//! method, location or logic outside the known set never matches.

use crate::favicon;
use crate::rules::{Fingerprint, Location, Logic, Method, RuleStore};
use hyper::header::HeaderMap;

/// The facets of one response that rules can inspect.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Header names in canonical form (`Content-Type`) with each value.
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub title: String,
    favicon_hash: Option<i32>,
}

impl Page {
    pub fn new(headers: &HeaderMap, body: &[u8], title: impl Into<String>) -> Self {
        Self {
            headers: header_pairs(headers),
            body: String::from_utf8_lossy(body).into_owned(),
            title: title.into(),
            favicon_hash: None,
        }
    }

    /// Attach favicon bytes; the hash is computed once here.
    pub fn with_favicon(mut self, raw: &[u8]) -> Self {
        self.favicon_hash = Some(favicon::favicon_hash(raw));
        self
    }

    pub fn favicon_hash(&self) -> Option<i32> {
        self.favicon_hash
    }
}

/// Canonical MIME header key: first letter and letters after `-` upper-cased.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                canonical_header_name(k.as_str()),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn combine<F: Fn(&str) -> bool>(logic: Logic, literals: &[String], hit: F) -> bool {
    match logic {
        Logic::And => literals.iter().all(|r| hit(r)),
        Logic::Or => literals.iter().any(|r| hit(r)),
        Logic::Unsupported => false,
    }
}

fn header_contains(page: &Page, literal: &str) -> bool {
    page.headers
        .iter()
        .any(|(k, v)| k.contains(literal) || v.contains(literal))
}

/// Whether `rule` holds for `page`.
pub fn matches(rule: &Fingerprint, page: &Page) -> bool {
    match rule.method {
        Method::Keyword => match rule.location {
            Location::Body => combine(rule.logic, &rule.rule, |r| page.body.contains(r)),
            Location::Header => combine(rule.logic, &rule.rule, |r| header_contains(page, r)),
            Location::Title => combine(rule.logic, &rule.rule, |r| page.title.contains(r)),
            Location::Unsupported => false,
        },
        Method::Faviconhash => match page.favicon_hash {
            Some(hash) => rule
                .rule
                .iter()
                .filter_map(|r| favicon::parse_rule_hash(r))
                .any(|r| r == hash),
            None => false,
        },
        Method::Unsupported => false,
    }
}

impl RuleStore {
    /// Rules that hold for `page`, in store order.
    pub fn matching<'a>(&'a self, page: &'a Page) -> impl Iterator<Item = &'a Fingerprint> + 'a {
        self.rules().iter().filter(move |r| matches(r, page))
    }
}
