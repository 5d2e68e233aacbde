// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Active fingerprinting of targets.
//!
//! Each target gets three concurrent probes: a plain GET, a GET carrying a
//! `rememberMe` session cookie and a GET for a random path below the target.
//! Every probe follows redirects on its own, and all of them report into one
//! per-target state so a CMS is emitted at most once per target.

use crate::classify;
use crate::fetch::{FetchError, Fetched, Fetcher};
use crate::html;
use crate::matcher::Page;
use crate::output::{FingerResult, ResponseSummary, ResultCollector};
use crate::redirect;
use crate::rules::RuleStore;
use anyhow::Context;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, COOKIE, SERVER};
use hyper::StatusCode;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

/// The request shapes sent to every target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Plain,
    RememberMe,
    MissingPage,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 3] = [ProbeKind::Plain, ProbeKind::RememberMe, ProbeKind::MissingPage];

    fn headers(self) -> Option<HeaderMap> {
        match self {
            ProbeKind::RememberMe => {
                let mut h = HeaderMap::new();
                h.insert(COOKIE, HeaderValue::from_static("rememberMe=1"));
                Some(h)
            }
            _ => None,
        }
    }

    fn url(self, target: &str) -> String {
        match self {
            ProbeKind::MissingPage => missing_page_url(target, rand::random::<u32>()),
            _ => target.to_string(),
        }
    }
}

fn missing_page_url(target: &str, n: u32) -> String {
    if target.ends_with('/') {
        format!("{}{:x}", target, n)
    } else {
        format!("{}/{:x}", target, n)
    }
}

/// Where to fetch the favicon a page declares.
fn favicon_url(page_url: &str, href: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let page = Url::parse(page_url).ok()?;
    if let Some(rest) = href.strip_prefix("//") {
        return Some(format!("{}://{}", page.scheme(), rest));
    }
    let base = page.origin().ascii_serialization();
    if href.starts_with('/') {
        Some(format!("{}{}", base, href))
    } else {
        Some(format!("{}/{}", base, href))
    }
}

#[derive(Default)]
struct MatchState {
    terminal: bool,
    matched: HashSet<String>,
}

/// State shared by the probes of one target.
struct TargetState {
    target: String,
    shared: Mutex<MatchState>,
    first: OnceLock<ResponseSummary>,
}

impl TargetState {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            shared: Mutex::new(MatchState::default()),
            first: OnceLock::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MatchState> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_terminal(&self) -> bool {
        self.lock().terminal
    }

    /// Claim CMS names for emission; only names not seen before are returned.
    fn claim<'a>(&self, names: impl Iterator<Item = &'a str>) -> Vec<String> {
        let mut state = self.lock();
        names
            .filter(|n| state.matched.insert(n.to_string()))
            .map(str::to_string)
            .collect()
    }
}

/// Outcome of probing one target.
#[derive(Debug, Clone)]
pub struct TargetReport {
    pub url: String,
    pub results: Vec<FingerResult>,
    /// First evaluated response of the plain probe, when nothing matched.
    pub unmatched: Option<ResponseSummary>,
    pub terminated: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    fetcher: Arc<Fetcher>,
    rules: Arc<RuleStore>,
    collector: ResultCollector,
}

impl Orchestrator {
    pub fn new(fetcher: Arc<Fetcher>, rules: Arc<RuleStore>, collector: ResultCollector) -> Self {
        Self {
            fetcher,
            rules,
            collector,
        }
    }

    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    /// Run all probes against `url` and wait for them.
    pub async fn process_url(&self, url: &str) -> TargetReport {
        let state = Arc::new(TargetState::new(url));
        let mut probes = JoinSet::new();
        for kind in ProbeKind::ALL {
            let this = self.clone();
            let state = state.clone();
            probes.spawn(async move { this.run_probe(kind, &state).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(found) => results.extend(found),
                Err(e) => error!(%url, "probe task failed: {}", e),
            }
        }

        let (terminated, matched) = {
            let s = state.lock();
            (s.terminal, s.matched.len())
        };
        let unmatched = if matched == 0 && !terminated {
            state.first.get().cloned()
        } else {
            None
        };
        if let Some(s) = &unmatched {
            info!(
                "[{}] [Not Matched] [{}] [{}] [{}]",
                url, s.status_code, s.server, s.title
            );
        }

        TargetReport {
            url: url.to_string(),
            results,
            unmatched,
            terminated,
        }
    }

    /// Probe every target with at most `threads` targets in flight, then
    /// persist the collected results.
    pub async fn scan(&self, targets: Vec<String>, threads: usize) -> anyhow::Result<Vec<TargetReport>> {
        let limiter = Arc::new(Semaphore::new(threads.max(1)));
        let mut tasks = JoinSet::new();
        for target in targets {
            let this = self.clone();
            let limiter = limiter.clone();
            tasks.spawn(async move {
                let _permit = limiter.acquire_owned().await?;
                anyhow::Ok(this.process_url(&target).await)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => error!("target task failed: {}", e),
                Err(e) => error!("target task panicked: {}", e),
            }
        }
        self.collector.flush().await?;
        Ok(reports)
    }

    /// Probe the targets listed one per line in `path`.
    pub async fn scan_file(&self, path: &Path, threads: usize) -> anyhow::Result<Vec<TargetReport>> {
        let targets = read_targets(path).await?;
        info!(count = targets.len(), file = %path.display(), "loaded targets");
        self.scan(targets, threads).await
    }

    async fn fetch_page(&self, url: &str, headers: Option<&HeaderMap>) -> Result<Fetched, FetchError> {
        let resp = self.fetcher.get(url, headers).await?;
        self.fetcher.collect(url, resp).await
    }

    /// One probe: follow redirects up to the ceiling, then match the last hop.
    async fn run_probe(&self, kind: ProbeKind, state: &TargetState) -> Vec<FingerResult> {
        let headers = kind.headers();
        let max_redirects = self.fetcher.max_redirects();
        let mut current = kind.url(&state.target);
        let mut hops = 0;

        loop {
            if state.is_terminal() {
                return Vec::new();
            }

            let fetched = match self.fetch_page(&current, headers.as_ref()).await {
                Ok(f) => f,
                Err(e) => {
                    let mut s = state.lock();
                    if !s.terminal {
                        let category = classify::log_error(&e, &current);
                        s.terminal = category.is_terminal();
                    }
                    return Vec::new();
                }
            };

            let encoding = fetched
                .headers
                .get(CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok());
            let body = html::decode_body(encoding, &fetched.body).unwrap_or_else(|e| {
                debug!(url = %current, error = %e, "undecodable body, matching raw bytes");
                fetched.body.to_vec()
            });

            if hops < max_redirects {
                if let Some(target) = redirect::extract_redirect(&fetched.headers, &body) {
                    match redirect::resolve(&current, &target) {
                        Ok(next) => {
                            info!("Redirecting: {} ➨ {}", current, next);
                            current = next;
                            hops += 1;
                            continue;
                        }
                        Err(_) => warn!("Invalid redirect URL: {}", target),
                    }
                }
            }

            return self.evaluate(kind, state, &current, &fetched, &body).await;
        }
    }

    async fn evaluate(
        &self,
        kind: ProbeKind,
        state: &TargetState,
        url: &str,
        fetched: &Fetched,
        body: &[u8],
    ) -> Vec<FingerResult> {
        let status = fetched.status.as_u16();
        let server = fetched
            .headers
            .get(SERVER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let title = html::extract_title(body);

        let mut page = Page::new(&fetched.headers, body, title.clone());
        if fetched.status == StatusCode::OK {
            if let Some(icon) = self.fetch_favicon(url, body).await {
                page = page.with_favicon(&icon);
            }
        }

        if kind == ProbeKind::Plain {
            let _ = state.first.set(ResponseSummary::new(status, server, &title));
        }

        let claimed = state.claim(self.rules.matching(&page).map(|r| r.cms.as_str()));
        let batch: Vec<FingerResult> = claimed
            .iter()
            .map(|cms| FingerResult::new(url, cms, server, status, &title))
            .collect();
        for r in &batch {
            info!("[+] {}", r);
        }
        self.collector.add_all(batch.clone()).await;
        batch
    }

    async fn fetch_favicon(&self, page_url: &str, body: &[u8]) -> Option<Vec<u8>> {
        let href = html::extract_favicon_href(body);
        let icon_url = favicon_url(page_url, &href)?;
        match self.fetcher.fetch_following(&icon_url, None).await {
            Ok(icon) if icon.status == StatusCode::OK => Some(icon.body.to_vec()),
            Ok(icon) => {
                debug!(%icon_url, status = %icon.status, "favicon not available");
                None
            }
            Err(e) => {
                debug!(%icon_url, error = %e, "favicon fetch failed");
                None
            }
        }
    }
}

/// Non-empty, trimmed lines of a target list.
pub async fn read_targets(path: &Path) -> anyhow::Result<Vec<String>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read target file {}", path.display()))?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
