// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Background fingerprinting of intercepted exchanges.
//!
//! Forwarders hand captures to a bounded queue and return immediately; a
//! single worker matches them, deduplicates per `(url, cms)` and persists the
//! results. Worker failures are reported on a separate channel.

use crate::html;
use crate::matcher::Page;
use crate::output::{FingerResult, ResultCollector, NONE};
use crate::rules::RuleStore;
use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE, SERVER};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A buffered origin response seen by the proxy.
#[derive(Debug, Clone)]
pub struct Capture {
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to decode body of {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write results: {0}")]
    Output(String),
}

/// Sending half of the fingerprint queue. Cheap to clone.
#[derive(Clone)]
pub struct FingerprintQueue {
    tx: mpsc::Sender<Capture>,
}

impl FingerprintQueue {
    /// Start the worker. It exits once every queue handle has been dropped.
    pub fn spawn(
        rules: Arc<RuleStore>,
        collector: ResultCollector,
        capacity: usize,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<FingerprintError>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker(rx, rules, collector, err_tx));
        (Self { tx }, err_rx, handle)
    }

    /// Enqueue a capture without waiting. Returns false if it was dropped.
    pub fn submit(&self, capture: Capture) -> bool {
        match self.tx.try_send(capture) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(c)) => {
                warn!(url = %c.url, "fingerprint queue full, dropping capture");
                false
            }
            Err(mpsc::error::TrySendError::Closed(c)) => {
                warn!(url = %c.url, "fingerprint worker stopped, dropping capture");
                false
            }
        }
    }
}

/// How the fingerprint worker ended.
#[derive(Debug, PartialEq, Eq)]
pub enum WorkerExit {
    Drained,
    Panicked,
    Cancelled,
}

/// Wait for the worker and report anything but a clean drain.
pub async fn watch_worker(handle: JoinHandle<()>) -> WorkerExit {
    match handle.await {
        Ok(()) => WorkerExit::Drained,
        Err(e) if e.is_panic() => {
            error!("fingerprint worker panicked, interception results stop here: {}", e);
            WorkerExit::Panicked
        }
        Err(e) => {
            warn!("fingerprint worker cancelled: {}", e);
            WorkerExit::Cancelled
        }
    }
}

async fn worker(
    mut rx: mpsc::Receiver<Capture>,
    rules: Arc<RuleStore>,
    collector: ResultCollector,
    errors: mpsc::UnboundedSender<FingerprintError>,
) {
    let mut seen: HashSet<String> = HashSet::new();
    while let Some(capture) = rx.recv().await {
        let found = match fingerprint_capture(&rules, &capture) {
            Ok(found) => found,
            Err(e) => {
                let _ = errors.send(e);
                continue;
            }
        };
        let fresh: Vec<FingerResult> = found
            .into_iter()
            .filter(|r| seen.insert(format!("{}::{}", r.url, r.cms)))
            .collect();
        if fresh.is_empty() {
            continue;
        }
        for r in &fresh {
            info!("[+] {}", r);
        }
        collector.add_all(fresh).await;
        if let Err(e) = collector.flush().await {
            let _ = errors.send(FingerprintError::Output(e.to_string()));
        }
    }
    debug!("fingerprint worker finished");
}

/// Match one capture against the rule store.
///
/// A 200 image response, or a 200 response whose URL contains the page's
/// favicon href, is hashed as a favicon; anything else is matched as a page.
pub fn fingerprint_capture(
    rules: &RuleStore,
    capture: &Capture,
) -> Result<Vec<FingerResult>, FingerprintError> {
    let encoding = capture
        .headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let decoded =
        html::decode_body(encoding, &capture.body).map_err(|source| FingerprintError::Decode {
            url: capture.url.clone(),
            source,
        })?;

    let href = html::extract_favicon_href(&decoded);
    let is_image = capture
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"));
    let (page, title) = if capture.status == 200 && (is_image || capture.url.contains(&href)) {
        (
            Page::new(&capture.headers, b"", NONE).with_favicon(&decoded),
            NONE.to_string(),
        )
    } else {
        let title = html::extract_title(&decoded);
        (Page::new(&capture.headers, &decoded, title.clone()), title)
    };

    let server = capture
        .headers
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    Ok(rules
        .matching(&page)
        .map(|rule| FingerResult::new(&capture.url, &rule.cms, server, capture.status, &title))
        .collect())
}
