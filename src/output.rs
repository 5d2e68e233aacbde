// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Fingerprint results and their accumulation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Placeholder used when a response carries no server header or title.
pub const NONE: &str = "None";

fn or_none(s: &str) -> String {
    if s.trim().is_empty() {
        NONE.to_string()
    } else {
        s.to_string()
    }
}

/// One CMS identified on one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerResult {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "CMS")]
    pub cms: String,
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "StatusCode")]
    pub status_code: u16,
    #[serde(rename = "Title")]
    pub title: String,
}

impl FingerResult {
    pub fn new(url: &str, cms: &str, server: &str, status_code: u16, title: &str) -> Self {
        Self {
            url: url.to_string(),
            cms: cms.to_string(),
            server: or_none(server),
            status_code,
            title: or_none(title),
        }
    }
}

impl fmt::Display for FingerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] [{}] [{}] [{}]",
            self.url, self.cms, self.status_code, self.server, self.title
        )
    }
}

/// Status line facts of a response, kept for the "not matched" summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub status_code: u16,
    pub server: String,
    pub title: String,
}

impl ResponseSummary {
    pub fn new(status_code: u16, server: &str, title: &str) -> Self {
        Self {
            status_code,
            server: or_none(server),
            title: or_none(title),
        }
    }
}

/// Lock-guarded accumulator handed every emitted result.
///
/// When a path is configured, `flush` rewrites it as a pretty JSON array of
/// everything collected so far.
#[derive(Clone, Default)]
pub struct ResultCollector {
    results: Arc<Mutex<Vec<FingerResult>>>,
    json_path: Option<PathBuf>,
}

impl ResultCollector {
    pub fn new(json_path: Option<PathBuf>) -> Self {
        Self {
            results: Arc::new(Mutex::new(Vec::new())),
            json_path,
        }
    }

    pub async fn add_all(&self, batch: Vec<FingerResult>) {
        if batch.is_empty() {
            return;
        }
        self.results.lock().await.extend(batch);
    }

    pub async fn snapshot(&self) -> Vec<FingerResult> {
        self.results.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.lock().await.is_empty()
    }

    /// Persist the collected results, if an output file was configured.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let Some(path) = &self.json_path else {
            return Ok(());
        };
        let data = {
            let results = self.results.lock().await;
            serde_json::to_vec_pretty(&*results)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}
