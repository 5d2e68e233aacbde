// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Fingerprint rule definitions and the process-wide rule store.
//!
//! The store is loaded once at startup and shared behind an `Arc`; nothing
//! mutates it afterwards, so matching reads it concurrently without locking.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// How a rule inspects a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Keyword,
    Faviconhash,
    #[default]
    #[serde(other)]
    Unsupported,
}

/// Which facet of the response a keyword rule searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Body,
    Header,
    Title,
    #[default]
    #[serde(other)]
    Unsupported,
}

/// How the literals of one rule combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
    #[default]
    #[serde(other)]
    Unsupported,
}

/// A single signature asserting a CMS identity.
#[derive(Debug, Clone, Deserialize)]
pub struct Fingerprint {
    pub cms: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub rule: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    finger: Vec<Fingerprint>,
}

/// Immutable table of fingerprint rules.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: Vec<Fingerprint>,
}

impl RuleStore {
    pub fn new(rules: Vec<Fingerprint>) -> Self {
        Self { rules }
    }

    /// Parse a rule set from the JSON document format `{"finger": [...]}`.
    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        let file: RuleFile = serde_json::from_str(data).context("invalid fingerprint rule file")?;
        Ok(Self::new(file.finger))
    }

    pub async fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let s = tokio::fs::read_to_string(path_ref)
            .await
            .with_context(|| format!("failed to read rule file {}", path_ref.display()))?;
        Self::from_json(&s)
    }

    pub fn rules(&self) -> &[Fingerprint] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of distinct CMS names covered by the store.
    pub fn distinct_cms(&self) -> usize {
        self.rules
            .iter()
            .map(|r| r.cms.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}
