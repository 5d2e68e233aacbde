// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared test utilities to reduce duplication across test modules.

use crate::ca::CertificateAuthority;
use crate::fetch::{Fetcher, FetcherOptions};
use crate::rules::RuleStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Rules used across proxy and probe tests.
pub const TEST_RULES: &str = r#"{"finger":[
    {"cms":"Nginx","method":"keyword","location":"header","logic":"or","rule":["nginx"]},
    {"cms":"Joomla","method":"keyword","location":"body","logic":"and","rule":["Joomla!","/media/jui/"]},
    {"cms":"Shiro","method":"keyword","location":"header","logic":"or","rule":["rememberMe=deleteMe"]},
    {"cms":"Tomcat","method":"keyword","location":"title","logic":"or","rule":["Apache Tomcat"]}
]}"#;

pub fn make_test_rules() -> anyhow::Result<Arc<RuleStore>> {
    Ok(Arc::new(RuleStore::from_json(TEST_RULES)?))
}

/// Create a test connection metadata with standard test address
pub fn make_test_conn() -> crate::connection::ConnectionMetadata {
    crate::connection::ConnectionMetadata::new(
        "127.0.0.1:12345".parse().expect("valid test address"),
    )
}

/// Direct fetcher with a short timeout and no national fallback.
pub fn make_test_fetcher() -> anyhow::Result<Fetcher> {
    make_test_fetcher_with(5)
}

pub fn make_test_fetcher_with(max_redirects: usize) -> anyhow::Result<Fetcher> {
    Fetcher::new(&FetcherOptions {
        timeout: Duration::from_secs(5),
        max_redirects,
        proxy: None,
        national_fallback: false,
    })
}

/// Fresh CA in a unique temp directory; the caller removes the directory.
pub async fn make_test_ca() -> anyhow::Result<(Arc<CertificateAuthority>, PathBuf)> {
    let dir = std::env::temp_dir().join(format!("hfinger_test_ca_{}", Uuid::new_v4()));
    let ca =
        CertificateAuthority::load_or_generate(&dir.join("ca.crt"), &dir.join("ca.key"), false)
            .await?;
    Ok((ca, dir))
}
