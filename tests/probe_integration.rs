// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hfinger::fetch::{Fetcher, FetcherOptions};
use hfinger::output::ResultCollector;
use hfinger::probe::Orchestrator;
use hfinger::rules::RuleStore;

const RULES: &str = r#"{"finger":[
    {"cms":"Tomcat","method":"keyword","location":"title","logic":"or","rule":["Apache Tomcat"]},
    {"cms":"Joomla","method":"keyword","location":"body","logic":"and","rule":["Joomla!","/media/jui/"]},
    {"cms":"Landing","method":"keyword","location":"body","logic":"or","rule":["landing-marker"]}
]}"#;

fn orchestrator() -> anyhow::Result<Orchestrator> {
    let fetcher = Fetcher::new(&FetcherOptions {
        timeout: Duration::from_secs(5),
        max_redirects: 5,
        proxy: None,
        national_fallback: false,
    })?;
    Ok(Orchestrator::new(
        Arc::new(fetcher),
        Arc::new(RuleStore::from_json(RULES)?),
        ResultCollector::new(None),
    ))
}

async fn mount_html(server: &MockServer, at: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(body),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn meta_refresh_is_followed_to_the_landing_page() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_html(
        &server,
        "/",
        r#"<html><head><meta http-equiv="refresh" content="0;url=/landing"></head></html>"#,
    )
    .await;
    mount_html(&server, "/landing", "<title>Apache Tomcat/9.0</title>").await;

    let report = orchestrator()?.process_url(&server.uri()).await;
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].cms, "Tomcat");
    assert_eq!(report.results[0].url, format!("{}/landing", server.uri()));
    assert!(report.unmatched.is_none());
    Ok(())
}

#[tokio::test]
async fn script_location_redirect_is_followed() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_html(
        &server,
        "/",
        r#"<html><script>window.location.href = "/app";</script></html>"#,
    )
    .await;
    mount_html(&server, "/app", "<p>landing-marker</p>").await;

    let report = orchestrator()?.process_url(&server.uri()).await;
    let cms: Vec<_> = report.results.iter().map(|r| r.cms.as_str()).collect();
    assert_eq!(cms, vec!["Landing"]);
    assert_eq!(report.results[0].url, format!("{}/app", server.uri()));
    Ok(())
}

#[tokio::test]
async fn refresh_inside_noscript_is_ignored() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_html(
        &server,
        "/",
        r#"<title>Apache Tomcat</title><noscript><meta http-equiv="refresh" content="0;url=/landing"></noscript>"#,
    )
    .await;
    mount_html(&server, "/landing", "<p>landing-marker</p>").await;

    let report = orchestrator()?.process_url(&server.uri()).await;
    let cms: Vec<_> = report.results.iter().map(|r| r.cms.as_str()).collect();
    assert_eq!(cms, vec!["Tomcat"]);
    Ok(())
}

#[tokio::test]
async fn gzip_bodies_are_decoded_before_matching() -> anyhow::Result<()> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(b"<title>Home</title>Joomla! <script src=\"/media/jui/js/x.js\"></script>")?;
    let gz = enc.finish()?;

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .insert_header("content-encoding", "gzip")
                .set_body_bytes(gz),
        )
        .mount(&server)
        .await;

    let report = orchestrator()?.process_url(&server.uri()).await;
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].cms, "Joomla");
    assert_eq!(report.results[0].title, "Home");
    Ok(())
}

#[tokio::test]
async fn unreachable_targets_report_nothing() -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let report = orchestrator()?
        .process_url(&format!("http://{}", addr))
        .await;
    assert!(report.results.is_empty());
    assert!(report.unmatched.is_none());
    Ok(())
}
