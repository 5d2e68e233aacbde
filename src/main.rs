// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use anyhow::{bail, Context};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hfinger::config::Config;
use hfinger::favicon;
use hfinger::fetch::{Fetcher, FetcherOptions};
use hfinger::output::ResultCollector;
use hfinger::probe::Orchestrator;
use hfinger::proxy::{self, ProxyContext};
use hfinger::rules::RuleStore;

#[derive(Parser, Debug)]
#[command(name = "hfinger", version, about)]
struct Args {
    /// Single target URL
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// File with one target URL per line
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Run the intercepting proxy on this address, e.g. 127.0.0.1:8080
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Upstream proxy, http:// or socks5://
    #[arg(short = 'p', long)]
    proxy: Option<String>,

    /// Concurrent targets (file mode) or connections (proxy mode)
    #[arg(short = 't', long = "thread")]
    threads: Option<usize>,

    /// Maximum redirects followed per probe
    #[arg(short = 'r', long = "redirect")]
    max_redirects: Option<usize>,

    /// Write results as JSON to this file
    #[arg(short = 'j', long = "output-json")]
    output_json: Option<PathBuf>,

    /// Optional TOML config path
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Fingerprint rule file
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Print the favicon hash of a local file and exit
    #[arg(long = "icon-hash")]
    icon_hash: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Url(String),
    File(PathBuf),
    Listen(SocketAddr),
}

impl Args {
    /// Exactly one of `-u`, `-f`, `-l` must be given.
    fn mode(&self, cfg: &Config) -> anyhow::Result<Mode> {
        let listen = self.listen.clone().or_else(|| {
            if self.url.is_none() && self.file.is_none() {
                cfg.mitm.listen.clone()
            } else {
                None
            }
        });
        match (&self.url, &self.file, listen) {
            (Some(u), None, None) => Ok(Mode::Url(u.trim().to_string())),
            (None, Some(f), None) => Ok(Mode::File(f.clone())),
            (None, None, Some(l)) => Ok(Mode::Listen(
                l.parse().with_context(|| format!("invalid listen address {}", l))?,
            )),
            (None, None, None) => bail!("no target: pass one of -u, -f or -l"),
            _ => bail!("-u, -f and -l are mutually exclusive"),
        }
    }

    /// Command-line values win over the config file.
    fn apply(&self, cfg: &mut Config) {
        if let Some(p) = &self.proxy {
            cfg.probe.proxy = Some(p.clone());
        }
        if let Some(t) = self.threads {
            cfg.probe.threads = t;
        }
        if let Some(r) = self.max_redirects {
            cfg.probe.max_redirects = r;
        }
        if let Some(j) = &self.output_json {
            cfg.output.json = Some(j.clone());
        }
        if let Some(r) = &self.rules {
            cfg.rules.path = r.clone();
        }
    }
}

async fn load_config(args: &Args) -> anyhow::Result<(Config, Mode)> {
    let mut cfg = match &args.config {
        Some(p) => Config::load_from_path(p).await?,
        None => Config::default(),
    };
    args.apply(&mut cfg);
    cfg.validate()?;
    let mode = args.mode(&cfg)?;
    Ok((cfg, mode))
}

async fn icon_hash(path: &Path) -> anyhow::Result<i32> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(favicon::favicon_hash(&data))
}

async fn run(cfg: Config, mode: Mode, rules: Arc<RuleStore>) -> anyhow::Result<()> {
    let collector = ResultCollector::new(cfg.output.json.clone());
    match mode {
        Mode::Listen(addr) => {
            let (ctx, mut errors) = ProxyContext::build(&cfg, rules, collector).await?;
            info!(
                "Download the root certificate from http://{}{} and trust it in your client",
                addr,
                proxy::CERT_PATH
            );
            tokio::spawn(async move {
                while let Some(e) = errors.recv().await {
                    warn!("fingerprint worker: {}", e);
                }
            });
            proxy::run_proxy(addr, ctx).await
        }
        Mode::Url(url) => {
            let orchestrator = orchestrator(&cfg, rules, collector)?;
            orchestrator.scan(vec![url], 1).await?;
            Ok(())
        }
        Mode::File(path) => {
            let orchestrator = orchestrator(&cfg, rules, collector)?;
            orchestrator.scan_file(&path, cfg.probe.threads).await?;
            Ok(())
        }
    }
}

fn orchestrator(
    cfg: &Config,
    rules: Arc<RuleStore>,
    collector: ResultCollector,
) -> anyhow::Result<Orchestrator> {
    let fetcher = Fetcher::new(&FetcherOptions {
        timeout: cfg.probe.timeout(),
        max_redirects: cfg.probe.max_redirects,
        proxy: cfg.probe.proxy.clone(),
        national_fallback: cfg.mitm.national,
    })?;
    Ok(Orchestrator::new(Arc::new(fetcher), rules, collector))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    if let Some(path) = &args.icon_hash {
        match icon_hash(path).await {
            Ok(hash) => {
                println!("{}", hash);
                return Ok(());
            }
            Err(e) => {
                error!("{:#}", e);
                std::process::exit(1);
            }
        }
    }

    let (cfg, mode) = match load_config(&args).await {
        Ok(v) => v,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let rules = match RuleStore::load_from_path(&cfg.rules.path).await {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };
    info!(
        rules = rules.len(),
        cms = rules.distinct_cms(),
        "loaded fingerprint rules from {}",
        cfg.rules.path.display()
    );

    tokio::select! {
        res = run(cfg, mode, rules) => {
            if let Err(e) = res {
                error!("{:#}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
