// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use ulid::Ulid;

use intercept_http::{ca, config, proxy, repo, reqlog, scope};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "intercept-http")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(long)]
    listen: Option<String>,

    /// CA certificate PEM path (generated when absent)
    #[arg(long)]
    ca_cert: Option<String>,

    /// CA private key PEM path (generated when absent)
    #[arg(long)]
    ca_key: Option<String>,

    /// Optional config TOML path
    #[arg(long)]
    config: Option<String>,

    /// Project ULID to activate request logging for at startup
    #[arg(long)]
    project: Option<String>,

    /// Skip logging for requests that match no scope rule
    #[arg(long, default_value_t = false)]
    bypass_out_of_scope: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut cfg = if let Some(ref p) = args.config {
        config::Config::load_from_path(p).await.unwrap_or_else(|e| {
            warn!(%p, %e, "failed to load config, using defaults");
            config::Config::default()
        })
    } else {
        config::Config::default()
    };

    // CLI flags override the config file.
    if let Some(listen) = args.listen {
        cfg.general.listen = listen;
    }
    if let Some(p) = args.ca_cert {
        cfg.tls.ca_cert_path = p;
    }
    if let Some(p) = args.ca_key {
        cfg.tls.ca_key_path = p;
    }

    let addr: SocketAddr = cfg.general.listen.parse()?;

    let ca = ca::CertificateAuthority::load_or_generate(
        Path::new(&cfg.tls.ca_cert_path),
        Path::new(&cfg.tls.ca_key_path),
    )
    .await?;

    let repository = Arc::new(repo::InMemoryRepository::new());
    let scope = Arc::new(scope::Scope::default());
    let reqlog = reqlog::RequestLogService::new(reqlog::RequestLogConfig {
        repository,
        scope: scope.clone(),
        max_capture_bytes: cfg.capture.max_body_bytes,
    });

    if let Some(ref project) = args.project {
        let id = project
            .parse::<Ulid>()
            .context("invalid --project identifier")?;
        reqlog.set_active_project_id(id);
        info!(project_id = %id, "request logging active");
    }
    reqlog.set_bypass_out_of_scope(args.bypass_out_of_scope);

    let mut proxy = proxy::Proxy::new(proxy::ProxyConfig {
        ca,
        upstream_client: None,
    });
    proxy.use_request_modifier(reqlog.request_modifier());
    proxy.use_response_modifier(reqlog.response_modifier());

    let server = proxy.run(addr);

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(%e, "server error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
