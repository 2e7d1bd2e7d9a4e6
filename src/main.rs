use anyhow::{Context, Result};
use clap::Parser;
use embedded_ldap_server::metrics::{ReadyProbe, ReadyState};
use embedded_ldap_server::{run_metrics_server, tls, Config, LdapServer, Metrics};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "embedded-ldap-server")]
#[command(about = "In-memory LDAPv3 directory server for integration tests")]
struct Args {
    /// Configuration file path (defaults are used when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("embedded_ldap_server={},info", log_level))
        .init();

    info!("Starting embedded LDAP server");

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path)?
        }
        None => {
            info!("No --config given, using defaults");
            Config::default()
        }
    };
    if let Some(url) = args.listen {
        config.listen.url = url;
    }

    info!("Configuration loaded:");
    info!("  Listen URL: {}", config.listen.url);
    info!("  Base DN: {:?}", config.base_dn);
    info!("  Schema validation: {}", config.validation.enabled);
    info!("  Anonymous access: {}", config.allow_anonymous());

    let metrics = Arc::new(Metrics::new());
    let server = LdapServer::from_config(&config, Arc::clone(&metrics))?;

    if let (Some(files), Some(swap)) = (config.tls_files()?, server.tls_acceptor()) {
        tls::spawn_sighup_reload(files, Arc::clone(swap))?;
    }

    let ready = Arc::new(AtomicBool::new(false));
    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let directory = Arc::clone(server.directory());
        let ready_flag = Arc::clone(&ready);
        let probe: ReadyProbe = Arc::new(move || ReadyState {
            ready: ready_flag.load(Ordering::Relaxed),
            entries: directory.len(),
        });
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, probe).await {
                error!("Metrics server error: {:#}", e);
            }
        });
    }

    let bound = server.bind().await?;
    ready.store(true, Ordering::Relaxed);
    info!("Clients can connect to {}", bound.url());

    bound
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received ctrl-c");
        })
        .await
        .context("LDAP server")?;

    Ok(())
}
