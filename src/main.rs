//! certloader - hot-reloading mTLS client credentials

use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use certloader::{
    access_strategy::{AccessStrategies, AccessStrategy, StaticTenant, TenantProvider},
    cli::{Cli, Command},
    config::Config,
    credential::CredentialInfo,
    service::{CredentialService, shutdown_signal},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Inspect) => run_inspect(cli.config.as_deref()).await,
        Some(Command::Fetch {
            ref url,
            ref strategies,
            ref tenant,
        }) => run_fetch(cli.config.as_deref(), url, strategies, tenant.clone()).await,
        Some(Command::Run) | None => run_service(cli.config.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Config::load(path).context("Failed to load configuration")
}

/// Keep credentials hot until interrupted
async fn run_service(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        secrets = config.credentials.secrets.len(),
        feed = ?config.feed.backend,
        "Starting certloader"
    );

    let service = CredentialService::start(&config, None)
        .await
        .context("Credential service failed to start")?;
    service.run_until(shutdown_signal()).await;

    info!("certloader shutdown complete");
    Ok(())
}

/// Print loaded credential metadata
async fn run_inspect(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let service = CredentialService::start(&config, None)
        .await
        .context("Credential service failed to start")?;

    let credentials: BTreeMap<String, CredentialInfo> = service.credentials().into_iter().collect();
    println!("{}", serde_json::to_string_pretty(&credentials)?);

    service.shutdown().await;
    Ok(())
}

/// Fetch one document
async fn run_fetch(
    config_path: Option<&Path>,
    url: &str,
    strategies: &[String],
    tenant: Option<String>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let tenant = tenant.map(|t| Arc::new(StaticTenant(t)) as Arc<dyn TenantProvider>);
    let service = CredentialService::start(&config, tenant)
        .await
        .context("Credential service failed to start")?;

    let declared = AccessStrategies(strategies.iter().map(|s| parse_strategy(s)).collect());
    let outcome = service.fetch(&declared, url).await;
    service.shutdown().await;

    let (strategy, response) = outcome.with_context(|| format!("Fetching {url} failed"))?;
    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;

    eprintln!("{status} via {strategy}");
    println!("{body}");
    Ok(())
}

fn parse_strategy(value: &str) -> AccessStrategy {
    match value.strip_prefix("custom=") {
        Some(custom_type) => AccessStrategy::custom(custom_type, None),
        None => AccessStrategy::new(value),
    }
}
