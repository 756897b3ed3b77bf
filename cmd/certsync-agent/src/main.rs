//! certsync agent
//!
//! Keeps a reverse proxy's TLS certificate current: when the installed
//! certificate ages past the renewal threshold, the newest issued certificate
//! for the domain is downloaded from the certificate authority, installed
//! atomically, and the proxy is asked to reload.
//!
//! Additionally provides HTTP endpoints for:
//! - /healthz - Liveness checks
//! - /status - Last cycle and renewal

use anyhow::Context;
use certsync_config::{AgentConfig, CONFIG_PATH_ENV};
use certsync_crypto::{inspect_cert, needs_renewal};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

mod authority;
mod candidate;
mod fetcher;
mod health;
mod metrics;
mod orchestrator;
mod reload;
mod selector;
mod telemetry;
mod tencent;

use authority::CertificateAuthorityClient;
use metrics::RenewalMetrics;
use orchestrator::RenewalOrchestrator;
use reload::{DockerCliTrigger, ReloadTrigger};
use telemetry::LogFormat;
use tencent::TencentSslClient;

#[derive(Parser)]
#[command(name = "certsync-agent", version)]
#[command(about = "Keeps a TLS certificate in sync with the certificate authority", long_about = None)]
struct Cli {
    /// Base configuration file (YAML, or JSON with a .json extension)
    #[arg(long, env = "CERTSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// OTLP collector receiving traces and metrics
    #[arg(long, env = "OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Renew on startup, then every check interval (default)
    Run,
    /// Run a single renewal cycle and exit
    Once,
    /// Show whether the installed certificate is due for renewal
    Check,
    /// List the authority's certificates for the domain and the one that would be installed
    Candidates,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let telemetry =
        telemetry::init_telemetry("certsync-agent", cli.otlp_endpoint.as_deref(), cli.log_format)?;

    let result = run(cli).await;
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "certsync-agent failed");
    }

    telemetry.shutdown();
    result
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli.config.as_deref()).context("invalid configuration")?;
    info!(
        domain = %config.domain,
        primary_dir = %config.primary_dir.display(),
        mirror_dir = ?config.mirror_dir,
        threshold_days = config.renewal_threshold_days,
        interval_days = config.check_interval_days,
        "Configuration loaded"
    );
    if config.key_file_mode & 0o077 != 0 {
        warn!(
            mode = %format!("{:o}", config.key_file_mode),
            "Private key mode grants group or other access"
        );
    }

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::Check = command {
        check(&config)?;
        return Ok(ExitCode::SUCCESS);
    }

    let authority: Arc<dyn CertificateAuthorityClient> = Arc::new(
        TencentSslClient::new(&config.credentials, &config.authority)
            .context("failed to create authority client")?,
    );
    let trigger: Arc<dyn ReloadTrigger> = Arc::new(DockerCliTrigger::new(&config.reload));
    let metrics = Arc::new(RenewalMetrics::new());
    let orchestrator = RenewalOrchestrator::new(&config, authority, trigger, metrics)
        .context("invalid renewal settings")?;

    match command {
        Commands::Run => {
            serve(&config, &orchestrator).await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Once => {
            let outcome = orchestrator.run_cycle().await;
            Ok(if outcome.is_failure() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Candidates => {
            candidates(&orchestrator).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check => Ok(ExitCode::SUCCESS),
    }
}

/// Environment configuration, with `--config` standing in for `CERTSYNC_CONFIG`
fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    let config = match path {
        Some(path) => {
            let path = path.to_string_lossy().into_owned();
            AgentConfig::load_with(|key| {
                if key == CONFIG_PATH_ENV {
                    Some(path.clone())
                } else {
                    std::env::var(key).ok()
                }
            })?
        }
        None => AgentConfig::load()?,
    };
    Ok(config)
}

async fn serve(config: &AgentConfig, orchestrator: &RenewalOrchestrator) {
    let health_server = config.health_addr.map(|addr| {
        let state = Arc::new(health::HealthState {
            status: orchestrator.status(),
        });
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, state).await {
                error!(addr = %addr, error = %e, "Health server failed");
            }
        })
    });

    orchestrator.run(shutdown_signal()).await;

    if let Some(server) = health_server {
        server.abort();
    }
    info!("certsync-agent stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

fn check(config: &AgentConfig) -> anyhow::Result<()> {
    let path = config.installed_cert_path();
    let due = needs_renewal(&path, config.renewal_threshold_days);

    println!("Certificate:  {}", path.display());
    println!(
        "Renewal due:  {} (threshold {} days)",
        if due { "yes" } else { "no" },
        config.renewal_threshold_days
    );

    let pem = match std::fs::read(&path) {
        Ok(pem) => pem,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("Status:       not installed");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };

    let summary = inspect_cert(&pem)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    println!(
        "Subject:      {}",
        summary.subject_cn.as_deref().unwrap_or("-")
    );
    println!("Names:        {}", summary.dns_names.join(", "));
    println!("Chain length: {}", summary.chain_len);
    println!(
        "Expires:      {} ({} days)",
        summary.not_after.format("%Y-%m-%d %H:%M:%S UTC"),
        summary.days_remaining(chrono::Utc::now())
    );
    if !summary.covers(&config.domain) {
        println!("Warning:      certificate does not cover {}", config.domain);
    }
    Ok(())
}

async fn candidates(orchestrator: &RenewalOrchestrator) -> anyhow::Result<()> {
    let (candidates, chosen) = orchestrator
        .candidates()
        .await
        .context("failed to list certificates")?;

    println!(
        "{:<20} {:<8} {:<20} {:<24} ALT NAMES",
        "ID", "STATUS", "ISSUED (UTC)", "DOMAIN"
    );
    for candidate in &candidates {
        println!(
            "{:<20} {:<8} {:<20} {:<24} {}",
            candidate.id.as_str(),
            candidate.status.to_string(),
            candidate.issued_at.format("%Y-%m-%d %H:%M:%S"),
            candidate.domain,
            candidate.alt_names.iter().collect::<Vec<_>>().join(",")
        );
    }

    match chosen {
        Some(candidate) => println!("\nSelected: {}", candidate.id),
        None => println!("\nNo eligible certificate among {} candidates", candidates.len()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["certsync-agent"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["certsync-agent", "--log-format", "json", "once"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Some(Commands::Once)));
    }
}
