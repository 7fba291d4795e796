use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use authguard::config::{AuthguardConfig, LogFormat, LoggingConfig};
use authguard::error::AuthguardError;
use authguard::grpc::GrpcServer;
use authguard::ratelimit::{BucketStore, RateLimiter, RateLimiterConfig};
use authguard::tasks;

/// Token-bucket rate limiter for identity gateway authentication routes.
#[derive(Debug, Parser)]
#[command(name = "authguard", version, about)]
struct Cli {
    /// Service settings file (YAML, TOML or JSON)
    #[arg(short, long, env = "AUTHGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Rate limiter document, overrides `rate_limiting.config_path`
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Log format, overrides `logging.format`
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Validate the rate limiter document, print every violation and exit
    #[arg(long)]
    check_config: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AuthguardConfig::load(cli.config.as_deref())
        .context("failed to load service settings")?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    let rules_path = cli
        .rules
        .clone()
        .or_else(|| config.rate_limiting.config_path.as_ref().map(PathBuf::from))
        .context("no rate limiter document given (--rules or rate_limiting.config_path)")?;

    init_tracing(&config.logging);

    if cli.check_config {
        return check_config(&rules_path);
    }

    info!("Starting Authguard Rate Limiting Service");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance_id = %config.server.instance_id,
        grpc_addr = %config.server.grpc_addr,
        "Configuration loaded"
    );

    let rules = match RateLimiterConfig::from_file(&rules_path) {
        Ok(rules) => rules,
        Err(AuthguardError::InvalidRules(e)) => {
            for violation in &e.violations {
                error!(path = %rules_path.display(), violation = %violation, "Invalid rate limiter configuration");
            }
            anyhow::bail!("refusing to start: {} configuration violation(s)", e.violations.len());
        }
        Err(e) => return Err(e).context("failed to read rate limiter document"),
    };

    let settings = &config.rate_limiting;
    let store = BucketStore::with_shards(settings.shard_count);
    let rate_limiter = Arc::new(
        RateLimiter::with_backend(rules, store).with_options(settings.limiter_options()),
    );
    info!(
        shards = settings.shard_count,
        failure_policy = ?settings.failure_policy,
        "Rate limiter initialized"
    );

    let sweeper = (settings.sweep_interval_secs > 0).then(|| {
        tasks::spawn_sweeper(
            Arc::clone(&rate_limiter),
            Duration::from_secs(settings.sweep_interval_secs),
        )
    });
    let reload_period = (settings.config_reload_interval_secs > 0)
        .then(|| Duration::from_secs(settings.config_reload_interval_secs));
    let reloader = tasks::spawn_reloader(Arc::clone(&rate_limiter), rules_path, reload_period);

    let grpc_server = GrpcServer::new(config.server.grpc_addr, rate_limiter);

    // Run the server with graceful shutdown on Ctrl+C
    let served = grpc_server.serve_with_shutdown(shutdown_signal()).await;

    reloader.abort();
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    served?;

    info!("Authguard Rate Limiting Service stopped");
    Ok(())
}

/// Validate a document and report on stdout/stderr without starting anything.
///
/// Early-expiry warnings are emitted through the log.
fn check_config(path: &std::path::Path) -> anyhow::Result<()> {
    match RateLimiterConfig::from_file(path) {
        Ok(_) => {
            println!("{}: configuration is valid", path.display());
            Ok(())
        }
        Err(AuthguardError::InvalidRules(e)) => {
            for violation in &e.violations {
                eprintln!("{}", violation);
            }
            anyhow::bail!("{}: {} violation(s)", path.display(), e.violations.len())
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
