use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use pulsewatch_core::{Clock, Config, ConfigHandle, Result, SqlStore, Store, SystemClock, Worker};

/// Preflight checks for CLI operations, mirroring the operational posture of
/// the service's own deploy docs: don't run as root, don't leave the config
/// file world-writable.
mod security {
    use std::path::Path;

    pub fn check_not_root() -> std::result::Result<(), String> {
        #[cfg(unix)]
        {
            let uid = unsafe { libc::getuid() };
            if uid == 0 {
                return Err(
                    "refusing to run as root: the pulsewatch CLI should run as a non-privileged user".to_string(),
                );
            }
        }
        Ok(())
    }

    pub fn check_config_permissions(path: &Path) -> std::result::Result<(), String> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let metadata = std::fs::metadata(path).map_err(|e| format!("cannot read config file: {e}"))?;
            let mode = metadata.permissions().mode();
            let world_writable = (mode & 0o002) != 0;
            let world_readable = (mode & 0o004) != 0;

            if world_writable {
                return Err(format!("config file '{}' is world-writable, refusing to start (chmod 600)", path.display()));
            }
            if world_readable {
                eprintln!("warning: config file '{}' is world-readable, consider chmod 600", path.display());
            }
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(name = "pulsewatch")]
#[command(about = "Scheduled HTTP/SQL availability and health probing service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Set log level")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the worker and its REST/SSE API together
    Serve {
        #[arg(short = 'H', long, help = "API bind address", default_value = "0.0.0.0")]
        host: String,

        #[arg(short = 'P', long, help = "API bind port", default_value = "8080")]
        port: u16,

        #[arg(long, help = "Worker instance name", default_value = "pulsewatch")]
        instance_name: String,

        #[arg(long, help = "Deployment environment tag", default_value = "production")]
        environment: String,
    },

    /// Enqueue an out-of-band probe run against the configured targets, wait
    /// for it to drain, and print the results
    Trigger {
        #[arg(help = "Target name to probe; omit to probe every enabled target")]
        target: Option<String>,

        #[arg(long, help = "Seconds to wait for the triggered jobs to complete", default_value = "15")]
        wait_seconds: u64,
    },

    /// Configuration inspection
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Check that the configured store is reachable
    Health,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Validate the effective configuration without starting anything
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    if let Err(e) = security::check_not_root() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let config = load_config(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Serve { host, port, instance_name, environment } => {
            run_serve(config, host, port, instance_name, environment).await.context("running server")
        }
        Commands::Trigger { target, wait_seconds } => run_trigger(config, target, wait_seconds).await.context("triggering probes"),
        Commands::Config { command } => run_config_command(config, command).context("config command"),
        Commands::Health => run_health(config).await.context("health check"),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    if let Some(path) = path {
        if let Err(e) = security::check_config_permissions(path) {
            eprintln!("{e}");
            std::process::exit(1);
        }
        Ok(Config::load(path)?)
    } else {
        Ok(Config::from_env()?)
    }
}

async fn build_worker(config: Config, instance_name: &str, environment: &str) -> Result<Arc<Worker>> {
    let report = config.validate();
    if !report.is_valid() {
        for err in &report.errors {
            eprintln!("config error: {err}");
        }
        std::process::exit(1);
    }
    for warning in &report.warnings {
        eprintln!("config warning: {warning}");
    }

    let connection_string = if config.store_connection_string.is_empty() { "sqlite::memory:" } else { &config.store_connection_string };
    let store: Arc<dyn Store> = Arc::new(SqlStore::connect(connection_string).await?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

    Ok(Worker::new(instance_name, host, environment, ConfigHandle::new(config), clock, store))
}

async fn run_serve(config: Config, host: String, port: u16, instance_name: String, environment: String) -> Result<()> {
    let worker = build_worker(config, &instance_name, &environment).await?;

    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| pulsewatch_core::Error::Validation(format!("invalid bind address: {e}")))?;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let worker_task = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    info!(%addr, "pulsewatch server starting");
    let api_shutdown = {
        let shutdown = shutdown.clone();
        async move { shutdown.notified().await }
    };
    let ctrl_c = {
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            // Two independent waiters (the worker and the API server) share
            // this token, so every waiter must be woken, not just one.
            shutdown.notify_waiters();
        }
    };
    tokio::spawn(ctrl_c);

    pulsewatch_api::run(worker, addr, api_shutdown).await?;
    let _ = worker_task.await;
    Ok(())
}

async fn run_trigger(config: Config, target: Option<String>, wait_seconds: u64) -> Result<()> {
    let worker = build_worker(config, "pulsewatch-trigger", "cli").await?;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let worker_task = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let ids = match &target {
        Some(name) => worker.trigger_target(name).await?,
        None => worker.trigger_all().await?,
    };
    println!("triggered {} job(s): {:?}", ids.len(), ids);

    tokio::time::sleep(std::time::Duration::from_secs(wait_seconds)).await;

    let results = worker.list_results(Default::default()).await?;
    for result in results.iter().filter(|r| ids.contains(&r.job_id)) {
        println!("{} [{}] {} - {}", result.target_name, result.status.as_str(), result.duration_ms, result.message);
    }

    shutdown.notify_one();
    let _ = worker_task.await;
    Ok(())
}

fn run_config_command(config: Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            println!("{}", toml::to_string_pretty(&config).map_err(|e| pulsewatch_core::Error::Validation(e.to_string()))?);
        }
        ConfigCommands::Validate => {
            let report = config.validate();
            for err in &report.errors {
                println!("error: {err}");
            }
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            if !report.is_valid() {
                std::process::exit(1);
            }
            println!("configuration is valid");
        }
    }
    Ok(())
}

async fn run_health(config: Config) -> Result<()> {
    let connection_string = if config.store_connection_string.is_empty() { "sqlite::memory:" } else { &config.store_connection_string };
    match SqlStore::connect(connection_string).await {
        Ok(_) => {
            println!("store reachable: ok");
            Ok(())
        }
        Err(e) => {
            eprintln!("store unreachable: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_defaults() {
        let cli = Cli::parse_from(["pulsewatch", "serve"]);
        assert!(matches!(cli.command, Commands::Serve { ref host, port, .. } if host == "0.0.0.0" && port == 8080));
    }

    #[test]
    fn parses_trigger_with_target() {
        let cli = Cli::parse_from(["pulsewatch", "trigger", "svc"]);
        match cli.command {
            Commands::Trigger { target, .. } => assert_eq!(target.as_deref(), Some("svc")),
            _ => panic!("expected Trigger"),
        }
    }

    #[test]
    fn parses_config_validate() {
        let cli = Cli::parse_from(["pulsewatch", "config", "validate"]);
        assert!(matches!(cli.command, Commands::Config { command: ConfigCommands::Validate }));
    }
}
