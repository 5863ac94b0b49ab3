mod executor;
mod runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use brine_client::{
    ordered_masters, Authenticator, Backoff, ConnectPolicy, ConnectionManager, Driver, MinionKeys,
};
use brine_config::{log_directive, ConfigError, MasterType, MinionConfig, TransportKind};
use brine_crypto::fingerprint;
use brine_transport::ClientTransport;
use brine_transport_tcp::{TcpClientOptions, TcpClientTransport};
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use runner::MinionRunner;

// ────────────────────────────────────── CLI Types ──────────────────────────────────────

#[derive(Parser)]
#[command(name = "brine-minion")]
#[command(about = "Brine minion daemon")]
struct Cli {
    /// Path to the minion configuration file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "BRINE_MINION_CONFIG",
        default_value = "/etc/brine/minion"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the configured masters and answer jobs (default)
    Run,
    /// Print the grains this minion reports
    Grains,
    /// Print this minion's key fingerprint
    Finger,
}

// ────────────────────────────────────── CLI Commands ──────────────────────────────────────

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn load_config(path: &PathBuf) -> Result<MinionConfig, ConfigError> {
    match MinionConfig::load_from(path) {
        Err(ConfigError::NotFound(p)) => {
            warn!(path = %p, "no minion config, using defaults");
            MinionConfig::from_yaml_str("")
        }
        other => other,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_directive(level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

fn client_transport(config: &MinionConfig) -> Result<Arc<dyn ClientTransport>, String> {
    match config.transport {
        TransportKind::Tcp => Ok(Arc::new(TcpClientTransport::new(TcpClientOptions {
            publish_port: config.publish_port,
            ret_port: config.ret_port,
            source_address: config.source_address,
            source_publish_port: config.source_publish_port,
            source_ret_port: config.source_ret_port,
        }))),
        TransportKind::Memory => {
            Err("the memory transport only reaches masters in the same process".into())
        }
    }
}

/// Master list for each connection the minion keeps. A plain list means
/// one connection per master; failover and distributed share one.
fn connection_plan<R: Rng + ?Sized>(config: &MinionConfig, rng: &mut R) -> Vec<Vec<String>> {
    let masters = config.masters();
    if config.master_type == MasterType::Str && masters.len() > 1 {
        return masters.into_iter().map(|m| vec![m]).collect();
    }
    vec![ordered_masters(
        &masters,
        config.master_type,
        config.random_master,
        config.master_failback,
        config.minion_id(),
        rng,
    )]
}

async fn cmd_run(config: MinionConfig) -> CliResult {
    let transport = client_transport(&config)?;
    let auth = Arc::new(Authenticator::from_config(&config).await?);
    let runner = Arc::new(MinionRunner::from_config(&config).await?);
    info!(
        id = %config.minion_id(),
        grains = runner.grains().as_object().map_or(0, |g| g.len()),
        "minion starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut drivers = JoinSet::new();
    let mut rng = rand::rng();
    for masters in connection_plan(&config, &mut rng) {
        let policy = ConnectPolicy::from_config(&config, &mut rng);
        let backoff = Backoff::from_recon(
            config.recon_default,
            config.recon_max,
            config.recon_randomize,
            &mut rng,
        );
        info!(masters = ?masters, "connecting");
        let manager = ConnectionManager::new(policy, masters, backoff);
        let driver = Driver::new(transport.clone(), auth.clone(), manager, runner.clone());
        drivers.spawn(driver.run(shutdown_rx.clone()));
    }

    tokio::select! {
        r = shutdown_signal() => r?,
        // Every connection gave up on its own.
        failed = async {
            let mut failed = false;
            while let Some(joined) = drivers.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "master connection stopped");
                        failed = true;
                    }
                    Err(e) => {
                        error!(error = %e, "master connection panicked");
                        failed = true;
                    }
                }
            }
            failed
        } => {
            return if failed {
                Err("no master connection left".into())
            } else {
                Ok(())
            };
        }
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), async {
        while drivers.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("connections did not stop in time");
    }
    Ok(())
}

fn cmd_grains(config: &MinionConfig) -> CliResult {
    let grains = runner::minion_grains(config);
    println!("{}", serde_json::to_string_pretty(&grains)?);
    Ok(())
}

async fn cmd_finger(config: &MinionConfig) -> CliResult {
    let keys = MinionKeys::load_or_generate(&config.pki_dir).await?;
    println!(
        "{}",
        fingerprint(&keys.public_key_bytes(), config.hash_type)
    );
    Ok(())
}

// ────────────────────────────────────── Main ──────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config.log_level);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => cmd_run(config).await?,
        Command::Grains => cmd_grains(&config)?,
        Command::Finger => cmd_finger(&config).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn plan(yaml: &str) -> Vec<Vec<String>> {
        let config = MinionConfig::from_yaml_str(yaml).unwrap();
        connection_plan(&config, &mut StdRng::seed_from_u64(7))
    }

    #[test]
    fn a_plain_list_connects_to_every_master() {
        assert_eq!(
            plan("id: web1\nmaster: [m1, m2]\n"),
            vec![vec!["m1".to_string()], vec!["m2".to_string()]]
        );
    }

    #[test]
    fn failover_shares_one_connection() {
        assert_eq!(
            plan("id: web1\nmaster: [m1, m2, m3]\nmaster_type: failover\n"),
            vec![vec!["m1".to_string(), "m2".to_string(), "m3".to_string()]]
        );
        assert_eq!(plan("id: web1\nmaster: salt\n"), vec![vec!["salt".to_string()]]);
    }

    #[test]
    fn memory_transport_is_refused() {
        let config = MinionConfig::from_yaml_str("id: web1\nmaster: salt\ntransport: memory\n")
            .unwrap();
        assert!(client_transport(&config).is_err());
    }
}
