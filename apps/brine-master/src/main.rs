mod acl;
mod autosign;
mod backend;
mod handlers;
mod jid;
mod job_cache;
mod keys;
mod maintenance;
mod memcache;
mod metrics;
mod output;
mod presence;
mod publisher;
mod server;
mod session;
mod syndic;
mod workers;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use brine_config::{log_directive, ConfigError, MasterConfig, StoreKind};
use brine_storage::{Jid, KeyListing, Target, TargetKind};
use brine_transport::{
    AdminReply, AdminRequest, KeyAction, PublishRequest, Request, Response, TransportError,
};
use brine_transport_tcp::ipc_request;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use acl::load_or_create_root_token;
use backend::StoreBackend;
use job_cache::JobCache;
use keys::KeyManager;
use output::format_return;
use server::{bind_transport, ipc_endpoint, MasterServer};
use session::{MasterIdentity, SessionKeyring};

// ────────────────────────────────────── CLI Types ──────────────────────────────────────

#[derive(Parser)]
#[command(name = "brine-master")]
#[command(about = "Brine master daemon and administration commands")]
struct Cli {
    /// Path to the master configuration file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "BRINE_MASTER_CONFIG",
        default_value = "/etc/brine/master"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the master
    Serve,
    /// Minion key management
    Key {
        #[command(subcommand)]
        key_cmd: KeyCommand,
    },
    /// Inspect the job cache
    Job {
        #[command(subcommand)]
        job_cmd: JobCommand,
    },
    /// Publish a job through the running master
    Publish {
        /// Target expression
        target: String,
        /// Function to run, e.g. test.ping
        fun: String,
        /// Arguments, each parsed as YAML
        args: Vec<String>,
        /// How the target expression is interpreted
        #[arg(long, short = 't', default_value = "glob")]
        tgt_type: TargetKind,
        /// Seconds to wait for returns (0 returns immediately)
        #[arg(long, default_value = "0")]
        wait: u64,
    },
}

#[derive(Subcommand)]
enum KeyCommand {
    /// List keys by state
    List,
    /// Accept pending keys matching a pattern
    Accept {
        pattern: String,
        /// Also accept rejected keys
        #[arg(long)]
        include_rejected: bool,
    },
    /// Reject pending keys matching a pattern
    Reject {
        pattern: String,
        /// Also reject accepted keys
        #[arg(long)]
        include_accepted: bool,
    },
    /// Delete keys matching a pattern
    Delete { pattern: String },
    /// Print key fingerprints
    Finger {
        #[arg(default_value = "*")]
        pattern: String,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    /// List cached jobs
    List,
    /// Show a job and its returns
    Show { jid: String },
}

// ────────────────────────────────────── CLI Commands ──────────────────────────────────────

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn load_config(path: &PathBuf) -> Result<MasterConfig, ConfigError> {
    match MasterConfig::load_from(path) {
        Err(ConfigError::NotFound(p)) => {
            warn!(path = %p, "no master config, using defaults");
            MasterConfig::from_yaml_str("")
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

async fn cmd_serve(config: MasterConfig) -> CliResult {
    if let Some(addr) = config.metrics_addr {
        metrics::init_metrics(addr)?;
        info!(%addr, "metrics exporter listening");
    }
    let store = StoreBackend::from_config(&config).await?;
    let identity = MasterIdentity::load(&config).await?;
    info!(fingerprint = %identity.fingerprint(), "master key loaded");
    let token = load_or_create_root_token(&config.root_key_path()).await?;
    let transport = bind_transport(&config).await?;
    let ipc = ipc_endpoint(&config);

    let server = MasterServer::new(config, store, identity, token, vec![transport])?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = server::start(&server, Some(ipc), shutdown_rx).await?;

    shutdown_signal().await?;
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            warn!("task did not stop in time");
        }
    }
    Ok(())
}

/// Send one request to the running master over the local channel.
async fn local_request(config: &MasterConfig, request: &Request) -> Result<Response, TransportError> {
    let timeout = Duration::from_secs(config.timeout.max(1));
    ipc_request(&ipc_endpoint(config), request, timeout).await
}

fn print_listing(listing: &KeyListing) {
    for (title, ids) in [
        ("Accepted Keys:", &listing.accepted),
        ("Denied Keys:", &listing.denied),
        ("Unaccepted Keys:", &listing.pending),
        ("Rejected Keys:", &listing.rejected),
    ] {
        println!("{title}");
        for id in ids {
            println!("{id}");
        }
    }
}

fn print_reply(reply: AdminReply) {
    match reply {
        AdminReply::Keys(listing) => print_listing(&listing),
        AdminReply::Changed { ids } => {
            for id in ids {
                println!("{id}");
            }
        }
        AdminReply::Fingers { fingers } => {
            for (id, finger) in fingers {
                println!("{id}:  {finger}");
            }
        }
    }
}

/// Operate on the key store directly. Only used while the master is down,
/// so the throwaway session keyring has no one to rotate for.
async fn offline_key_admin(config: &MasterConfig, action: KeyAction) -> Result<AdminReply, Box<dyn std::error::Error>> {
    if config.cache == StoreKind::Memory {
        return Err("the key store lives in the master's memory and the master is not running".into());
    }
    let store = StoreBackend::from_config(config).await?;
    let keys = KeyManager::new(store, Arc::new(SessionKeyring::new()), config);
    Ok(match action {
        KeyAction::List => AdminReply::Keys(keys.list_keys().await?),
        KeyAction::Accept {
            pattern,
            include_rejected,
        } => AdminReply::Changed {
            ids: keys.accept(&pattern, include_rejected).await?,
        },
        KeyAction::Reject {
            pattern,
            include_accepted,
        } => AdminReply::Changed {
            ids: keys.reject(&pattern, include_accepted).await?,
        },
        KeyAction::Delete { pattern } => AdminReply::Changed {
            ids: keys.delete(&pattern).await?,
        },
        KeyAction::Finger { pattern } => AdminReply::Fingers {
            fingers: keys.finger(&pattern).await?,
        },
    })
}

async fn cmd_key(config: &MasterConfig, key_cmd: KeyCommand) -> CliResult {
    let action = match key_cmd {
        KeyCommand::List => KeyAction::List,
        KeyCommand::Accept {
            pattern,
            include_rejected,
        } => KeyAction::Accept {
            pattern,
            include_rejected,
        },
        KeyCommand::Reject {
            pattern,
            include_accepted,
        } => KeyAction::Reject {
            pattern,
            include_accepted,
        },
        KeyCommand::Delete { pattern } => KeyAction::Delete { pattern },
        KeyCommand::Finger { pattern } => KeyAction::Finger { pattern },
    };
    let token = load_or_create_root_token(&config.root_key_path()).await?;
    let request = Request::Admin(AdminRequest {
        token,
        action: action.clone(),
    });
    let reply = match local_request(config, &request).await {
        Ok(Response::Admin(reply)) => reply,
        Ok(Response::Error { message }) => return Err(message.into()),
        Ok(other) => return Err(format!("unexpected reply: {other:?}").into()),
        Err(TransportError::ConnectionRefused(_)) => {
            info!("master not running, editing the key store directly");
            offline_key_admin(config, action).await?
        }
        Err(e) => return Err(e.into()),
    };
    print_reply(reply);
    Ok(())
}

async fn job_cache(config: &MasterConfig) -> Result<JobCache, Box<dyn std::error::Error>> {
    if config.cache == StoreKind::Memory {
        return Err("the job cache lives in the master's memory".into());
    }
    let store = StoreBackend::from_config(config).await?;
    Ok(JobCache::new(store, config))
}

async fn cmd_job(config: &MasterConfig, job_cmd: JobCommand) -> CliResult {
    let jobs = job_cache(config).await?;
    match job_cmd {
        JobCommand::List => {
            for job in jobs.list_jobs().await? {
                println!(
                    "{}:\n    Function: {}\n    Target:   {} ({})\n    User:     {}\n    Started:  {}",
                    job.jid,
                    job.fun,
                    job.target.expr,
                    job.target.kind.as_str(),
                    job.user,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        JobCommand::Show { jid } => {
            let jid = Jid(jid);
            let job = jobs.get_job(&jid).await?;
            println!("{}: {} on {}", job.jid, job.fun, job.target.expr);
            let returns = jobs.get_returns(&jid).await?;
            for ret in &returns {
                print!("{}", format_return(ret, config.state_output));
            }
            let answered: Vec<_> = returns.iter().map(|r| &r.minion_id).collect();
            for missing in jobs
                .expected_minions(&jid)
                .await?
                .iter()
                .filter(|m| !answered.contains(m))
            {
                println!("{missing}:\n    Minion did not return. [No response]");
            }
        }
    }
    Ok(())
}

fn parse_arg(raw: &str) -> serde_json::Value {
    serde_yaml::from_str::<serde_json::Value>(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn cmd_publish(
    config: &MasterConfig,
    target: String,
    fun: String,
    args: Vec<String>,
    tgt_type: TargetKind,
    wait: u64,
) -> CliResult {
    let token = load_or_create_root_token(&config.root_key_path()).await?;
    let user = std::env::var("USER").unwrap_or_else(|_| "root".into());
    let request = Request::Publish(PublishRequest {
        target: Target {
            expr: target,
            kind: tgt_type,
        },
        fun,
        args: args.iter().map(String::as_str).map(parse_arg).collect(),
        user,
        token: Some(token),
        jid: None,
        origin: None,
    });
    let reply = match local_request(config, &request).await? {
        Response::Published(reply) => reply,
        Response::Error { message } => return Err(message.into()),
        other => return Err(format!("unexpected reply: {other:?}").into()),
    };
    println!("jid: {}", reply.jid);
    if wait == 0 {
        for minion in &reply.minions {
            println!("  {minion}");
        }
        return Ok(());
    }

    let jobs = job_cache(config).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    let mut returns = Vec::new();
    while tokio::time::Instant::now() < deadline {
        returns = jobs.get_returns(&reply.jid).await?;
        if returns.len() >= reply.minions.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    for ret in &returns {
        print!("{}", format_return(ret, config.state_output));
    }
    for missing in reply
        .minions
        .iter()
        .filter(|m| !returns.iter().any(|r| &r.minion_id == *m))
    {
        println!("{missing}:\n    Minion did not return. [No response]");
    }
    Ok(())
}

// ────────────────────────────────────── Main ──────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config.log_level);

    match cli.command {
        Command::Serve => cmd_serve(config).await?,
        Command::Key { key_cmd } => cmd_key(&config, key_cmd).await?,
        Command::Job { job_cmd } => cmd_job(&config, job_cmd).await?,
        Command::Publish {
            target,
            fun,
            args,
            tgt_type,
            wait,
        } => cmd_publish(&config, target, fun, args, tgt_type, wait).await?,
    }

    Ok(())
}
