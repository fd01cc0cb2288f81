//! kubejoin CLI - initialize a control plane and join nodes to it.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kubejoin_core::{
    BootstrapParams, BootstrapToken, DiscoveryConfig, OutOfBandDiscovery, ParamsError, Role,
};
use kubejoin_node::{JoinConfig, JoinMachine, RetryConfig};
use kubejoin_pki::assets::CA_NAME;
use kubejoin_pki::{generate_pki, PkiConfig, PkiLayout};

/// Parameters file written next to the generated assets.
const PARAMS_FILE: &str = "kubelet-bootstrap.json";

/// kubejoin - bootstrap a secure cluster
#[derive(Parser)]
#[command(name = "kubejoin")]
#[command(about = "Bootstrap trust between a control plane and joining nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the control-plane PKI and print a join command
    Init {
        /// Directory for kubeconfig files; assets go under <dir>/pki
        #[arg(long, default_value = "/etc/kubernetes")]
        prefix_dir: PathBuf,

        /// Address the API server listens on
        #[arg(long)]
        listen_ip: Option<IpAddr>,

        /// DNS name for the API server, added to its certificate
        #[arg(long)]
        api_dns_name: Option<String>,

        /// Name of this host (defaults to $HOSTNAME)
        #[arg(long)]
        node_name: Option<String>,

        /// Cluster name used in client configurations
        #[arg(long, default_value = "kubernetes")]
        cluster_name: String,
    },

    /// Join this node to an existing control plane
    Join {
        /// Bootstrap token (<id>.<secret>)
        #[arg(long)]
        token: Option<String>,

        /// Comma separated API server URLs
        #[arg(long)]
        api_server_urls: Option<String>,

        /// Cluster CA certificate (PEM)
        #[arg(long)]
        ca_cert_file: Option<PathBuf>,

        /// Read token and discovery from a parameters file instead
        #[arg(long, conflicts_with_all = ["token", "api_server_urls", "ca_cert_file"])]
        params: Option<PathBuf>,

        /// Name of this node (defaults to $HOSTNAME)
        #[arg(long)]
        node_name: Option<String>,

        /// Where to write the issued identity
        #[arg(long, default_value = "/etc/kubernetes/kubelet.conf")]
        kubeconfig: PathBuf,

        /// Seconds to wait for the signing request to be decided
        #[arg(long, default_value_t = 3600)]
        watch_timeout_secs: u64,

        /// Bootstrap attempts before giving up on transient failures
        #[arg(long, default_value_t = 3)]
        attempts: u32,

        /// Try the next endpoint after a transient failure
        #[arg(long)]
        failover: bool,
    },

    /// Bootstrap token utilities
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Print a fresh bootstrap token
    Generate,

    /// Check that a token is well formed
    Validate {
        /// Token to check
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kubejoin=info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            prefix_dir,
            listen_ip,
            api_dns_name,
            node_name,
            cluster_name,
        } => {
            let mut config = PkiConfig {
                prefix_dir,
                cluster_name,
                listen_ip,
                api_server_dns_name: api_dns_name,
                ..Default::default()
            };
            if let Some(name) = node_name {
                config.node_name = name;
            }
            init(config).await?;
        }
        Commands::Join {
            token,
            api_server_urls,
            ca_cert_file,
            params,
            node_name,
            kubeconfig,
            watch_timeout_secs,
            attempts,
            failover,
        } => {
            let (token, discovery) = match params {
                Some(path) => {
                    let params = BootstrapParams::load(&path)?;
                    (params.token, Some(params.discovery))
                }
                None => {
                    let discovery = match (api_server_urls, ca_cert_file) {
                        (Some(urls), Some(ca)) => Some(DiscoveryConfig::OutOfBand(
                            OutOfBandDiscovery::new(urls, ca),
                        )),
                        _ => None,
                    };
                    if let (Some(discovery), Some(dir)) = (&discovery, kubeconfig.parent()) {
                        let params =
                            BootstrapParams::new(Role::Node, discovery.clone(), token.clone());
                        write_params(&dir.join(PARAMS_FILE), &params)?;
                    }
                    (token, discovery)
                }
            };

            let mut config = JoinConfig {
                watch_timeout: Duration::from_secs(watch_timeout_secs),
                retry: RetryConfig {
                    max_attempts: attempts,
                    ..Default::default()
                },
                endpoint_failover: failover,
                kubeconfig_path: Some(kubeconfig),
                ..Default::default()
            };
            if let Some(name) = node_name {
                config.node_name = name;
            }
            join(config, token, discovery).await?;
        }
        Commands::Token { command } => match command {
            TokenCommands::Generate => {
                println!("{}", BootstrapToken::generate()?);
            }
            TokenCommands::Validate { token } => {
                let token = BootstrapToken::validate(&token)?;
                println!("valid token, id {}", token.id());
            }
        },
    }

    Ok(())
}

async fn init(config: PkiConfig) -> Result<(), Box<dyn std::error::Error>> {
    let assets = generate_pki(&config).await?;

    let ca_cert_path = PkiLayout::new(config.pki_dir()).cert_path(CA_NAME);
    let discovery = OutOfBandDiscovery {
        api_server_urls: config.api_server_url(),
        ca_cert_path: ca_cert_path.clone(),
        api_server_dns_name: config.api_server_dns_name.clone(),
        listen_ip: config.listen_ip,
    };
    let token = master_token(
        &config.prefix_dir.join(PARAMS_FILE),
        DiscoveryConfig::OutOfBand(discovery),
    )?;

    println!("Control-plane PKI written to {}", config.pki_dir().display());
    println!("  admin kubeconfig:   {}", assets.admin_kubeconfig.display());
    println!("  kubelet kubeconfig: {}", assets.kubelet_kubeconfig.display());
    println!();
    println!("Your token is: {}", token);
    println!();
    println!("Copy {} to each node, then run:", ca_cert_path.display());
    println!(
        "  kubejoin join --token {} --api-server-urls {} --ca-cert-file <path-to-ca-cert>",
        token,
        config.api_server_url()
    );

    Ok(())
}

async fn join(
    config: JoinConfig,
    token: Option<String>,
    discovery: Option<DiscoveryConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    let cancel = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling join");
            cancel.cancel();
        }
    });

    let kubeconfig = config.kubeconfig_path.clone();
    let mut machine = JoinMachine::new(config, token, discovery);
    let identity = machine.run(&shutdown).await?;

    println!("Node joined cluster {} as {}", identity.cluster_name(), identity.user_name());
    if let Some(path) = kubeconfig {
        println!("Kubeconfig written to {}", path.display());
    }
    Ok(())
}

/// Token recorded in the control plane's parameters file.
///
/// A re-run keeps the saved parameters and hands out their token again.
fn master_token(
    path: &Path,
    discovery: DiscoveryConfig,
) -> Result<BootstrapToken, Box<dyn std::error::Error>> {
    if path.exists() {
        let saved = BootstrapParams::load(path)?;
        let raw = saved
            .token
            .ok_or_else(|| format!("{} has no bootstrap token", path.display()))?;
        let token = BootstrapToken::validate(&raw)?;
        warn!(path = %path.display(), "Bootstrap parameters already exist, reusing their token");
        return Ok(token);
    }

    let token = BootstrapToken::generate()?;
    let params = BootstrapParams::new(Role::Master, discovery, Some(token.combined_form()));
    params.write_if_not_exists(path)?;
    info!(path = %path.display(), "Wrote bootstrap parameters");
    Ok(token)
}

/// Keep an existing parameters file; a re-run must not replace it.
fn write_params(path: &Path, params: &BootstrapParams) -> Result<(), ParamsError> {
    match params.write_if_not_exists(path) {
        Ok(()) => {
            info!(path = %path.display(), "Wrote bootstrap parameters");
            Ok(())
        }
        Err(ParamsError::AlreadyExists(path)) => {
            warn!(path = %path.display(), "Bootstrap parameters already exist, leaving them");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
