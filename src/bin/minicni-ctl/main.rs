use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use minicni::config::{Installer, NetConf, PluginConfig};
use minicni::ipam::{self, ReservationStore};

/// Manage minicni network configs and address reservations
#[derive(Parser)]
#[command(name = "minicni-ctl", author, version, about)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a network configuration
    Generate {
        /// Network name
        #[arg(long, default_value = "minicni")]
        name: String,

        /// Subnet container addresses are taken from (CIDR notation)
        #[arg(long)]
        subnet: String,

        /// Bridge to attach containers to
        #[arg(long)]
        bridge: Option<String>,

        /// Interface MTU
        #[arg(long)]
        mtu: Option<u32>,

        /// Output file path, stdout when absent
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Create the CNI directories and write a default network configuration
    Install {
        /// Network name
        #[arg(long, default_value = "minicni")]
        name: String,

        /// Subnet container addresses are taken from (CIDR notation)
        #[arg(long)]
        subnet: String,

        /// CNI binary directory
        #[arg(long, default_value = "/opt/cni/bin")]
        bin_dir: PathBuf,

        /// CNI configuration directory
        #[arg(long, default_value = "/etc/cni/net.d")]
        conf_dir: PathBuf,

        /// Directory holding reservation ledgers
        #[arg(long, default_value = "/var/lib/cni/minicni")]
        data_dir: PathBuf,
    },

    /// List the addresses reserved in a network
    Reservations {
        /// Network name
        #[arg(long)]
        network: String,

        /// Directory holding reservation ledgers
        #[arg(long, default_value = "/var/lib/cni/minicni")]
        data_dir: PathBuf,
    },

    /// Release a leaked address
    Release {
        /// Network name
        #[arg(long)]
        network: String,

        /// Address to release
        #[arg(long)]
        address: Ipv4Addr,

        /// Directory holding reservation ledgers
        #[arg(long, default_value = "/var/lib/cni/minicni")]
        data_dir: PathBuf,
    },
}

fn run_generate(
    name: &str,
    subnet: &str,
    bridge: Option<&str>,
    mtu: Option<u32>,
    output: Option<PathBuf>,
) -> Result<()> {
    let conf = NetConf::new_default(name, subnet, bridge, mtu);
    conf.validate()
        .with_context(|| format!("Refusing to generate an invalid config for {name}"))?;

    match output {
        Some(path) => {
            conf.save(&path)?;
            println!("Network configuration written to {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&conf)?),
    }
    Ok(())
}

fn run_install(name: &str, subnet: &str, config: PluginConfig) -> Result<()> {
    let bin_dir = config.cni_bin_dir.clone();
    let path = Installer::new(config).install(name, subnet)?;
    println!("Network configuration written to {}", path.display());
    println!("Copy the minicni binary into {} to complete the installation.", bin_dir.display());
    Ok(())
}

fn ledger(network: &str, data_dir: &Path) -> ReservationStore {
    ReservationStore::new(PluginConfig::ledger_path(data_dir, network))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    match cli.command {
        Commands::Generate {
            name,
            subnet,
            bridge,
            mtu,
            output,
        } => run_generate(&name, &subnet, bridge.as_deref(), mtu, output)?,
        Commands::Install {
            name,
            subnet,
            bin_dir,
            conf_dir,
            data_dir,
        } => {
            let config = PluginConfig {
                cni_bin_dir: bin_dir,
                cni_conf_dir: conf_dir,
                data_dir,
                ..PluginConfig::default()
            };
            run_install(&name, &subnet, config)?;
        }
        Commands::Reservations { network, data_dir } => {
            let store = ledger(&network, &data_dir);
            let reservations = store.snapshot()?;
            if reservations.is_empty() {
                println!("No addresses reserved in {network}");
            }
            for reservation in reservations.iter() {
                println!("{reservation}");
            }
        }
        Commands::Release {
            network,
            address,
            data_dir,
        } => {
            let store = ledger(&network, &data_dir);
            let released = store.transaction(|set| Ok(ipam::release(address, set)))?;
            match released {
                Some(reservation) => {
                    info!("Released {} from {}", reservation, store.path().display());
                    println!("Released {}", reservation.address);
                }
                None => warn!("{} is not reserved in {}", address, network),
            }
        }
    }

    Ok(())
}
