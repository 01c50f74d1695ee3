use clap::{Parser, Subcommand};
use color_eyre::eyre;
use testfleet::{Fleet, FleetConfig};
use tracing::info;

/// testfleet: housekeeping for test runs on a Kubernetes cluster
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Namespace the run lives in (overrides TESTFLEET_NAMESPACE).
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Delete every resource labeled with a run, its reaper included.
    Purge {
        /// Run identifier, as found in the `testfleet.io/run` label.
        #[arg(long)]
        run_id: String,
    },

    /// Deploy a timeout reaper for a run managed elsewhere.
    Reaper {
        /// Run identifier (generated when omitted).
        #[arg(long)]
        run_id: Option<String>,
        /// Seconds before the run's resources are deleted.
        #[arg(long)]
        timeout: u64,
    },

    /// Print the effective configuration as JSON.
    Config,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = FleetConfig::from_env()?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }

    match cli.command {
        Cmd::Purge { run_id } => {
            config.run_id = Some(run_id);
            let fleet = Fleet::connect(config).await?;
            fleet.cleanup().await?;
            println!("purged run {}", fleet.run().run_id());
        }
        Cmd::Reaper { run_id, timeout } => {
            if timeout == 0 {
                eyre::bail!("--timeout must be a positive number of seconds");
            }
            if run_id.is_some() {
                config.run_id = run_id;
            }
            config.timeout_secs = timeout;
            let fleet = Fleet::connect(config).await?;
            let reaper = fleet.deploy_timeout_reaper().await?;
            info!(reaper = reaper.generated_name(), "reaper deployed");
            println!(
                "run {} in namespace {} will be reaped in {timeout}s",
                fleet.run().run_id(),
                fleet.run().namespace()
            );
        }
        Cmd::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
