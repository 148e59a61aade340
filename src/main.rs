use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use log::info;

use stagehand::config::Config;
use stagehand::runners::JobPool;
use stagehand::store::{MemoryStore, Store};
use stagehand::tasks::TaskPool;

#[derive(Parser)]
#[command(name = "stagehand", version, about = "Playbook automation controller and runner")]
struct Cli {
    /// Path to the JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller-side task pool
    Server,
    /// Run the runner-side job pool
    Runner,
}

fn setup_logging() {
    env_logger::Builder::from_default_env().init();
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stagehand").join("config.json"))
}

fn load_config(cli: &Cli) -> Result<Config> {
    if let Some(path) = &cli.config {
        return Config::load(path)
            .wrap_err_with(|| format!("loading config from {}", path.display()));
    }

    if let Some(path) = default_config_path() {
        if path.exists() {
            return Config::load(&path)
                .wrap_err_with(|| format!("loading config from {}", path.display()));
        }
    }

    Ok(Config::default())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = Arc::new(load_config(&cli)?);

    match cli.command {
        Command::Server => {
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let pool = TaskPool::new(store, config);
            info!("task pool started");
            pool.run().await;
        }
        Command::Runner => {
            let pool = JobPool::new(config).wrap_err("creating job pool")?;
            info!("job pool started");
            pool.run().await.wrap_err("job pool exited")?;
        }
    }

    Ok(())
}
