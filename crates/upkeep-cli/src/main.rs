use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use upkeep::config::{Config, DEFAULT_CONFIG_FILE};
use upkeep::daemon;
use upkeep::journal;
use upkeep::types::{Reporter, StderrReporter};
use upkeep_store::FileStore;

#[derive(Parser, Debug)]
#[command(name = "upkeepd", version)]
#[command(about = "Resumable, journaled OTA update client for embedded Linux")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the update server URL from the config file.
    #[arg(long)]
    server_url: Option<String>,

    /// Override the data directory from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the update-module directory from the config file.
    #[arg(long)]
    module_dir: Option<PathBuf>,

    /// Override the deployment poll interval (e.g. 30m, 90s).
    #[arg(long)]
    update_poll_interval: Option<String>,

    /// Override the inventory poll interval (e.g. 8h).
    #[arg(long)]
    inventory_poll_interval: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the update client event loop until terminated.
    Daemon,
    /// Run one poll/update cycle and exit.
    CheckUpdate,
    /// Collect and submit inventory once and exit.
    SendInventory,
    /// Print the currently installed artifact name.
    ShowArtifact,
    /// Print the full provides map as JSON.
    ShowProvides,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(&cli.config)?;
    if let Some(server_url) = &cli.server_url {
        config.server_url = server_url.clone();
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(module_dir) = &cli.module_dir {
        config.module_dir = module_dir.clone();
    }
    if let Some(interval) = &cli.update_poll_interval {
        config.update_poll_interval = parse_interval(interval, "--update-poll-interval")?;
    }
    if let Some(interval) = &cli.inventory_poll_interval {
        config.inventory_poll_interval = parse_interval(interval, "--inventory-poll-interval")?;
    }
    config.validate()?;
    Ok(config)
}

fn parse_interval(value: &str, flag: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {flag}: {value}"))
}

fn show_artifact(config: &Config) -> Result<()> {
    let store = FileStore::open(&config.store_dir())?;
    match journal::installed_artifact_name(&store)? {
        Some(name) => println!("{name}"),
        None => println!("unknown"),
    }
    Ok(())
}

fn show_provides(config: &Config) -> Result<()> {
    let store = FileStore::open(&config.store_dir())?;
    let provides = journal::read_provides(&store)?;
    println!("{}", serde_json::to_string_pretty(&provides)?);
    Ok(())
}

fn run(cli: &Cli, reporter: &mut dyn Reporter) -> Result<i32> {
    let config = load_config(cli)?;
    match cli.cmd {
        Commands::Daemon => daemon::run(&config, reporter),
        Commands::CheckUpdate => daemon::check_update(&config, reporter),
        Commands::SendInventory => daemon::send_inventory(&config, reporter),
        Commands::ShowArtifact => show_artifact(&config).map(|()| 0),
        Commands::ShowProvides => show_provides(&config).map(|()| 0),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut reporter = StderrReporter;
    match run(&cli, &mut reporter) {
        Ok(code) => ExitCode::from(code.clamp(0, u8::MAX as i32) as u8),
        Err(e) => {
            eprintln!("error: {e:#}");
            // Startup and configuration failures exit 1.
            ExitCode::from(1)
        }
    }
}
