// File: console/vm_console/src/main.rs
mod api_client;
mod config;
mod error;
mod power_console;

use std::path::PathBuf;
use clap::{Parser, ValueEnum};
use colored::Colorize;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use api_client::CloudApiClient;
use config::{Config, DEFAULT_CONFIG_PATH};
use error::{ConsoleError, Result};
use power_console::{render_snapshot, PowerConsole};
use power_tracker::PowerAction;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ActionArg {
    PowerOn,
    PowerOff,
    Suspend,
    Reset,
    Reboot,
    Shutdown,
}

impl From<ActionArg> for PowerAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::PowerOn => PowerAction::PowerOn,
            ActionArg::PowerOff => PowerAction::PowerOff,
            ActionArg::Suspend => PowerAction::Suspend,
            ActionArg::Reset => PowerAction::Reset,
            ActionArg::Reboot => PowerAction::Reboot,
            ActionArg::Shutdown => PowerAction::Shutdown,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "vm_console", version, about = "Issue VM power operations and follow them to completion")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "VM_CONSOLE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Power action to apply
    #[arg(value_enum)]
    action: ActionArg,

    /// Target VM identifiers
    #[arg(required = true)]
    vm_ids: Vec<String>,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config = Config::load(&cli.config)?;
    config.apply_env_overrides();
    config.validate()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    ).init();

    let client = CloudApiClient::new(config.api.clone());
    match client.health_check().await {
        Ok(true) => info!("API at {} is healthy", config.api.api_url),
        Ok(false) => warn!("API at {} reported unhealthy", config.api.api_url),
        Err(e) => warn!("API health check failed: {}", e),
    }

    let console = PowerConsole::new(client, config.tracker.clone())?;
    let action = PowerAction::from(cli.action);

    let accepted = console.apply_all(&cli.vm_ids, action).await;
    if accepted == 0 {
        console.shutdown();
        return Err(ConsoleError::Unknown(format!("no {} request was accepted", action)));
    }

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let report = console.watch_until_idle(&shutdown, |snapshots| {
        for snapshot in snapshots {
            println!("{}", render_snapshot(snapshot));
        }
    }).await;
    console.shutdown();

    println!(
        "{} completed, {} failed, {} untracked{}",
        report.completed.to_string().green(),
        report.failed.to_string().red(),
        report.poll_failures.to_string().yellow(),
        if report.interrupted { " (interrupted)" } else { "" },
    );

    Ok(report.is_success())
}
