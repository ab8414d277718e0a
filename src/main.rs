use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolpay_agent::config::Config;
use toolpay_agent::server::{self, AppState};
use toolpay_agent::tools::local::LocalTools;
use toolpay_agent::tools::registry::ToolRegistry;
use toolpay_agent::validator::PlanValidator;

/// ToolPay Agent - pay-per-call plan execution over x402
#[derive(Parser, Debug)]
#[command(name = "toolpay-agent", version, about)]
struct Args {
    /// Log filter (e.g. "info", "toolpay_agent=debug")
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Path to the TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a plan file and print the report
    Validate {
        plan: PathBuf,

        /// Config file supplying extra registry entries
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the tool registry with prices
    Tools {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    match args.command {
        Command::Serve { config } => {
            let config = load_config(config.as_ref())?;
            info!(version = env!("CARGO_PKG_VERSION"), "starting toolpay agent");
            let state = AppState::from_config(&config, LocalTools::new())?;
            server::serve(config, state).await?;
        }
        Command::Validate { plan, config } => {
            let config = load_config(config.as_ref())?;
            let registry = ToolRegistry::from_config(&config.tools.registry);
            let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(plan)?)?;
            let report = PlanValidator::new(registry.into()).validate(&raw);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(1);
            }
        }
        Command::Tools { config } => {
            let config = load_config(config.as_ref())?;
            let registry = ToolRegistry::from_config(&config.tools.registry);
            for spec in registry.list() {
                println!(
                    "{:<36} {:>12}  {}",
                    format!("{}.{}", spec.namespace, spec.name),
                    spec.price.to_string(),
                    spec.description
                );
            }
        }
    }

    Ok(())
}
