//! Relay CLI - operator tool for the Relay job queue and admission limiter.
//!
//! Talks to the admin HTTP API of `relay-server`.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{alerts, config, health, jobs, queues};
use output::OutputFormat;

/// Relay - idempotent jobs and per-key admission for rate-limited upstreams
#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Relay - idempotent background jobs with per-key admission limiting",
    long_about = "CLI tool for inspecting Relay queues, jobs, limiters and alerts.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "RELAY_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Job lookup and enqueue
    #[command(subcommand)]
    Jobs(jobs::JobCommands),

    /// Pending and processing counts per job type
    Queues,

    /// Admission counters per tracked service
    Limiters,

    /// Alert log
    #[command(subcommand)]
    Alerts(alerts::AlertCommands),

    /// Check system health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(config::load_api_url)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Jobs(cmd) => jobs::execute(cmd, &client, format).await,
        Commands::Queues => queues::queues(&client, format).await,
        Commands::Limiters => queues::limiters(&client, format).await,
        Commands::Alerts(cmd) => alerts::execute(cmd, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "relay", "--output", "json", "jobs", "enqueue", "fax", "fax-123", "--payload", "{}",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Jobs(jobs::JobCommands::Enqueue { .. })));
    }

    #[test]
    fn test_payload_and_file_conflict() {
        let result = Cli::try_parse_from([
            "relay", "jobs", "enqueue", "fax", "k", "--payload", "{}", "--file", "p.json",
        ]);
        assert!(result.is_err());
    }
}
