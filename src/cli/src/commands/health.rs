//! Health check command.
//!
//! Queries the `/health` endpoint and displays store check results.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include per-component checks
    #[arg(short, long)]
    detailed: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: serde_json::Value = client.get_raw("/health").await?;

    if format != OutputFormat::Table {
        return output::print_item(&health, format);
    }

    let status = health
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    output::print_header("Relay Health");
    output::print_detail("Status", &output::colorize_status(status).to_string());
    output::print_detail("API URL", client.base_url());

    if let Some(version) = health.get("version").and_then(|v| v.as_str()) {
        output::print_detail("Version", version);
    }
    if let Some(ts) = health.get("timestamp").and_then(|v| v.as_str()) {
        output::print_detail("Timestamp", ts);
    }

    if args.detailed {
        if let Some(components) = health.get("components").and_then(|v| v.as_array()) {
            output::print_header("Components");
            for comp in components {
                let name = comp.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                let comp_status = comp.get("status").and_then(|v| v.as_str()).unwrap_or("?");
                let mut line = output::colorize_status(comp_status).to_string();
                if let Some(backend) = comp.get("backend").and_then(|v| v.as_str()) {
                    line.push_str(&format!(" ({})", backend));
                }
                if let Some(error) = comp.get("error").and_then(|v| v.as_str()) {
                    line.push_str(&format!(" - {}", error));
                }
                output::print_detail(name, &line);
            }
        }
    }

    match status {
        "healthy" => output::print_success("All systems operational"),
        "degraded" => output::print_warning("Limiter store unreachable; admission is failing open"),
        other => output::print_error(&format!("System status: {}", other)),
    }

    Ok(())
}
