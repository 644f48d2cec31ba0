//! Alert log commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum AlertCommands {
    /// List recorded alerts, oldest first
    List {
        /// Only the most recent N alerts
        #[arg(short, long)]
        limit: Option<usize>,

        /// Filter by severity (info, warning, critical)
        #[arg(short, long)]
        severity: Option<String>,
    },

    /// Clear the alert log
    Clear,
}

#[derive(Debug, Deserialize, Serialize)]
struct Alert {
    name: String,
    severity: String,
    message: String,
    current_value: f64,
    threshold: f64,
    timestamp: String,
}

#[derive(Debug, Serialize, Tabled)]
struct AlertRow {
    #[tabled(rename = "Time")]
    timestamp: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Alert")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct Cleared {
    cleared: usize,
}

fn list_path(limit: Option<usize>, severity: Option<&str>) -> String {
    let mut params = Vec::new();
    if let Some(limit) = limit {
        params.push(format!("limit={}", limit));
    }
    if let Some(severity) = severity {
        params.push(format!("severity={}", severity.to_lowercase()));
    }
    if params.is_empty() {
        "/api/v1/alerts".to_string()
    } else {
        format!("/api/v1/alerts?{}", params.join("&"))
    }
}

pub async fn execute(cmd: AlertCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        AlertCommands::List { limit, severity } => {
            let alerts: Vec<Alert> = client.get(&list_path(limit, severity.as_deref())).await?;

            if format != OutputFormat::Table {
                return output::print_item(&alerts, format);
            }

            let rows: Vec<AlertRow> = alerts
                .into_iter()
                .map(|a| AlertRow {
                    severity: output::colorize_status(&a.severity).to_string(),
                    value: format!("{:.2} (> {:.2})", a.current_value, a.threshold),
                    timestamp: a.timestamp,
                    name: a.name,
                    message: a.message,
                })
                .collect();
            output::print_list(&rows, format)?;
        }

        AlertCommands::Clear => {
            let resp: Cleared = client.delete("/api/v1/alerts").await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Cleared {} alert(s)", resp.cleared))
                }
                _ => output::print_item(&resp, format)?,
            }
        }
    }

    Ok(())
}
