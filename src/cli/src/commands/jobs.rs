//! Job commands: look up a job, or enqueue one idempotently.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Show a job by id
    Show {
        /// Job ID
        job_id: Uuid,
    },

    /// Enqueue a job; repeating the same key returns the existing job
    Enqueue {
        /// Job type, e.g. `fax`
        job_type: String,

        /// Idempotency key
        key: String,

        /// Inline JSON payload
        #[arg(short, long, conflicts_with = "file")]
        payload: Option<String>,

        /// Read the JSON payload from a file
        #[arg(short, long)]
        file: Option<String>,

        /// Override the server's default attempt limit
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EnqueueRequest {
    job_type: String,
    idempotency_key: String,
    payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EnqueueOutcome {
    job_id: Uuid,
    created: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobInfo {
    id: Uuid,
    job_type: String,
    idempotency_key: String,
    status: String,
    attempts: u32,
    max_attempts: u32,
    progress: u8,
    created_at: String,
    updated_at: String,
    run_at: String,
    #[serde(default)]
    lease_owner: Option<String>,
    #[serde(default)]
    lease_expires_at: Option<String>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

fn read_payload(payload: Option<String>, file: Option<String>) -> Result<serde_json::Value> {
    let raw = match (payload, file) {
        (Some(inline), _) => inline,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read payload file: {}", path))?,
        (None, None) => return Ok(serde_json::json!({})),
    };
    serde_json::from_str(&raw).context("Payload is not valid JSON")
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Show { job_id } => {
            let job: JobInfo = client.get(&format!("/api/v1/jobs/{}", job_id)).await?;

            if format != OutputFormat::Table {
                return output::print_item(&job, format);
            }

            output::print_header(&format!("Job: {}", job.id));
            output::print_detail("Type", &job.job_type);
            output::print_detail("Key", &job.idempotency_key);
            output::print_detail("Status", &output::colorize_status(&job.status).to_string());
            output::print_detail("Attempts", &format!("{}/{}", job.attempts, job.max_attempts));
            output::print_detail("Progress", &format!("{}%", job.progress));
            output::print_detail("Created", &job.created_at);
            output::print_detail("Next Run", &job.run_at);
            if let Some(owner) = &job.lease_owner {
                let expires = job.lease_expires_at.as_deref().unwrap_or("?");
                output::print_detail("Lease", &format!("{} until {}", owner, expires));
            }
            if let Some(error) = &job.last_error {
                output::print_detail("Last Error", error);
            }
            if let Some(finished) = &job.finished_at {
                output::print_detail("Finished", finished);
            }
        }

        JobCommands::Enqueue {
            job_type,
            key,
            payload,
            file,
            max_attempts,
        } => {
            let body = EnqueueRequest {
                job_type,
                idempotency_key: key,
                payload: read_payload(payload, file)?,
                max_attempts,
            };

            let outcome: EnqueueOutcome = client.post("/api/v1/jobs", &body).await?;

            match format {
                OutputFormat::Table => {
                    if outcome.created {
                        output::print_success("Job enqueued");
                    } else {
                        output::print_info("A job with this key is already in flight");
                    }
                    output::print_detail("Job ID", &outcome.job_id.to_string());
                }
                _ => output::print_item(&outcome, format)?,
            }
        }
    }

    Ok(())
}
