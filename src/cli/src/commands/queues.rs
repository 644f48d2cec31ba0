//! Queue depth and limiter views.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Deserialize, Serialize)]
struct QueueDepths {
    pending: BTreeMap<String, u64>,
    processing: u64,
}

#[derive(Debug, Serialize, Tabled)]
struct QueueRow {
    #[tabled(rename = "Job Type")]
    job_type: String,
    #[tabled(rename = "Pending")]
    pending: u64,
}

#[derive(Debug, Deserialize, Serialize)]
struct LimiterSummary {
    service: String,
    requests: u32,
    window_ms: u64,
    allowed: u64,
    queued: u64,
    rejected: u64,
    queued_ratio: f64,
    tracked_keys: usize,
}

#[derive(Debug, Serialize, Tabled)]
struct LimiterRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Limit")]
    limit: String,
    #[tabled(rename = "Allowed")]
    allowed: u64,
    #[tabled(rename = "Queued")]
    queued: u64,
    #[tabled(rename = "Queued %")]
    queued_ratio: String,
    #[tabled(rename = "Keys")]
    tracked_keys: usize,
}

pub async fn queues(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let depths: QueueDepths = client.get("/api/v1/queues").await?;

    if format != OutputFormat::Table {
        return output::print_item(&depths, format);
    }

    let rows: Vec<QueueRow> = depths
        .pending
        .iter()
        .map(|(job_type, pending)| QueueRow {
            job_type: job_type.clone(),
            pending: *pending,
        })
        .collect();
    output::print_list(&rows, format)?;
    output::print_detail("Processing", &depths.processing.to_string());
    Ok(())
}

pub async fn limiters(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let limiters: Vec<LimiterSummary> = client.get("/api/v1/limiters").await?;

    if format != OutputFormat::Table {
        return output::print_item(&limiters, format);
    }

    let rows: Vec<LimiterRow> = limiters
        .into_iter()
        .map(|l| LimiterRow {
            limit: format!("{} / {}ms", l.requests, l.window_ms),
            allowed: l.allowed,
            queued: l.queued,
            queued_ratio: output::percent(l.queued_ratio),
            tracked_keys: l.tracked_keys,
            service: l.service,
        })
        .collect();
    output::print_list(&rows, format)
}
