//! Subcommand implementations.

pub mod alerts;
pub mod config;
pub mod health;
pub mod jobs;
pub mod queues;
