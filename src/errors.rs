//! Typed error hierarchy for the analysis service.
//!
//! One enum per subsystem boundary:
//! - `CloneError` / `ExtractError` for repository acquisition and extraction
//! - `AgentError` for a single analysis worker
//! - `DecisionError` for the decision service transport (never escapes it)
//! - `DeliveryError` for subscriber delivery (never escapes the registry)
//! - `PipelineError` for anything that sends a run to `failed`
//! - `AdmissionError` for rejecting a run before it starts
//! - `ConfigError` for configuration that cannot be used

use std::path::PathBuf;

use thiserror::Error;

use crate::models::ProjectStatus;

/// Errors from cloning a repository.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("Invalid repository URL '{0}'")]
    InvalidUrl(String),

    #[error("Failed to clone {url}: {source}")]
    Git {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("Clone of {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("Failed to create checkout directory: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("Clone task aborted: {0}")]
    Task(String),
}

/// Errors from extracting a code snapshot out of a checkout.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Checkout root {0} does not exist or is not a directory")]
    RootMissing(PathBuf),

    #[error("Extraction task aborted: {0}")]
    Task(String),
}

/// Errors from a single analysis worker.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent {agent} timed out after {secs}s")]
    Timeout { agent: String, secs: u64 },

    #[error("Agent {agent} panicked: {message}")]
    Panicked { agent: String, message: String },

    #[error("Agent {agent} failed: {message}")]
    Failed { agent: String, message: String },
}

/// Errors from the decision service transport.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Decision request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Decision service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Decision request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Could not parse decision response: {0}")]
    Parse(String),
}

/// Errors delivering a message to one subscriber.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Subscriber connection closed")]
    Closed,

    #[error("Delivery timed out")]
    Timeout,
}

/// Errors that send a pipeline run to `failed`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: ProjectStatus,
        to: ProjectStatus,
    },

    #[error("Project {id} disappeared during the run")]
    ProjectVanished { id: i64 },

    #[error("Storage error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Pipeline task panicked: {0}")]
    Panicked(String),

    #[error("Run interrupted by shutdown")]
    Interrupted,
}

/// Reasons a run cannot be admitted.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Project {project_id} already has an active run ({run_id})")]
    AlreadyRunning { project_id: i64, run_id: String },

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Configuration problems found after loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}
