// casket-common/src/pipeline.rs
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CasketError;

/// Progress notifications broadcast by the engine while transactions run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        total_jobs: usize,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
    },
    TransactionStarted {
        token: String,
        version: String,
    },
    AlreadyInstalled {
        token: String,
        version: String,
    },
    DownloadStarted {
        token: String,
        url: String,
    },
    DownloadRetry {
        token: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    DownloadFinished {
        token: String,
        path: PathBuf,
        size_bytes: u64,
        cached: bool,
    },
    /// `digest` is `None` when the artifact was accepted unverified.
    Verified {
        token: String,
        digest: Option<String>,
    },
    Staged {
        token: String,
        path: PathBuf,
    },
    StepStarted {
        token: String,
        step_index: usize,
        step_kind: String,
    },
    StepFinished {
        token: String,
        step_index: usize,
        step_kind: String,
    },
    RollbackStarted {
        token: String,
        failed_step: usize,
    },
    TransactionSucceeded {
        token: String,
        version: String,
    },
    TransactionFailed {
        token: String,
        error: String,
    },
    UninstallStarted {
        token: String,
        version: String,
    },
    UninstallFinished {
        token: String,
        version: String,
    },
    LogWarn {
        message: String,
    },
}

impl PipelineEvent {
    pub fn transaction_failed(token: &str, error: &CasketError) -> Self {
        PipelineEvent::TransactionFailed {
            token: token.to_string(),
            error: error.to_string(),
        }
    }
}
