//! Error types for regress-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Sandbox environment lifecycle and command transport
//! - LLM API interactions
//! - Candidate generation
//! - Issue tracker interactions and result delivery
//! - Run-terminal orchestration failures

use thiserror::Error;

/// Errors that can occur in the sandbox environment.
///
/// The variants draw a hard line between "the context could not be started"
/// (fatal to a run, no retry budget consumed) and "a command could not be
/// dispatched to a live context" (classified as an infrastructure failure by
/// the verifier, consuming retry budget). A non-zero exit status from the
/// guest command is neither: it is valid output to classify.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox provisioning failed: {0}")]
    Provisioning(String),

    #[error("Sandbox transport failure: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: REGRESS_FORGE_LLM_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

/// Errors that can occur during candidate generation.
///
/// These never escape the retry controller: each one is recorded as a
/// FAIL-classified attempt and fed forward as corrective evidence.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Malformed generator response: {0}")]
    MalformedResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur talking to the issue tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Missing tracker token: REGRESS_FORGE_GITLAB_TOKEN environment variable not set")]
    MissingToken,

    #[error("Missing tracker project: REGRESS_FORGE_GITLAB_PROJECT environment variable not set")]
    MissingProject,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Tracker API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Issue {iid} not found")]
    IssueNotFound { iid: u64 },

    #[error("Failed to parse tracker response: {0}")]
    ParseError(String),
}

/// Delivery-stage failure, distinct from generation and verification
/// failures. Delivery never re-enters the generation loop.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Tracker delivery failed: {0}")]
    Tracker(#[from] TrackerError),
}

/// Run-terminal errors surfaced by the orchestrator.
///
/// Attempt-local failures (FAIL, INFRASTRUCTURE_ERROR) are recovered by the
/// retry state machine and become data in the attempt history; only these
/// conditions escape to the caller.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Sandbox provisioning failed: {0}")]
    Provisioning(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run exceeded wall-clock deadline of {0:?}")]
    DeadlineExceeded(std::time::Duration),
}
