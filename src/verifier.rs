//! Execution verification of candidate artifacts.
//!
//! Runs a candidate's test script inside a sandbox, captures the raw
//! streams and exit status, and classifies the run. Classification is the
//! whole job: retry decisions belong to the orchestrator.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RuntimeProfile;
use crate::error::SandboxError;
use crate::generator::CandidateSet;
use crate::sandbox::{SandboxEnvironment, SandboxHandle};

/// Verdict over one execution of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// Success exit code and no error markers: a usable regression test.
    Pass,
    /// The script is at fault: compile/load error or runtime exception.
    Fail,
    /// The sandbox is at fault: the command could not be dispatched or its
    /// result could not be captured. Not a test-correctness signal.
    InfrastructureError,
}

impl Classification {
    /// Short uppercase label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::InfrastructureError => "INFRASTRUCTURE_ERROR",
        }
    }
}

/// Immutable record of one candidate execution against one sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Guest exit status (-1 when no status could be captured).
    pub exit_status: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, preserved verbatim for generator feedback.
    pub stderr: String,
    /// The verdict.
    pub classification: Classification,
    /// Wall-clock duration of the verification step.
    pub duration_ms: u64,
}

/// Runs candidates inside a sandbox and classifies the result.
pub struct ExecutionVerifier {
    profile: RuntimeProfile,
}

impl ExecutionVerifier {
    /// Creates a verifier for the given runtime profile.
    pub fn new(profile: RuntimeProfile) -> Self {
        Self { profile }
    }

    /// The runtime profile this verifier classifies against.
    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    /// Verifies one candidate: stage its files into the sandbox's artifact
    /// directory, execute the script, classify the outcome.
    ///
    /// Never fails: sandbox trouble becomes an
    /// [`Classification::InfrastructureError`] outcome so the retry
    /// controller can apply its own policy.
    pub async fn verify(
        &self,
        env: &dyn SandboxEnvironment,
        handle: &SandboxHandle,
        candidate: &CandidateSet,
    ) -> ExecutionOutcome {
        let started = Instant::now();

        // Stage the artifacts. Clearing first keeps ordinal N+1 from ever
        // executing ordinal N's script.
        if let Err(e) = self.stage_candidate(handle, candidate).await {
            return infrastructure_outcome(
                format!("Failed to stage candidate artifacts: {e}"),
                started,
            );
        }

        let command = self.profile.exec_command(&candidate.script.name);
        debug!(handle = %handle.id, command = ?command, "Executing candidate");

        let outcome = match env.run(handle, &command).await {
            Err(e) => infrastructure_outcome(e.to_string(), started),
            Ok(raw) => {
                let classification = if raw.exit_status == self.profile.success_exit_code
                    && !self.profile.has_error_marker(&raw.stderr)
                {
                    Classification::Pass
                } else {
                    Classification::Fail
                };
                ExecutionOutcome {
                    exit_status: raw.exit_status,
                    stdout: raw.stdout,
                    stderr: raw.stderr,
                    classification,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        };

        info!(
            handle = %handle.id,
            script = %candidate.script.name,
            classification = outcome.classification.label(),
            exit_status = outcome.exit_status,
            duration_ms = outcome.duration_ms,
            "Verification finished"
        );

        outcome
    }

    /// Clears the artifact directory and writes both candidate files into it.
    async fn stage_candidate(
        &self,
        handle: &SandboxHandle,
        candidate: &CandidateSet,
    ) -> Result<(), SandboxError> {
        let mut entries = tokio::fs::read_dir(&handle.artifact_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }

        for file in [&candidate.explanation, &candidate.script] {
            let path = handle.artifact_dir.join(&file.name);
            tokio::fs::write(&path, &file.content).await?;
        }
        Ok(())
    }
}

fn infrastructure_outcome(message: String, started: Instant) -> ExecutionOutcome {
    ExecutionOutcome {
        exit_status: -1,
        stdout: String::new(),
        stderr: message,
        classification: Classification::InfrastructureError,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}
