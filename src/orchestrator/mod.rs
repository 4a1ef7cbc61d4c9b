//! The sandboxed verification orchestrator.
//!
//! Drives one issue through the bounded generate/validate/verify loop:
//!
//! ```text
//! REQUESTING_CANDIDATE -> VALIDATING_SHAPE -> VERIFYING
//!         ^                                      |
//!         +--------------- RETRYING <------------+
//!                              |
//!          {ACCEPTED, ESCALATING_INFRA, EXHAUSTED}
//! ```
//!
//! Attempt-local failures never escape as errors; they become [`Attempt`]
//! records driving the next transition. The sandbox handle is acquired once
//! per run and released on every exit path, including cancellation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::error::{OrchestrationError, SandboxError};
use crate::generator::{CandidateSet, FailureEvidence, Generator};
use crate::sandbox::{SandboxConfig, SandboxEnvironment, SandboxHandle};
use crate::tracker::Issue;
use crate::verifier::{Classification, ExecutionOutcome, ExecutionVerifier};

/// One entry in a run's append-only attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number; strictly increasing and contiguous.
    pub ordinal: u32,
    /// The candidate produced by this attempt, absent when generation
    /// itself failed.
    pub candidate: Option<CandidateSet>,
    /// Execution evidence, absent when the candidate never reached the
    /// sandbox (generation failure, incomplete shape).
    pub outcome: Option<ExecutionOutcome>,
    /// Why this attempt ended.
    pub termination: String,
}

/// Terminal value of one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestrationResult {
    /// A candidate passed verification.
    Accepted {
        candidate: CandidateSet,
        outcome: ExecutionOutcome,
        attempts: Vec<Attempt>,
    },
    /// The retry budget ran out on generation/test failures.
    Exhausted {
        attempts: Vec<Attempt>,
        last_error: String,
    },
    /// The retry budget ran out on an infrastructure failure: the sandbox
    /// or runtime is at fault, not the generator.
    EscalatedInfra {
        attempts: Vec<Attempt>,
        last_error: String,
    },
}

impl OrchestrationResult {
    /// The attempt history of the run.
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            Self::Accepted { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::EscalatedInfra { attempts, .. } => attempts,
        }
    }

    /// Short uppercase label of the terminal state.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "ACCEPTED",
            Self::Exhausted { .. } => "EXHAUSTED",
            Self::EscalatedInfra { .. } => "ESCALATING_INFRA",
        }
    }
}

/// Handle used to cancel an in-flight run from outside.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Requests cancellation. The run releases its sandbox before reporting
    /// [`OrchestrationError::Cancelled`].
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving side of a cancellation request.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Resolves once cancellation has been requested.
    async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        // Sender dropped without cancelling: never resolve.
        std::future::pending::<()>().await;
    }
}

/// Creates a connected cancellation pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Internal: what one attempt decided.
enum Disposition {
    Accepted {
        candidate: CandidateSet,
        outcome: ExecutionOutcome,
    },
    Retry(FailureEvidence),
}

/// Orchestrates one issue's generation/verification run end to end.
///
/// All collaborators are injected; nothing here constructs clients
/// implicitly, so concurrent runs share nothing except the environment they
/// were given.
pub struct Orchestrator {
    env: Arc<dyn SandboxEnvironment>,
    generator: Arc<dyn Generator>,
    verifier: ExecutionVerifier,
    sandbox_config: SandboxConfig,
    runner_config: RunnerConfig,
}

impl Orchestrator {
    /// Creates an orchestrator over the given collaborators.
    pub fn new(
        env: Arc<dyn SandboxEnvironment>,
        generator: Arc<dyn Generator>,
        verifier: ExecutionVerifier,
        sandbox_config: SandboxConfig,
        runner_config: RunnerConfig,
    ) -> Self {
        Self {
            env,
            generator,
            verifier,
            sandbox_config,
            runner_config,
        }
    }

    /// Processes one issue to a terminal state without external
    /// cancellation.
    pub async fn process(&self, issue: &Issue) -> Result<OrchestrationResult, OrchestrationError> {
        self.process_with_cancel(issue, CancelSignal::never()).await
    }

    /// Processes one issue to a terminal state.
    ///
    /// The sandbox is acquired before the loop and released on every exit
    /// path: acceptance, exhaustion, cancellation, or deadline expiry.
    /// Cancellation and the deadline race the loop at every suspension
    /// point but never bypass the release.
    pub async fn process_with_cancel(
        &self,
        issue: &Issue,
        mut cancel: CancelSignal,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        let handle = self.env.acquire(&self.sandbox_config).await.map_err(|e| {
            let message = match e {
                SandboxError::Provisioning(m) => m,
                other => other.to_string(),
            };
            OrchestrationError::Provisioning(message)
        })?;

        let body = self.drive(issue, &handle);
        tokio::pin!(body);

        let result = match self.runner_config.deadline {
            Some(deadline) => {
                tokio::select! {
                    r = &mut body => Ok(r),
                    _ = cancel.cancelled() => Err(OrchestrationError::Cancelled),
                    _ = tokio::time::sleep(deadline) => {
                        Err(OrchestrationError::DeadlineExceeded(deadline))
                    }
                }
            }
            None => {
                tokio::select! {
                    r = &mut body => Ok(r),
                    _ = cancel.cancelled() => Err(OrchestrationError::Cancelled),
                }
            }
        };

        if let Err(e) = self.env.release(&handle).await {
            warn!(issue = issue.iid, error = %e, "Sandbox release reported an error");
        }

        if let Ok(ref terminal) = result {
            info!(
                issue = issue.iid,
                terminal = terminal.label(),
                attempts = terminal.attempts().len(),
                "Run finished"
            );
        }

        result
    }

    /// The bounded retry loop. Infallible: every attempt-local failure is
    /// folded into the attempt history.
    async fn drive(&self, issue: &Issue, handle: &SandboxHandle) -> OrchestrationResult {
        let budget = self.runner_config.max_retries.max(1);
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut evidence: Option<FailureEvidence> = None;
        let mut ordinal: u32 = 1;

        loop {
            info!(issue = issue.iid, ordinal, budget, "Requesting candidate");

            let disposition = self
                .attempt(issue, handle, ordinal, evidence.as_ref(), &mut attempts)
                .await;

            match disposition {
                Disposition::Accepted { candidate, outcome } => {
                    return OrchestrationResult::Accepted {
                        candidate,
                        outcome,
                        attempts,
                    };
                }
                Disposition::Retry(next_evidence) => {
                    if ordinal == budget {
                        let last_error = next_evidence.to_string();
                        return match next_evidence {
                            FailureEvidence::Infrastructure { .. } => {
                                OrchestrationResult::EscalatedInfra {
                                    attempts,
                                    last_error,
                                }
                            }
                            _ => OrchestrationResult::Exhausted {
                                attempts,
                                last_error,
                            },
                        };
                    }
                    evidence = Some(next_evidence);
                    ordinal += 1;
                }
            }
        }
    }

    /// One attempt: REQUESTING_CANDIDATE, VALIDATING_SHAPE, VERIFYING.
    async fn attempt(
        &self,
        issue: &Issue,
        handle: &SandboxHandle,
        ordinal: u32,
        evidence: Option<&FailureEvidence>,
        attempts: &mut Vec<Attempt>,
    ) -> Disposition {
        // REQUESTING_CANDIDATE
        let candidate = match self.generator.generate(issue, evidence).await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(issue = issue.iid, ordinal, error = %e, "Generation failed");
                attempts.push(Attempt {
                    ordinal,
                    candidate: None,
                    outcome: None,
                    termination: format!("generator error: {e}"),
                });
                return Disposition::Retry(FailureEvidence::GeneratorFailure {
                    message: e.to_string(),
                });
            }
        };

        // VALIDATING_SHAPE: an incomplete set never reaches the sandbox.
        if !candidate.is_complete() {
            let missing = candidate.missing_members();
            warn!(issue = issue.iid, ordinal, missing = ?missing, "Incomplete candidate");
            attempts.push(Attempt {
                ordinal,
                candidate: Some(candidate),
                outcome: None,
                termination: "incomplete candidate".to_string(),
            });
            return Disposition::Retry(FailureEvidence::IncompleteCandidate { missing });
        }

        // VERIFYING
        let outcome = self.verifier.verify(self.env.as_ref(), handle, &candidate).await;
        let classification = outcome.classification;
        attempts.push(Attempt {
            ordinal,
            candidate: Some(candidate.clone()),
            outcome: Some(outcome.clone()),
            termination: classification.label().to_string(),
        });

        match classification {
            Classification::Pass => Disposition::Accepted { candidate, outcome },
            Classification::Fail => Disposition::Retry(FailureEvidence::ExecutionFailure {
                exit_status: outcome.exit_status,
                stderr: outcome.stderr,
            }),
            Classification::InfrastructureError => {
                Disposition::Retry(FailureEvidence::Infrastructure {
                    message: outcome.stderr,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_pair_fires() {
        let (handle, mut signal) = cancel_pair();
        handle.cancel();
        // Resolves immediately once cancelled.
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let mut signal = CancelSignal::never();
        let fired = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(fired.is_err());
    }

    #[test]
    fn test_result_labels() {
        let exhausted = OrchestrationResult::Exhausted {
            attempts: Vec::new(),
            last_error: "e".to_string(),
        };
        assert_eq!(exhausted.label(), "EXHAUSTED");

        let infra = OrchestrationResult::EscalatedInfra {
            attempts: Vec::new(),
            last_error: "e".to_string(),
        };
        assert_eq!(infra.label(), "ESCALATING_INFRA");
    }
}
