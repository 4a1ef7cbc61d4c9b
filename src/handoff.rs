//! Artifact handoff to the issue tracker.
//!
//! Packages the terminal state of a run for delivery: verified artifacts
//! plus execution evidence on acceptance, or a diagnostic report with the
//! full attempt history on exhaustion. The report must let a human decide
//! whether the generator or the environment is at fault without re-running
//! the pipeline.

use chrono::Utc;
use tracing::info;

use crate::error::DeliveryError;
use crate::orchestrator::{Attempt, OrchestrationResult};
use crate::tracker::{DeliveryPayload, DeliveryReceipt, Issue, Tracker};

/// Longest stdout excerpt included in an acceptance note.
const STDOUT_EXCERPT_LEN: usize = 1_000;

/// Packages and delivers orchestration results.
pub struct ArtifactHandoff;

impl ArtifactHandoff {
    /// Builds the delivery payload for a terminal state.
    pub fn payload_for(issue: &Issue, result: &OrchestrationResult) -> DeliveryPayload {
        match result {
            OrchestrationResult::Accepted {
                candidate,
                outcome,
                attempts,
            } => {
                let ordinal = attempts.last().map(|a| a.ordinal).unwrap_or(1);
                let mut body = format!(
                    "## Verified regression test for #{}\n\n\
                     Accepted at attempt {} of {} on {}.\n\n\
                     | | |\n|---|---|\n\
                     | Exit status | {} |\n\
                     | Duration | {} ms |\n",
                    issue.iid,
                    ordinal,
                    attempts.len(),
                    Utc::now().format("%Y-%m-%d %H:%M UTC"),
                    outcome.exit_status,
                    outcome.duration_ms,
                );
                if !outcome.stdout.trim().is_empty() {
                    body.push_str(&format!(
                        "\n**Test output**\n```\n{}\n```\n",
                        truncate(&outcome.stdout, STDOUT_EXCERPT_LEN)
                    ));
                }

                DeliveryPayload {
                    summary: format!("Verified regression test (attempt {ordinal})"),
                    body_markdown: body,
                    attachments: vec![candidate.explanation.clone(), candidate.script.clone()],
                }
            }
            OrchestrationResult::Exhausted {
                attempts,
                last_error,
            } => diagnostic_payload(
                issue,
                "Retry budget exhausted: no candidate passed verification. \
                 The evidence below points at the generated tests.",
                attempts,
                last_error,
            ),
            OrchestrationResult::EscalatedInfra {
                attempts,
                last_error,
            } => diagnostic_payload(
                issue,
                "Retry budget exhausted on an infrastructure failure: the \
                 sandbox or runtime needs operator attention, not the generator.",
                attempts,
                last_error,
            ),
        }
    }

    /// Delivers the packaged result to the tracker.
    ///
    /// Delivery and generation are independent failure domains: a failure
    /// here is reported to the caller and never re-enters the retry loop.
    pub async fn deliver(
        tracker: &dyn Tracker,
        issue: &Issue,
        result: &OrchestrationResult,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let payload = Self::payload_for(issue, result);
        info!(
            issue = issue.iid,
            terminal = result.label(),
            attachments = payload.attachments.len(),
            "Delivering result"
        );
        let receipt = tracker.submit_result(issue.iid, &payload).await?;
        Ok(receipt)
    }
}

/// Renders the diagnostic report for a failed run.
fn diagnostic_payload(
    issue: &Issue,
    headline: &str,
    attempts: &[Attempt],
    last_error: &str,
) -> DeliveryPayload {
    let mut body = format!(
        "## Regression test generation failed for #{}\n\n{}\n\n\
         Last error: `{}`\n",
        issue.iid, headline, last_error
    );

    for attempt in attempts {
        body.push_str(&format!(
            "\n### Attempt {} — {}\n",
            attempt.ordinal, attempt.termination
        ));
        match &attempt.candidate {
            Some(candidate) => {
                body.push_str(&format!(
                    "Candidate: `{}` ({} bytes), `{}` ({} bytes)\n",
                    candidate.explanation.name,
                    candidate.explanation.content.len(),
                    candidate.script.name,
                    candidate.script.content.len(),
                ));
            }
            None => body.push_str("Candidate: none produced\n"),
        }
        if let Some(outcome) = &attempt.outcome {
            body.push_str(&format!(
                "Exit status {} after {} ms.\n",
                outcome.exit_status, outcome.duration_ms
            ));
            if !outcome.stderr.is_empty() {
                // Stderr verbatim: this is the evidence a human needs.
                body.push_str(&format!("```\n{}\n```\n", outcome.stderr));
            }
        }
    }

    DeliveryPayload {
        summary: format!("Regression test generation failed after {} attempts", attempts.len()),
        body_markdown: body,
        attachments: Vec::new(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{ArtifactFile, CandidateSet};
    use crate::verifier::{Classification, ExecutionOutcome};

    fn issue() -> Issue {
        Issue {
            iid: 684,
            title: "t".to_string(),
            description: "d".to_string(),
            labels: Vec::new(),
            web_url: None,
        }
    }

    fn candidate() -> CandidateSet {
        CandidateSet {
            explanation: ArtifactFile::new("684_explain.md", "# plan"),
            script: ArtifactFile::new("684_test.m", "684_test ; t\n quit"),
        }
    }

    fn pass_outcome() -> ExecutionOutcome {
        ExecutionOutcome {
            exit_status: 0,
            stdout: "checked ok\n".to_string(),
            stderr: String::new(),
            classification: Classification::Pass,
            duration_ms: 42,
        }
    }

    #[test]
    fn test_accepted_payload_attaches_both_artifacts() {
        let result = OrchestrationResult::Accepted {
            candidate: candidate(),
            outcome: pass_outcome(),
            attempts: vec![Attempt {
                ordinal: 2,
                candidate: Some(candidate()),
                outcome: Some(pass_outcome()),
                termination: "PASS".to_string(),
            }],
        };

        let payload = ArtifactHandoff::payload_for(&issue(), &result);
        assert_eq!(payload.attachments.len(), 2);
        assert!(payload.summary.contains("attempt 2"));
        assert!(payload.body_markdown.contains("checked ok"));
    }

    #[test]
    fn test_diagnostic_payload_preserves_stderr_per_attempt() {
        let result = OrchestrationResult::Exhausted {
            attempts: vec![
                Attempt {
                    ordinal: 1,
                    candidate: Some(candidate()),
                    outcome: Some(ExecutionOutcome {
                        exit_status: 1,
                        stdout: String::new(),
                        stderr: "%YDB-E-LABELMISSING".to_string(),
                        classification: Classification::Fail,
                        duration_ms: 10,
                    }),
                    termination: "FAIL".to_string(),
                },
                Attempt {
                    ordinal: 2,
                    candidate: None,
                    outcome: None,
                    termination: "generator error: timeout".to_string(),
                },
            ],
            last_error: "generator failure: timeout".to_string(),
        };

        let payload = ArtifactHandoff::payload_for(&issue(), &result);
        assert!(payload.attachments.is_empty());
        assert!(payload.body_markdown.contains("%YDB-E-LABELMISSING"));
        assert!(payload.body_markdown.contains("Attempt 1"));
        assert!(payload.body_markdown.contains("Attempt 2"));
        assert!(payload.body_markdown.contains("Candidate: none produced"));
    }

    #[test]
    fn test_infra_payload_names_the_environment() {
        let result = OrchestrationResult::EscalatedInfra {
            attempts: Vec::new(),
            last_error: "infrastructure failure: daemon unreachable".to_string(),
        };
        let payload = ArtifactHandoff::payload_for(&issue(), &result);
        assert!(payload.body_markdown.contains("operator attention"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "héllo wörld, this is long";
        let t = truncate(s, 6);
        assert!(t.ends_with("..."));
    }

    struct FakeTracker {
        submissions: std::sync::Mutex<Vec<(u64, String)>>,
    }

    #[async_trait::async_trait]
    impl Tracker for FakeTracker {
        async fn fetch_issue(&self, _iid: u64) -> Result<Issue, crate::error::TrackerError> {
            unimplemented!("not exercised by handoff tests")
        }

        async fn submit_result(
            &self,
            iid: u64,
            payload: &DeliveryPayload,
        ) -> Result<DeliveryReceipt, crate::error::TrackerError> {
            self.submissions
                .lock()
                .unwrap()
                .push((iid, payload.body_markdown.clone()));
            Ok(DeliveryReceipt {
                note_id: Some(1),
                attachment_links: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_deliver_submits_exactly_once() {
        let tracker = FakeTracker {
            submissions: std::sync::Mutex::new(Vec::new()),
        };
        let result = OrchestrationResult::Accepted {
            candidate: candidate(),
            outcome: pass_outcome(),
            attempts: vec![Attempt {
                ordinal: 1,
                candidate: Some(candidate()),
                outcome: Some(pass_outcome()),
                termination: "PASS".to_string(),
            }],
        };

        let receipt = ArtifactHandoff::deliver(&tracker, &issue(), &result)
            .await
            .unwrap();
        assert_eq!(receipt.note_id, Some(1));

        let submissions = tracker.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].0, 684);
        assert!(submissions[0].1.contains("Verified regression test"));
    }
}
