//! Candidate generation interface.
//!
//! A generation attempt produces a [`CandidateSet`]: an ordered pair of named
//! outputs — an explanation document and an executable test script. The
//! orchestrator consumes generators through the [`Generator`] trait; the
//! production implementation is the LLM-backed [`LlmGenerator`].

mod llm_generator;

pub use llm_generator::LlmGenerator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;
use crate::tracker::Issue;

/// A named artifact produced by one generation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// File name, e.g. `684_test.m`.
    pub name: String,
    /// File content. May be empty when the generator failed to produce the
    /// member; shape validation catches that before any execution.
    pub content: String,
}

impl ArtifactFile {
    /// Creates a named artifact.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// True if the artifact has non-whitespace content.
    pub fn is_present(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// Ordered pair of outputs from one generation attempt: an explanation
/// document and an executable test script.
///
/// Both members must be present and non-empty for the set to be eligible for
/// verification; a partial set is always a FAIL at the generation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSet {
    /// Test logic, notes and explanation (`<iid>_explain.md`).
    pub explanation: ArtifactFile,
    /// Executable test script (`<iid>_test.m`).
    pub script: ArtifactFile,
}

impl CandidateSet {
    /// Conventional explanation file name for an issue.
    pub fn explanation_name(iid: u64) -> String {
        format!("{}_explain.md", iid)
    }

    /// Conventional script file name for an issue.
    pub fn script_name(iid: u64) -> String {
        format!("{}_test.m", iid)
    }

    /// True if both members are present and non-empty.
    pub fn is_complete(&self) -> bool {
        self.explanation.is_present() && self.script.is_present()
    }

    /// Names of the members that are missing or empty.
    pub fn missing_members(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if !self.explanation.is_present() {
            missing.push(self.explanation.name.clone());
        }
        if !self.script.is_present() {
            missing.push(self.script.name.clone());
        }
        missing
    }
}

/// Evidence from a failed attempt, carried forward to the next generation
/// call as corrective context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FailureEvidence {
    /// The candidate set was missing one or both members.
    IncompleteCandidate { missing: Vec<String> },
    /// The generator itself failed to produce a candidate.
    GeneratorFailure { message: String },
    /// The script executed but failed (non-success exit or error markers).
    ExecutionFailure { exit_status: i64, stderr: String },
    /// The sandbox could not dispatch the command at all.
    Infrastructure { message: String },
}

impl FailureEvidence {
    /// Renders the evidence as a corrective-context block appended to the
    /// next generation prompt.
    pub fn as_corrective_context(&self) -> String {
        match self {
            Self::IncompleteCandidate { missing } => format!(
                "Your previous answer was incomplete: the following required \
                 file(s) were missing or empty: {}. Produce BOTH files this time.",
                missing.join(", ")
            ),
            Self::GeneratorFailure { message } => format!(
                "Your previous answer could not be used: {}. \
                 Answer again following the required output format exactly.",
                message
            ),
            Self::ExecutionFailure {
                exit_status,
                stderr,
            } => format!(
                "Your previous test script failed when executed (exit status {}).\n\
                 Captured error output:\n{}\n\
                 Fix the script so it compiles and runs cleanly.",
                exit_status, stderr
            ),
            Self::Infrastructure { message } => format!(
                "The previous execution hit an environment problem ({}), not a \
                 problem in your script. Produce the same two files again.",
                message
            ),
        }
    }
}

impl std::fmt::Display for FailureEvidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncompleteCandidate { missing } => {
                write!(f, "incomplete candidate (missing: {})", missing.join(", "))
            }
            Self::GeneratorFailure { message } => write!(f, "generator failure: {}", message),
            Self::ExecutionFailure { exit_status, .. } => {
                write!(f, "execution failure (exit status {})", exit_status)
            }
            Self::Infrastructure { message } => write!(f, "infrastructure failure: {}", message),
        }
    }
}

/// External capability producing candidate artifact sets for an issue.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generates a candidate set from the issue description, with the prior
    /// attempt's failure evidence appended as corrective context on attempts
    /// after the first.
    async fn generate(
        &self,
        issue: &Issue,
        prior: Option<&FailureEvidence>,
    ) -> Result<CandidateSet, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_set() {
        let set = CandidateSet {
            explanation: ArtifactFile::new("684_explain.md", "# Test plan"),
            script: ArtifactFile::new("684_test.m", "test ; entry\n quit"),
        };
        assert!(set.is_complete());
        assert!(set.missing_members().is_empty());
    }

    #[test]
    fn test_whitespace_only_member_is_missing() {
        let set = CandidateSet {
            explanation: ArtifactFile::new("684_explain.md", "   \n\t"),
            script: ArtifactFile::new("684_test.m", "test ; entry"),
        };
        assert!(!set.is_complete());
        assert_eq!(set.missing_members(), vec!["684_explain.md".to_string()]);
    }

    #[test]
    fn test_both_members_missing() {
        let set = CandidateSet {
            explanation: ArtifactFile::new("684_explain.md", ""),
            script: ArtifactFile::new("684_test.m", ""),
        };
        assert_eq!(set.missing_members().len(), 2);
    }

    #[test]
    fn test_conventional_names() {
        assert_eq!(CandidateSet::explanation_name(684), "684_explain.md");
        assert_eq!(CandidateSet::script_name(684), "684_test.m");
    }

    #[test]
    fn test_corrective_context_carries_stderr() {
        let evidence = FailureEvidence::ExecutionFailure {
            exit_status: 1,
            stderr: "%YDB-E-LABELMISSING, Label referenced but not defined".to_string(),
        };
        let context = evidence.as_corrective_context();
        assert!(context.contains("%YDB-E-LABELMISSING"));
        assert!(context.contains("exit status 1"));
    }
}
