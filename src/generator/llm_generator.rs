//! LLM-backed candidate generator.
//!
//! Prompts a chat model with M expertise instructions plus the issue text and
//! extracts the two required artifact files from the response. Temperature is
//! pinned to 0.0 so a retry differs only because of the corrective evidence
//! appended to it.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::llm::{ChatRequest, LlmProvider, Message};
use crate::tracker::Issue;

use super::{ArtifactFile, CandidateSet, FailureEvidence, Generator};

/// Base instruction block establishing M/YottaDB expertise and the output
/// contract. The per-issue extension names the two concrete files.
const M_EXPERT_INSTRUCTIONS: &str = r#"You are an expert in the M (MUMPS) programming language and the YottaDB runtime.

You read bug reports against YottaDB and design small, self-contained regression
tests that reproduce the reported defect. Your tests:
- are plain M routines, compilable with the stock YottaDB compiler;
- start at a label matching the routine name and end with QUIT;
- write a short line to standard output describing what was checked;
- exercise the exact behavior the issue describes, not a paraphrase of it;
- avoid interactive input, timers longer than a second, and global state that
  outlives the process.

OUTPUT FORMAT (mandatory): emit each file between marker lines, nothing else
outside the blocks:

===FILE: <file name>===
<file content>
===END===
"#;

fn generation_extension(iid: u64) -> String {
    format!(
        "Read the issue below, design a regression test for it, and output \
         exactly two files:\n\
         a. {explain} containing the test logic, notes and explanations.\n\
         b. {script} containing the M test code that can be compiled and run.\n\
         The routine label inside {script} must be `{routine}`.",
        explain = CandidateSet::explanation_name(iid),
        script = CandidateSet::script_name(iid),
        routine = CandidateSet::script_name(iid).trim_end_matches(".m"),
    )
}

/// Generator that asks an LLM for the candidate artifact pair.
pub struct LlmGenerator {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_tokens: u32,
}

impl LlmGenerator {
    /// Creates a generator over the given provider, using the provider's
    /// default model.
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            model: String::new(),
            max_tokens: 8192,
        }
    }

    /// Sets an explicit model for generation requests.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the response token budget.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn build_messages(&self, issue: &Issue, prior: Option<&FailureEvidence>) -> Vec<Message> {
        let system = format!(
            "{}\n\n{}",
            M_EXPERT_INSTRUCTIONS,
            generation_extension(issue.iid)
        );

        let mut user = issue.render();
        if let Some(evidence) = prior {
            user.push_str("\n\n--- FEEDBACK FROM PREVIOUS ATTEMPT ---\n");
            user.push_str(&evidence.as_corrective_context());
        }

        vec![Message::system(system), Message::user(user)]
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(
        &self,
        issue: &Issue,
        prior: Option<&FailureEvidence>,
    ) -> Result<CandidateSet, GenerationError> {
        let request = ChatRequest::new(self.build_messages(issue, prior))
            .with_model(self.model.clone())
            .with_temperature(0.0)
            .with_max_tokens(self.max_tokens);

        let response = self.provider.complete(request).await?;

        debug!(
            issue = issue.iid,
            model = %response.model,
            tokens = ?response.total_tokens,
            retry = prior.is_some(),
            "Generator response received"
        );

        let candidate = extract_candidate(issue.iid, &response.content)?;
        if !candidate.is_complete() {
            warn!(
                issue = issue.iid,
                missing = ?candidate.missing_members(),
                "Generator produced an incomplete candidate set"
            );
        }
        Ok(candidate)
    }
}

/// Extracts the two expected artifact files from a marker-delimited response.
///
/// A missing block yields an empty member (shape validation handles it); a
/// response with no recognizable blocks at all is a malformed response.
fn extract_candidate(iid: u64, response: &str) -> Result<CandidateSet, GenerationError> {
    let blocks = extract_file_blocks(response);
    if blocks.is_empty() {
        return Err(GenerationError::MalformedResponse(
            "no file blocks found in response".to_string(),
        ));
    }

    let explanation_name = CandidateSet::explanation_name(iid);
    let script_name = CandidateSet::script_name(iid);

    let find = |wanted: &str| {
        blocks
            .iter()
            .find(|(name, _)| name == wanted)
            .map(|(_, body)| body.clone())
            .unwrap_or_default()
    };

    Ok(CandidateSet {
        explanation: ArtifactFile::new(&explanation_name, find(&explanation_name)),
        script: ArtifactFile::new(&script_name, find(&script_name)),
    })
}

/// Returns all `===FILE: name=== ... ===END===` blocks as (name, body) pairs.
fn extract_file_blocks(response: &str) -> Vec<(String, String)> {
    // Static pattern, cannot fail to compile.
    let re = Regex::new(r"(?s)===FILE:\s*(\S+?)\s*===\s*\n(.*?)===END===").unwrap();
    re.captures_iter(response)
        .map(|caps| {
            let name = caps[1].to_string();
            // Strip a fence the model may have wrapped the body in.
            let body = strip_code_fence(caps[2].trim_end_matches('\n'));
            (name, body)
        })
        .collect()
}

fn strip_code_fence(body: &str) -> String {
    let trimmed = body.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(inner) = rest.split_once('\n') {
            return inner.1.trim_end_matches("```").trim_end().to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_both_files() {
        let response = "Here you go.\n\
            ===FILE: 684_explain.md===\n# Plan\nCheck undefined labels.\n===END===\n\
            ===FILE: 684_test.m===\n684_test ; regression\n write \"ok\",!\n quit\n===END===\n";
        let candidate = extract_candidate(684, response).unwrap();
        assert!(candidate.is_complete());
        assert!(candidate.explanation.content.contains("Check undefined"));
        assert!(candidate.script.content.starts_with("684_test"));
    }

    #[test]
    fn test_extract_missing_script_is_incomplete_not_error() {
        let response = "===FILE: 684_explain.md===\nonly the doc\n===END===";
        let candidate = extract_candidate(684, response).unwrap();
        assert!(!candidate.is_complete());
        assert_eq!(candidate.missing_members(), vec!["684_test.m".to_string()]);
    }

    #[test]
    fn test_extract_no_blocks_is_malformed() {
        let err = extract_candidate(684, "I cannot help with that.").unwrap_err();
        assert!(matches!(err, GenerationError::MalformedResponse(_)));
    }

    #[test]
    fn test_extract_strips_code_fence() {
        let response =
            "===FILE: 9_test.m===\n```m\n9_test ; t\n quit\n```\n===END===\n\
             ===FILE: 9_explain.md===\ndoc\n===END===";
        let candidate = extract_candidate(9, response).unwrap();
        assert!(candidate.script.content.starts_with("9_test"));
        assert!(!candidate.script.content.contains("```"));
    }

    #[test]
    fn test_extension_names_routine_label() {
        let ext = generation_extension(123);
        assert!(ext.contains("123_explain.md"));
        assert!(ext.contains("123_test.m"));
        assert!(ext.contains("`123_test`"));
    }
}
