//! Issue tracker interface.
//!
//! The tracker is consumed at exactly two points of a run: once at the start
//! to fetch the issue, and once at the end to deliver either the verified
//! artifacts or a diagnostic report.

mod gitlab;

pub use gitlab::GitLabTracker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TrackerError;
use crate::generator::ArtifactFile;

/// A tracker issue: immutable identifier plus the natural-language
/// description used as generation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Project-scoped issue id.
    pub iid: u64,
    /// Issue title.
    pub title: String,
    /// Issue body.
    pub description: String,
    /// Labels on the issue.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Browser URL of the issue, when the tracker provides one.
    #[serde(default)]
    pub web_url: Option<String>,
}

impl Issue {
    /// Renders the issue as generation context.
    pub fn render(&self) -> String {
        let mut out = format!("Issue #{}: {}\n", self.iid, self.title);
        if !self.labels.is_empty() {
            out.push_str(&format!("Labels: {}\n", self.labels.join(", ")));
        }
        out.push('\n');
        out.push_str(&self.description);
        out
    }
}

/// What gets pushed back to the tracker at the end of a run.
#[derive(Debug, Clone)]
pub struct DeliveryPayload {
    /// One-line summary of the run's terminal state.
    pub summary: String,
    /// Full note body, markdown.
    pub body_markdown: String,
    /// Artifact files to attach to the note.
    pub attachments: Vec<ArtifactFile>,
}

/// Proof of delivery from the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Identifier of the created note, when the tracker reports one.
    pub note_id: Option<u64>,
    /// Markdown links to the uploaded attachments.
    pub attachment_links: Vec<String>,
}

/// External issue-tracking capability.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Fetches one issue by its project-scoped id.
    async fn fetch_issue(&self, iid: u64) -> Result<Issue, TrackerError>;

    /// Delivers a run's result payload against the issue.
    async fn submit_result(
        &self,
        iid: u64,
        payload: &DeliveryPayload,
    ) -> Result<DeliveryReceipt, TrackerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_render_contains_fields() {
        let issue = Issue {
            iid: 684,
            title: "ZWRITE loses subscripts".to_string(),
            description: "Steps to reproduce: ...".to_string(),
            labels: vec!["bug".to_string(), "runtime".to_string()],
            web_url: None,
        };
        let rendered = issue.render();
        assert!(rendered.starts_with("Issue #684: ZWRITE loses subscripts"));
        assert!(rendered.contains("Labels: bug, runtime"));
        assert!(rendered.contains("Steps to reproduce"));
    }

    #[test]
    fn test_issue_render_without_labels() {
        let issue = Issue {
            iid: 1,
            title: "t".to_string(),
            description: "d".to_string(),
            labels: Vec::new(),
            web_url: None,
        };
        assert!(!issue.render().contains("Labels:"));
    }
}
