//! GitLab-backed tracker implementation.
//!
//! Issues are fetched through the REST v4 API; results are delivered by
//! uploading the artifact files to the project and posting an issue note
//! that links them.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::TrackerError;

use super::{DeliveryPayload, DeliveryReceipt, Issue, Tracker};

/// GitLab REST API client scoped to one project.
pub struct GitLabTracker {
    base_url: String,
    /// Project identifier: numeric id or URL-encoded full path.
    project: String,
    token: String,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    iid: u64,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUpload {
    markdown: String,
}

#[derive(Debug, Deserialize)]
struct ApiNote {
    id: u64,
}

impl GitLabTracker {
    /// Creates a tracker client for one project.
    pub fn new(
        base_url: impl Into<String>,
        project: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: project.into(),
            token: token.into(),
            http_client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Creates a tracker client from environment variables.
    ///
    /// - `REGRESS_FORGE_GITLAB_URL`: instance URL (defaults to gitlab.com)
    /// - `REGRESS_FORGE_GITLAB_PROJECT`: numeric id or full path (required)
    /// - `REGRESS_FORGE_GITLAB_TOKEN`: private token (required)
    pub fn from_env() -> Result<Self, TrackerError> {
        let base_url = env::var("REGRESS_FORGE_GITLAB_URL")
            .unwrap_or_else(|_| "https://gitlab.com".to_string());
        let project =
            env::var("REGRESS_FORGE_GITLAB_PROJECT").map_err(|_| TrackerError::MissingProject)?;
        let token =
            env::var("REGRESS_FORGE_GITLAB_TOKEN").map_err(|_| TrackerError::MissingToken)?;

        Ok(Self::new(base_url, project, token))
    }

    fn project_url(&self) -> String {
        format!(
            "{}/api/v4/projects/{}",
            self.base_url,
            urlencoding::encode(&self.project)
        )
    }

    /// Uploads one file to the project, returning its markdown link.
    async fn upload_file(&self, name: &str, content: &str) -> Result<String, TrackerError> {
        let url = format!("{}/uploads", self.project_url());
        let part = Part::bytes(content.as_bytes().to_vec())
            .file_name(name.to_string())
            .mime_str("text/plain")
            .map_err(|e| TrackerError::RequestFailed(e.to_string()))?;
        let form = Form::new().part("file", part);

        let response = self
            .http_client
            .post(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TrackerError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrackerError::ApiError {
                code: status.as_u16(),
                message: body,
            });
        }

        let upload: ApiUpload = response
            .json()
            .await
            .map_err(|e| TrackerError::ParseError(e.to_string()))?;

        debug!(file = name, "Uploaded artifact to tracker");
        Ok(upload.markdown)
    }
}

#[async_trait]
impl Tracker for GitLabTracker {
    async fn fetch_issue(&self, iid: u64) -> Result<Issue, TrackerError> {
        let url = format!("{}/issues/{}", self.project_url(), iid);

        let response = self
            .http_client
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(|e| TrackerError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(TrackerError::IssueNotFound { iid });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrackerError::ApiError {
                code: status.as_u16(),
                message: body,
            });
        }

        let api_issue: ApiIssue = response
            .json()
            .await
            .map_err(|e| TrackerError::ParseError(e.to_string()))?;

        info!(issue = api_issue.iid, title = %api_issue.title, "Fetched issue");

        Ok(Issue {
            iid: api_issue.iid,
            title: api_issue.title,
            description: api_issue.description.unwrap_or_default(),
            labels: api_issue.labels,
            web_url: api_issue.web_url,
        })
    }

    async fn submit_result(
        &self,
        iid: u64,
        payload: &DeliveryPayload,
    ) -> Result<DeliveryReceipt, TrackerError> {
        // Best effort on attachments: a failed upload degrades the note to
        // inline-only rather than failing the whole delivery.
        let mut attachment_links = Vec::new();
        for file in &payload.attachments {
            match self.upload_file(&file.name, &file.content).await {
                Ok(markdown) => attachment_links.push(markdown),
                Err(e) => {
                    warn!(file = %file.name, error = %e, "Attachment upload failed");
                }
            }
        }

        let mut body = payload.body_markdown.clone();
        if !attachment_links.is_empty() {
            body.push_str("\n\n**Attachments**\n");
            for link in &attachment_links {
                body.push_str(&format!("- {}\n", link));
            }
        }

        let url = format!("{}/issues/{}/notes", self.project_url(), iid);
        let response = self
            .http_client
            .post(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(|e| TrackerError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrackerError::ApiError {
                code: status.as_u16(),
                message: body,
            });
        }

        let note: ApiNote = response
            .json()
            .await
            .map_err(|e| TrackerError::ParseError(e.to_string()))?;

        info!(issue = iid, note = note.id, "Delivered result to tracker");

        Ok(DeliveryReceipt {
            note_id: Some(note.id),
            attachment_links,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_url_encodes_path() {
        let tracker = GitLabTracker::new("https://gitlab.com/", "group/repo", "tok");
        assert_eq!(
            tracker.project_url(),
            "https://gitlab.com/api/v4/projects/group%2Frepo"
        );
    }

    #[test]
    fn test_project_url_numeric_id_unchanged() {
        let tracker = GitLabTracker::new("https://git.example.org", "1234", "tok");
        assert_eq!(
            tracker.project_url(),
            "https://git.example.org/api/v4/projects/1234"
        );
    }

    #[test]
    fn test_api_issue_parsing_defaults() {
        let json = r#"{"iid": 684, "title": "A bug"}"#;
        let issue: ApiIssue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.iid, 684);
        assert!(issue.description.is_none());
        assert!(issue.labels.is_empty());
    }
}
