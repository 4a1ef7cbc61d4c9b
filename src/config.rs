//! Runtime profile and run-level configuration.
//!
//! The orchestrator itself is runtime-agnostic: everything specific to the
//! runtime under test (image, how a script is executed, what counts as
//! success, which stderr markers indicate a guest-code error) lives in a
//! [`RuntimeProfile`]. The defaults describe YottaDB, the runtime the tool
//! was built for.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Placeholder in the exec command template replaced by the routine name
/// (the script file name without its extension).
pub const ROUTINE_PLACEHOLDER: &str = "{routine}";

/// Description of the runtime under test inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeProfile {
    /// Docker image providing the runtime.
    pub image: String,
    /// Command template executed inside the container; each element may
    /// contain [`ROUTINE_PLACEHOLDER`].
    pub exec_template: Vec<String>,
    /// Exit status the guest command returns on success.
    pub success_exit_code: i64,
    /// Substrings in stderr that mark a compile/load error or runtime
    /// exception even when the exit status looks clean.
    pub error_markers: Vec<String>,
    /// Extension of the executable script file (used to derive the routine
    /// name from the file name).
    pub script_extension: String,
}

impl RuntimeProfile {
    /// The YottaDB profile used by default: run the generated M routine with
    /// the artifact directory appended to `ydb_routines`.
    pub fn yottadb() -> Self {
        Self {
            image: "download.yottadb.com/yottadb/yottadb-debian:latest".to_string(),
            exec_template: vec![
                "bash".to_string(),
                "-c".to_string(),
                format!(
                    "export ydb_routines=\"$ydb_routines /ydb_issues\" && yottadb -r {}",
                    ROUTINE_PLACEHOLDER
                ),
            ],
            success_exit_code: 0,
            error_markers: vec![
                "%YDB-E-".to_string(),
                "%YDB-F-".to_string(),
                "%GTM-E-".to_string(),
            ],
            script_extension: ".m".to_string(),
        }
    }

    /// Sets the Docker image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Sets the exec command template.
    pub fn with_exec_template(mut self, template: Vec<String>) -> Self {
        self.exec_template = template;
        self
    }

    /// Sets the success exit code.
    pub fn with_success_exit_code(mut self, code: i64) -> Self {
        self.success_exit_code = code;
        self
    }

    /// Builds the concrete exec command for a script file name.
    pub fn exec_command(&self, script_name: &str) -> Vec<String> {
        let routine = script_name
            .strip_suffix(&self.script_extension)
            .unwrap_or(script_name);
        self.exec_template
            .iter()
            .map(|part| part.replace(ROUTINE_PLACEHOLDER, routine))
            .collect()
    }

    /// True if stderr contains any of the configured error markers.
    pub fn has_error_marker(&self, stderr: &str) -> bool {
        self.error_markers.iter().any(|m| stderr.contains(m))
    }
}

impl Default for RuntimeProfile {
    fn default() -> Self {
        Self::yottadb()
    }
}

/// Run-level configuration for one orchestration run.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of generation attempts per issue.
    pub max_retries: u32,
    /// Optional wall-clock deadline for the whole run.
    pub deadline: Option<Duration>,
    /// Admission limit on concurrently active sandboxes across runs.
    pub max_active_sandboxes: usize,
}

impl RunnerConfig {
    /// Creates a configuration with the default retry budget of 3.
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            deadline: None,
            max_active_sandboxes: 4,
        }
    }

    /// Sets the retry budget. Values below 1 are clamped to 1.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// Sets the wall-clock deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the sandbox admission limit.
    pub fn with_max_active_sandboxes(mut self, max: usize) -> Self {
        self.max_active_sandboxes = max.max(1);
        self
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yottadb_exec_command_substitutes_routine() {
        let profile = RuntimeProfile::yottadb();
        let cmd = profile.exec_command("684_test.m");

        assert_eq!(cmd[0], "bash");
        assert_eq!(cmd[1], "-c");
        assert!(cmd[2].contains("yottadb -r 684_test"));
        assert!(!cmd[2].contains("{routine}"));
        assert!(!cmd[2].contains(".m"));
    }

    #[test]
    fn test_exec_command_without_extension() {
        let profile = RuntimeProfile::yottadb();
        let cmd = profile.exec_command("probe");
        assert!(cmd[2].contains("yottadb -r probe"));
    }

    #[test]
    fn test_error_markers() {
        let profile = RuntimeProfile::yottadb();
        assert!(profile.has_error_marker("%YDB-E-UNDEF, Undefined local variable"));
        assert!(profile.has_error_marker("%GTM-E-LABELMISSING"));
        assert!(!profile.has_error_marker("all good"));
    }

    #[test]
    fn test_runner_config_clamps_retries() {
        let config = RunnerConfig::new().with_max_retries(0);
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn test_runner_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(config.deadline.is_none());
        assert_eq!(config.max_active_sandboxes, 4);
    }
}
