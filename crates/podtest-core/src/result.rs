use crate::error::Error;
use crate::logger::JobLogger;
use crate::pod::{Container, Pod};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResultStatus {
    Success,
    Failure,
}

impl TaskResultStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResultStatus::Success)
    }
}

impl fmt::Display for TaskResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskResultStatus::Success => write!(f, "success"),
            TaskResultStatus::Failure => write!(f, "failure"),
        }
    }
}

/// Outcome of one container command execution.
#[derive(Debug)]
pub struct SubTaskResult {
    pub status: TaskResultStatus,
    pub elapsed: Duration,
    pub out: Vec<u8>,
    pub err: Option<Error>,
    pub artifact_err: Option<Error>,
    pub name: String,
    pub container: Container,
    pub pod: Pod,
    pub key_env_name: String,
    pub is_main: bool,
}

impl SubTaskResult {
    /// The executed command, prefixed with the strategy key when one
    /// was injected.
    pub fn command(&self) -> String {
        let cmd = self.container.command_line();
        if self.key_env_name.is_empty() {
            cmd
        } else {
            format!("[{}:{}] {}", self.key_env_name, self.name, cmd)
        }
    }

    /// Primary and artifact errors joined, if any.
    pub fn error_summary(&self) -> Option<String> {
        let mut errs = Vec::new();
        if let Some(err) = &self.err {
            errs.push(err.to_string());
        }
        if let Some(err) = &self.artifact_err {
            errs.push(err.to_string());
        }
        if errs.is_empty() {
            None
        } else {
            Some(errs.join(": "))
        }
    }

    /// A sub-task that never ran because staging its pod failed.
    pub fn staging_failure(name: &str, err: Error) -> Self {
        Self {
            status: TaskResultStatus::Failure,
            elapsed: Duration::ZERO,
            out: Vec::new(),
            err: Some(err),
            artifact_err: None,
            name: name.to_string(),
            container: Container::default(),
            pod: Pod::default(),
            key_env_name: String::new(),
            is_main: true,
        }
    }
}

/// Append-only collection point for sub-task results arriving from
/// concurrently running sub-tasks.
#[derive(Debug, Default)]
pub struct SubTaskResultGroup {
    results: Mutex<Vec<SubTaskResult>>,
}

impl SubTaskResultGroup {
    pub fn add(&self, result: SubTaskResult) {
        self.results.lock().unwrap().push(result);
    }

    pub fn take_results(&self) -> Vec<SubTaskResult> {
        std::mem::take(&mut *self.results.lock().unwrap())
    }
}

/// All sub-task results of one pod attempt.
#[derive(Debug)]
pub struct TaskResult {
    pub name: String,
    pub results: Vec<SubTaskResult>,
}

impl TaskResult {
    /// Success iff every sub-task succeeded (artifact errors included,
    /// since they force the sub-task to failure).
    pub fn status(&self) -> TaskResultStatus {
        if self.results.iter().all(|r| r.status.is_success()) {
            TaskResultStatus::Success
        } else {
            TaskResultStatus::Failure
        }
    }

    pub fn main_results(&self) -> impl Iterator<Item = &SubTaskResult> {
        self.results.iter().filter(|r| r.is_main)
    }
}

/// Aggregate outcome of a whole run: pre-steps plus the main step.
#[derive(Debug)]
pub struct RunResult {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub tasks: Vec<TaskResult>,
}

impl RunResult {
    pub fn new(job: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            job: job.into(),
            started_at,
            tasks: Vec::new(),
        }
    }

    pub fn push(&mut self, result: TaskResult) {
        self.tasks.push(result);
    }

    pub fn extend(&mut self, results: Vec<TaskResult>) {
        self.tasks.extend(results);
    }

    pub fn status(&self) -> TaskResultStatus {
        if self.tasks.iter().all(|t| t.status().is_success()) {
            TaskResultStatus::Success
        } else {
            TaskResultStatus::Failure
        }
    }

    /// Serializable, masked view written to the report file and
    /// printed as the final line of a run.
    pub fn report(&self, elapsed: Duration, logger: &JobLogger) -> RunReport {
        let subtasks = self
            .tasks
            .iter()
            .flat_map(|task| task.results.iter())
            .map(|r| SubTaskReport {
                name: logger.filter(&r.name),
                status: r.status,
                elapsed_sec: r.elapsed.as_secs_f64(),
                container: r.container.name.clone(),
                pod: r.pod.name.clone(),
                is_main: r.is_main,
                error: r.error_summary().map(|e| logger.filter(&e)),
            })
            .collect();
        RunReport {
            job: self.job.clone(),
            status: self.status(),
            started_at: self.started_at,
            elapsed_sec: elapsed.as_secs(),
            subtasks,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub job: String,
    pub status: TaskResultStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_sec: u64,
    pub subtasks: Vec<SubTaskReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskReport {
    pub name: String,
    pub status: TaskResultStatus,
    pub elapsed_sec: f64,
    pub container: String,
    pub pod: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(name: &str) -> SubTaskResult {
        SubTaskResult {
            status: TaskResultStatus::Success,
            elapsed: Duration::from_secs(1),
            out: b"ok".to_vec(),
            err: None,
            artifact_err: None,
            name: name.to_string(),
            container: Container::default(),
            pod: Pod::default(),
            key_env_name: String::new(),
            is_main: true,
        }
    }

    #[test]
    fn task_status_composes_over_subtasks() {
        let mut task = TaskResult {
            name: "t".to_string(),
            results: vec![success("a"), success("b")],
        };
        assert!(task.status().is_success());

        let mut failed = success("c");
        failed.status = TaskResultStatus::Failure;
        failed.artifact_err = Some(Error::Backend("copy failed".to_string()));
        task.results.push(failed);
        assert_eq!(task.status(), TaskResultStatus::Failure);
    }

    #[test]
    fn command_is_prefixed_with_key() {
        let mut result = success("A");
        result.container.command = vec!["sh".to_string(), "-c".to_string()];
        result.container.args = vec!["echo $TEST".to_string()];
        result.key_env_name = "TEST".to_string();
        assert_eq!(result.command(), "[TEST:A] sh -c echo $TEST");
    }

    #[test]
    fn error_summary_joins_both_errors() {
        let mut result = success("a");
        result.err = Some(Error::Backend("boom".to_string()));
        result.artifact_err = Some(Error::Backend("copy".to_string()));
        let summary = result.error_summary().unwrap();
        assert!(summary.contains("boom"));
        assert!(summary.contains("copy"));
    }
}
