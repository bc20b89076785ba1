use crate::error::Error;
use crate::pod::{Container, Pod};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Where the job's containers actually run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Kubernetes,
    Local,
    DryRun,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Kubernetes => write!(f, "kubernetes"),
            RunMode::Local => write!(f, "local"),
            RunMode::DryRun => write!(f, "dry-run"),
        }
    }
}

pub type ExecutorRef = Arc<dyn JobExecutor>;

/// Staged file copies run inside the pre-init container before any
/// user container starts.
pub type PreInitCallback =
    Arc<dyn Fn(ExecutorRef) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Hook run against every executor before its user command. The flag
/// marks init containers.
pub type MountCallback =
    Arc<dyn Fn(ExecutorRef, bool) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Collects a finished container's artifacts onto the controller.
/// The flag marks the main sub-task of the pod.
pub type CopyArtifactFn =
    Arc<dyn Fn(ExecutorRef, bool) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

pub type ExecutionHandler =
    Box<dyn FnOnce(Vec<ExecutorRef>) -> BoxFuture<'static, Result<(), Error>> + Send>;

/// Uniform command execution, file copy and lifecycle control over a
/// single container. Every backend implements this.
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run the container's command, block until completion and return
    /// the captured output. A non-zero exit surfaces as
    /// [`Error::CommandFailed`] carrying the output.
    async fn output(&self) -> Result<Vec<u8>, Error>;

    /// Fire-and-forget execution for sidecar containers.
    async fn exec_async(&self);

    /// Release the container.
    async fn stop(&self) -> Result<(), Error>;

    /// Record a final message for the container.
    async fn termination_log(&self, msg: &str) -> Result<(), Error>;

    /// Copy a path out of the container onto the controller.
    async fn copy_from(&self, src: &str, dst: &Path) -> Result<(), Error>;

    /// Copy a controller path into the container.
    async fn copy_to(&self, src: &Path, dst: &str) -> Result<(), Error>;

    /// Run an ad-hoc shell invocation in the container's already
    /// running environment, ahead of the user command.
    async fn prepare_command(&self, cmd: &[String]) -> Result<Vec<u8>, Error>;

    fn container(&self) -> &Container;

    fn container_idx(&self) -> usize;

    fn pod(&self) -> &Pod;
}

/// One pod attempt as seen by the task machinery. Backends decide how
/// the pod is materialized; they never decide mount layout.
#[async_trait::async_trait]
pub trait Job: Send {
    /// Install the pre-init container and its staging callback. The
    /// callback runs before any user container starts.
    fn pre_init(&mut self, container: Container, callback: PreInitCallback);

    /// Install the mount hook run against every executor.
    fn on_mount(&mut self, callback: MountCallback);

    /// Materialize the pod and hand its executors to the handler.
    async fn run_with_execution_handler(
        &mut self,
        handler: ExecutionHandler,
    ) -> Result<(), Error>;
}
