use podtest_core::error::Error;
use podtest_core::executor::{
    ExecutionHandler, ExecutorRef, Job, JobExecutor, MountCallback, PreInitCallback, RunMode,
};
use podtest_core::pod::{Container, Pod};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Creates the backend job for a built pod, selected by run mode.
pub struct JobBuilder {
    run_mode: RunMode,
    namespace: String,
    kubeconfig: Option<PathBuf>,
}

impl JobBuilder {
    pub fn new(run_mode: RunMode, namespace: impl Into<String>, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            run_mode,
            namespace: namespace.into(),
            kubeconfig,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    pub fn build(&self, pod: Pod) -> Result<Box<dyn Job>, Error> {
        match self.run_mode {
            RunMode::Kubernetes => Ok(Box::new(podtest_cluster::ClusterJob::new(
                pod,
                self.kubeconfig.clone(),
            ))),
            RunMode::Local => Ok(Box::new(podtest_local::LocalJob::new(pod)?)),
            RunMode::DryRun => Ok(Box::new(DryRunJob::new(pod))),
        }
    }
}

/// Dry-run job: performs no work at all. It exists so schedulers and
/// builders can be exercised without a cluster or local processes.
pub struct DryRunJob {
    pod: Pod,
}

impl DryRunJob {
    pub fn new(pod: Pod) -> Self {
        Self { pod }
    }
}

#[async_trait::async_trait]
impl Job for DryRunJob {
    fn pre_init(&mut self, _container: Container, _callback: PreInitCallback) {}

    fn on_mount(&mut self, _callback: MountCallback) {}

    async fn run_with_execution_handler(
        &mut self,
        handler: ExecutionHandler,
    ) -> Result<(), Error> {
        let execs: Vec<ExecutorRef> = self
            .pod
            .spec
            .containers
            .iter()
            .enumerate()
            .map(|(idx, container)| {
                Arc::new(DryRunExecutor {
                    container: container.clone(),
                    container_idx: idx,
                    pod: self.pod.clone(),
                }) as ExecutorRef
            })
            .collect();
        handler(execs).await
    }
}

pub struct DryRunExecutor {
    container: Container,
    container_idx: usize,
    pod: Pod,
}

impl DryRunExecutor {
    pub fn new(container: Container, container_idx: usize, pod: Pod) -> Self {
        Self {
            container,
            container_idx,
            pod,
        }
    }
}

#[async_trait::async_trait]
impl JobExecutor for DryRunExecutor {
    async fn output(&self) -> Result<Vec<u8>, Error> {
        Ok(b"( dry running ... )".to_vec())
    }

    async fn exec_async(&self) {}

    async fn stop(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn termination_log(&self, _msg: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn copy_from(&self, _src: &str, _dst: &Path) -> Result<(), Error> {
        Ok(())
    }

    async fn copy_to(&self, _src: &Path, _dst: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn prepare_command(&self, _cmd: &[String]) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn container(&self) -> &Container {
        &self.container
    }

    fn container_idx(&self) -> usize {
        self.container_idx
    }

    fn pod(&self) -> &Pod {
        &self.pod
    }
}
