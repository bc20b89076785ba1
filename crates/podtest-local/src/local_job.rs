use podtest_core::error::Error;
use podtest_core::executor::{
    ExecutionHandler, ExecutorRef, Job, JobExecutor, MountCallback, PreInitCallback,
};
use podtest_core::pod::{Container, Pod};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

/// Local job: materializes the pod under a temporary root directory
/// on the controller's own filesystem. Volume mounts are implemented
/// by symlinking the user-declared mount path under the root to the
/// pre-init staging path, so user commands see the staged data at the
/// path they asked for without any container runtime involved.
pub struct LocalJob {
    root: Arc<TempDir>,
    pod: Pod,
    pre_init: Option<(Container, PreInitCallback)>,
}

impl LocalJob {
    pub fn new(pod: Pod) -> Result<Self, Error> {
        let root = TempDir::new()?;
        Ok(Self {
            root: Arc::new(root),
            pod,
            pre_init: None,
        })
    }
}

#[async_trait::async_trait]
impl Job for LocalJob {
    fn pre_init(&mut self, container: Container, callback: PreInitCallback) {
        self.pre_init = Some((container, callback));
    }

    fn on_mount(&mut self, _callback: MountCallback) {
        // Mount patching is a shell-level concern inside a real pod.
        // Locally the declared mount paths are symlinked to the staged
        // data instead, so there is nothing to patch.
    }

    async fn run_with_execution_handler(
        &mut self,
        handler: ExecutionHandler,
    ) -> Result<(), Error> {
        let mut staged_paths: HashMap<String, PathBuf> = HashMap::new();
        if let Some((container, callback)) = self.pre_init.take() {
            let exec: ExecutorRef = Arc::new(LocalExecutor::new(
                self.root.clone(),
                container.clone(),
                0,
                self.pod.clone(),
            ));
            callback(exec).await?;
            for mount in &container.volume_mounts {
                staged_paths.insert(
                    mount.name.clone(),
                    join_root(self.root.path(), &mount.mount_path),
                );
            }
        }

        let mut linked: HashSet<PathBuf> = HashSet::new();
        let all_containers = self
            .pod
            .spec
            .init_containers
            .iter()
            .chain(self.pod.spec.containers.iter());
        for container in all_containers {
            for mount in &container.volume_mounts {
                let Some(staged) = staged_paths.get(&mount.name) else {
                    continue;
                };
                // The staged data already sits at the rewritten mount
                // path under this root; link the path the user declared
                // back to it.
                let Some(org) = &mount.original_mount_path else {
                    continue;
                };
                let link = join_root(self.root.path(), org);
                if link == *staged || !linked.insert(link.clone()) {
                    continue;
                }
                if let Some(parent) = link.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::os::unix::fs::symlink(staged, &link).map_err(|e| {
                    Error::Backend(format!(
                        "failed to link {} to {}: {}",
                        link.display(),
                        staged.display(),
                        e
                    ))
                })?;
            }
        }

        // Init containers run sequentially before anything else.
        for (idx, container) in self.pod.spec.init_containers.iter().enumerate() {
            let exec = LocalExecutor::new(self.root.clone(), container.clone(), idx, self.pod.clone());
            debug!("running init container {}", container.name);
            exec.output().await?;
        }

        let execs: Vec<ExecutorRef> = self
            .pod
            .spec
            .containers
            .iter()
            .enumerate()
            .map(|(idx, container)| {
                Arc::new(LocalExecutor::new(
                    self.root.clone(),
                    container.clone(),
                    idx,
                    self.pod.clone(),
                )) as ExecutorRef
            })
            .collect();
        handler(execs).await
    }
}

pub struct LocalExecutor {
    root: Arc<TempDir>,
    container: Container,
    container_idx: usize,
    pod: Pod,
}

impl LocalExecutor {
    fn new(root: Arc<TempDir>, container: Container, container_idx: usize, pod: Pod) -> Self {
        Self {
            root,
            container,
            container_idx,
            pod,
        }
    }

    /// Build the command with `cwd = <root>/<workingDir>` and an
    /// environment reduced to the container's declared variables.
    fn command(&self) -> Result<Command, Error> {
        let argv = self.container.command_argv();
        if argv.is_empty() {
            return Err(Error::Backend(format!(
                "container {} has an empty command",
                self.container.name
            )));
        }
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        for env in &self.container.env {
            if env.value.is_empty() {
                continue;
            }
            cmd.env(&env.name, &env.value);
        }
        let cwd = join_root(self.root.path(), &self.container.working_dir);
        std::fs::create_dir_all(&cwd)?;
        cmd.current_dir(cwd);
        Ok(cmd)
    }
}

#[async_trait::async_trait]
impl JobExecutor for LocalExecutor {
    async fn output(&self) -> Result<Vec<u8>, Error> {
        let out = self.command()?.output().await.map_err(|e| {
            Error::Backend(format!(
                "failed to spawn command for container {}: {}",
                self.container.name, e
            ))
        })?;
        let mut bytes = out.stdout;
        bytes.extend_from_slice(&out.stderr);
        if out.status.success() {
            Ok(bytes)
        } else {
            Err(Error::CommandFailed {
                exit_code: out.status.code().unwrap_or(-1),
                output: bytes,
            })
        }
    }

    async fn exec_async(&self) {
        match self.command() {
            Ok(mut cmd) => {
                tokio::spawn(async move {
                    let _ = cmd.output().await;
                });
            }
            Err(e) => warn!("failed to start sidecar: {}", e),
        }
    }

    async fn stop(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn termination_log(&self, msg: &str) -> Result<(), Error> {
        debug!("termination log for {}: {}", self.container.name, msg);
        Ok(())
    }

    async fn copy_from(&self, src: &str, dst: &Path) -> Result<(), Error> {
        let src = join_root(self.root.path(), src);
        debug!("copy {} to {}", src.display(), dst.display());
        copy_path(&src, dst)
    }

    async fn copy_to(&self, src: &Path, dst: &str) -> Result<(), Error> {
        let dst = join_root(self.root.path(), dst);
        debug!("copy {} to {}", src.display(), dst.display());
        copy_path(src, &dst)
    }

    async fn prepare_command(&self, _cmd: &[String]) -> Result<Vec<u8>, Error> {
        // The symlinked volumes already expose the staged data.
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

fn join_root(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

/// Copy a file or directory tree. A file copied onto an existing
/// directory lands inside it under its own name.
fn copy_path(src: &Path, dst: &Path) -> Result<(), Error> {
    copy_path_inner(src, dst).map_err(|e| Error::Copy {
        src: src.display().to_string(),
        dst: dst.display().to_string(),
        reason: e.to_string(),
    })
}

fn copy_path_inner(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_path_inner(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }
    let dst = if dst.is_dir() {
        match src.file_name() {
            Some(name) => dst.join(name),
            None => dst.to_path_buf(),
        }
    } else {
        dst.to_path_buf()
    };
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, &dst)?;
    Ok(())
}
