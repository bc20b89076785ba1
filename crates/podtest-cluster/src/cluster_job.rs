use podtest_core::error::Error;
use podtest_core::executor::{
    ExecutionHandler, ExecutorRef, Job, JobExecutor, MountCallback, PreInitCallback,
};
use podtest_core::pod::{Container, Pod};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const START_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Thin wrapper around the `kubectl` binary. The cluster client
/// library proper stays behind this boundary; everything the job
/// needs is pod apply/delete, exec, cp and status reads.
struct Kubectl {
    namespace: String,
    kubeconfig: Option<PathBuf>,
}

impl Kubectl {
    fn new(namespace: String, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            namespace,
            kubeconfig,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(cfg) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(cfg);
        }
        cmd.arg("--namespace").arg(&self.namespace);
        cmd
    }

    /// Run an administrative kubectl command and return stdout.
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, Error> {
        debug!("running: kubectl {}", args.join(" "));
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Backend(format!("failed to run kubectl: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(format!(
                "kubectl {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn run_with_stdin(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>, Error> {
        debug!("running: kubectl {} (with stdin)", args.join(" "));
        let mut child = self
            .command()
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| Error::Backend(format!("failed to run kubectl: {}", e)))?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(input)
                .await
                .map_err(|e| Error::Backend(format!("failed to write kubectl stdin: {}", e)))?;
        }
        drop(child.stdin.take());
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Backend(format!("failed to wait for kubectl: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(format!(
                "kubectl {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Run a command inside a container. A non-zero exit is the
    /// command's own failure, reported with the captured output.
    async fn exec(&self, pod: &str, container: &str, argv: &[String]) -> Result<Vec<u8>, Error> {
        debug!("exec in {}/{}: {}", pod, container, argv.join(" "));
        let mut cmd = self.command();
        cmd.arg("exec").arg(pod).arg("-c").arg(container).arg("--");
        cmd.args(argv);
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::Backend(format!("failed to run kubectl exec: {}", e)))?;
        let mut bytes = output.stdout;
        bytes.extend_from_slice(&output.stderr);
        if output.status.success() {
            Ok(bytes)
        } else {
            Err(Error::CommandFailed {
                exit_code: output.status.code().unwrap_or(-1),
                output: bytes,
            })
        }
    }
}

/// Cluster job: one pod on the cluster. Every container is rewritten
/// to hold in an idle loop; real commands run through `kubectl exec`,
/// which lets pre-init copies and mount patching happen before any
/// user command, and lets `Stop` release a container by touching its
/// stop file. Init containers are released one at a time so the
/// ordering guarantees of a pod are preserved.
pub struct ClusterJob {
    kubectl: Arc<Kubectl>,
    pod: Pod,
    pre_init: Option<(Container, PreInitCallback)>,
    mount: Option<MountCallback>,
}

impl ClusterJob {
    pub fn new(pod: Pod, kubeconfig: Option<PathBuf>) -> Self {
        let kubectl = Arc::new(Kubectl::new(pod.namespace.clone(), kubeconfig));
        Self {
            kubectl,
            pod,
            pre_init: None,
            mount: None,
        }
    }

    fn manifest(&self, pre_init: Option<&Container>) -> serde_json::Value {
        let mut spec = self.pod.spec.clone();
        if let Some(container) = pre_init {
            spec.init_containers.insert(0, container.clone());
        }
        let init_containers: Vec<serde_json::Value> =
            spec.init_containers.iter().map(container_manifest).collect();
        let containers: Vec<serde_json::Value> =
            spec.containers.iter().map(container_manifest).collect();
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.pod.name,
                "namespace": self.pod.namespace,
                "labels": self.pod.labels,
                "annotations": self.pod.annotations,
            },
            "spec": {
                "restartPolicy": "Never",
                "initContainers": init_containers,
                "containers": containers,
                "volumes": spec.volumes,
            },
        })
    }

    async fn drive(
        &self,
        pre_init: Option<(Container, PreInitCallback)>,
        handler: ExecutionHandler,
    ) -> Result<(), Error> {
        if let Some((container, callback)) = pre_init {
            self.wait_container_running(&container.name, true).await?;
            let exec: ExecutorRef = Arc::new(ClusterExecutor::new(
                self.kubectl.clone(),
                self.pod.clone(),
                container,
                0,
            ));
            callback(exec.clone()).await?;
            exec.stop().await?;
        }

        for (idx, container) in self.pod.spec.init_containers.iter().enumerate() {
            self.wait_container_running(&container.name, true).await?;
            let exec: ExecutorRef = Arc::new(ClusterExecutor::new(
                self.kubectl.clone(),
                self.pod.clone(),
                container.clone(),
                idx,
            ));
            if let Some(mount) = &self.mount {
                mount(exec.clone(), true).await?;
            }
            exec.output().await?;
            exec.stop().await?;
        }

        self.wait_pod_running().await?;
        let mut execs: Vec<ExecutorRef> = Vec::new();
        for (idx, container) in self.pod.spec.containers.iter().enumerate() {
            let exec: ExecutorRef = Arc::new(ClusterExecutor::new(
                self.kubectl.clone(),
                self.pod.clone(),
                container.clone(),
                idx,
            ));
            if let Some(mount) = &self.mount {
                mount(exec.clone(), false).await?;
            }
            execs.push(exec);
        }
        handler(execs).await
    }

    async fn wait_container_running(&self, name: &str, init: bool) -> Result<(), Error> {
        let field = if init {
            "initContainerStatuses"
        } else {
            "containerStatuses"
        };
        let path = format!(
            "jsonpath={{.status.{}[?(@.name==\"{}\")].state.running.startedAt}}",
            field, name
        );
        let deadline = Instant::now() + START_TIMEOUT;
        loop {
            let out = self
                .kubectl
                .run(&["get", "pod", &self.pod.name, "-o", &path])
                .await?;
            if !out.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Backend(format!(
                    "timed out waiting for container {} of pod {} to start",
                    name, self.pod.name
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_pod_running(&self) -> Result<(), Error> {
        let deadline = Instant::now() + START_TIMEOUT;
        loop {
            let out = self
                .kubectl
                .run(&[
                    "get",
                    "pod",
                    &self.pod.name,
                    "-o",
                    "jsonpath={.status.phase}",
                ])
                .await?;
            let phase = String::from_utf8_lossy(&out);
            match phase.trim() {
                "Running" => return Ok(()),
                "Failed" | "Unknown" => {
                    return Err(Error::Backend(format!(
                        "pod {} entered phase {}",
                        self.pod.name,
                        phase.trim()
                    )));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::Backend(format!(
                    "timed out waiting for pod {} to run",
                    self.pod.name
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait::async_trait]
impl Job for ClusterJob {
    fn pre_init(&mut self, container: Container, callback: PreInitCallback) {
        self.pre_init = Some((container, callback));
    }

    fn on_mount(&mut self, callback: MountCallback) {
        self.mount = Some(callback);
    }

    async fn run_with_execution_handler(
        &mut self,
        handler: ExecutionHandler,
    ) -> Result<(), Error> {
        let pre_init = self.pre_init.take();
        let manifest = self.manifest(pre_init.as_ref().map(|(c, _)| c));
        let body = serde_json::to_vec(&manifest)?;
        self.kubectl.run_with_stdin(&["apply", "-f", "-"], &body).await?;
        info!("created pod {}", self.pod.name);

        let result = self.drive(pre_init, handler).await;

        // Deleting the pod releases every still-holding container.
        if let Err(e) = self
            .kubectl
            .run(&[
                "delete",
                "pod",
                &self.pod.name,
                "--wait=false",
                "--ignore-not-found",
            ])
            .await
        {
            warn!("failed to delete pod {}: {}", self.pod.name, e);
        }
        result
    }
}

pub struct ClusterExecutor {
    kubectl: Arc<Kubectl>,
    pod: Pod,
    container: Container,
    container_idx: usize,
    finished: AtomicBool,
}

impl ClusterExecutor {
    fn new(kubectl: Arc<Kubectl>, pod: Pod, container: Container, container_idx: usize) -> Self {
        Self {
            kubectl,
            pod,
            container,
            container_idx,
            finished: AtomicBool::new(false),
        }
    }

    fn stop_file(&self) -> String {
        stop_file(&self.container.name)
    }

    async fn exec_sh(&self, script: &str) -> Result<Vec<u8>, Error> {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        self.kubectl
            .exec(&self.pod.name, &self.container.name, &argv)
            .await
    }
}

#[async_trait::async_trait]
impl JobExecutor for ClusterExecutor {
    async fn output(&self) -> Result<Vec<u8>, Error> {
        let argv = self.container.command_argv();
        if argv.is_empty() {
            return Err(Error::Backend(format!(
                "container {} has an empty command",
                self.container.name
            )));
        }
        self.kubectl
            .exec(&self.pod.name, &self.container.name, &argv)
            .await
    }

    async fn exec_async(&self) {
        let argv = self.container.command_argv();
        if argv.is_empty() {
            return;
        }
        let kubectl = self.kubectl.clone();
        let pod = self.pod.name.clone();
        let container = self.container.name.clone();
        tokio::spawn(async move {
            if let Err(e) = kubectl.exec(&pod, &container, &argv).await {
                debug!("sidecar {} exited: {}", container, e);
            }
        });
    }

    async fn stop(&self) -> Result<(), Error> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.exec_sh(&format!("touch {}", self.stop_file()))
            .await
            .map(|_| ())
            .map_err(|e| Error::Backend(format!("failed to stop {}: {}", self.container.name, e)))
    }

    async fn termination_log(&self, msg: &str) -> Result<(), Error> {
        self.exec_sh(&format!(
            "echo {} > /dev/termination-log",
            shell_escape(msg)
        ))
        .await
        .map(|_| ())
    }

    async fn copy_from(&self, src: &str, dst: &Path) -> Result<(), Error> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.kubectl
            .run(&[
                "cp",
                &format!("{}:{}", self.pod.name, src),
                &dst.to_string_lossy(),
                "-c",
                &self.container.name,
            ])
            .await
            .map(|_| ())
            .map_err(|e| Error::Copy {
                src: src.to_string(),
                dst: dst.display().to_string(),
                reason: e.to_string(),
            })
    }

    async fn copy_to(&self, src: &Path, dst: &str) -> Result<(), Error> {
        self.kubectl
            .run(&[
                "cp",
                &src.to_string_lossy(),
                &format!("{}:{}", self.pod.name, dst),
                "-c",
                &self.container.name,
            ])
            .await
            .map(|_| ())
            .map_err(|e| Error::Copy {
                src: src.display().to_string(),
                dst: dst.to_string(),
                reason: e.to_string(),
            })
    }

    async fn prepare_command(&self, cmd: &[String]) -> Result<Vec<u8>, Error> {
        self.exec_sh(&cmd.join(" ")).await
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

fn container_manifest(container: &Container) -> serde_json::Value {
    let hold = format!("until [ -f {} ]; do sleep 0.5; done", stop_file(&container.name));
    // Only the API fields; the remembered original mount paths are
    // controller-side bookkeeping.
    let volume_mounts: Vec<serde_json::Value> = container
        .volume_mounts
        .iter()
        .map(|mount| json!({"name": mount.name, "mountPath": mount.mount_path}))
        .collect();
    let mut manifest = json!({
        "name": container.name,
        "image": container.image,
        "command": ["sh", "-c", hold],
        "env": container.env,
        "volumeMounts": volume_mounts,
    });
    if !container.working_dir.is_empty() {
        manifest["workingDir"] = json!(container.working_dir);
    }
    if let Some(policy) = &container.image_pull_policy {
        manifest["imagePullPolicy"] = json!(policy);
    }
    manifest
}

fn stop_file(container: &str) -> String {
    format!("/tmp/.podtest-{}-done", container)
}

fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use podtest_core::pod::{PodSpec, Volume, VolumeSource};

    #[test]
    fn manifest_holds_containers_and_keeps_volumes() {
        let pod = Pod {
            name: "test-pod".to_string(),
            namespace: "default".to_string(),
            spec: PodSpec {
                containers: vec![Container {
                    name: "test".to_string(),
                    image: "alpine".to_string(),
                    command: vec!["echo".to_string()],
                    args: vec!["hello".to_string()],
                    ..Container::default()
                }],
                volumes: vec![Volume {
                    name: "scratch".to_string(),
                    source: VolumeSource::EmptyDir {},
                }],
                ..PodSpec::default()
            },
            ..Pod::default()
        };
        let job = ClusterJob::new(pod, None);
        let manifest = job.manifest(None);
        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["command"][0], "sh");
        assert!(container["command"][2]
            .as_str()
            .unwrap()
            .contains("/tmp/.podtest-test-done"));
        assert_eq!(manifest["spec"]["volumes"][0]["name"], "scratch");
        assert!(manifest["spec"]["volumes"][0]["emptyDir"].is_object());
    }
}
