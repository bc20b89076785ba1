use crate::job::JobBuilder;
use crate::scheduler::StrategyKey;
use crate::task::{Task, TaskPhase};
use futures::FutureExt;
use podtest_core::error::Error;
use podtest_core::executor::{
    CopyArtifactFn, ExecutorRef, JobExecutor, MountCallback, PreInitCallback, RunMode,
};
use podtest_core::job::{
    ArtifactSpec, JobContainer, StepPodSpec, StepTemplate, TestJobVolume, TestJobVolumeSource,
};
use podtest_core::logger::JobLogger;
use podtest_core::pod::{Container, EnvVar, Pod, PodSpec, Volume, VolumeMount, VolumeSource};
use podtest_core::resource::{ReportFormat, ResourceManager};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const JOB_LABEL: &str = "podtest.io/job";
pub const STRATEGY_KEYS_ANNOTATION: &str = "podtest.io/strategy-keys";

const REPO_ARCHIVE_DIR: &str = "/tmp/repo-archive";
const TOKEN_DIR: &str = "/tmp/token";
const ARTIFACT_ARCHIVE_DIR: &str = "/tmp/artifact-archive";
const LOG_MOUNT_PATH: &str = "/tmp/log";
const LOG_MOUNT_FILE: &str = "/tmp/log/podtest.log";
const REPORT_MOUNT_PATH: &str = "/tmp/report";
const REPORT_MOUNT_FILE: &str = "/tmp/report/report.json";
const PRE_INIT_CONTAINER_NAME: &str = "preinit";
const PRE_INIT_COPY_TIMEOUT: Duration = Duration::from_secs(600);

/// Materializes a task from a step template: rewrites user-declared
/// volume mounts onto staging paths, plans the pre-init copies that
/// plant repositories, tokens and artifacts into the pod, expands the
/// main container over strategy keys, and wires artifact copy-back.
pub struct TaskBuilder {
    job_builder: JobBuilder,
    mgr: Arc<ResourceManager>,
    logger: JobLogger,
}

impl TaskBuilder {
    pub fn new(job_builder: JobBuilder, mgr: Arc<ResourceManager>, logger: JobLogger) -> Self {
        Self {
            job_builder,
            mgr,
            logger,
        }
    }

    fn run_mode(&self) -> RunMode {
        self.job_builder.run_mode()
    }

    pub async fn build(&self, name: &str, tmpl: &StepTemplate) -> Result<Task, Error> {
        self.build_with_key(name, tmpl, None).await
    }

    pub async fn build_with_key(
        &self,
        name: &str,
        tmpl: &StepTemplate,
        strategy_key: Option<StrategyKey>,
    ) -> Result<Task, Error> {
        let main_container = tmpl.spec.main_container()?.clone();
        if main_container.container.name.is_empty() {
            return Err(Error::MainContainerUnspecified);
        }

        let mut spec = tmpl.spec.clone();
        let main_names =
            expand_strategy_containers(&mut spec, &main_container, strategy_key.as_ref());
        let ctx = BuildContext::new(&spec);
        self.mgr.add_artifacts(&spec.artifacts);

        let pod = self.build_pod(tmpl, &ctx, strategy_key.as_ref())?;
        let mut job = self.job_builder.build(pod.clone())?;

        let phase = Arc::new(Mutex::new(TaskPhase::Built));
        if ctx.needs_pre_init() {
            let callback = self.pre_init_callback(&ctx, phase.clone())?;
            job.pre_init(pre_init_container(&ctx), callback);
        }
        job.on_mount(self.mount_callback(&ctx));

        let copy_artifact = self.copy_artifact_fn(&spec.artifacts, &main_container);
        let finalizer_name = spec
            .finalizer_container
            .as_ref()
            .map(|c| c.container.name.clone());
        Ok(Task::new(
            name.to_string(),
            job,
            pod,
            strategy_key,
            main_names,
            finalizer_name,
            copy_artifact,
            self.logger.clone(),
            phase,
        ))
    }

    fn build_pod(
        &self,
        tmpl: &StepTemplate,
        ctx: &BuildContext,
        strategy_key: Option<&StrategyKey>,
    ) -> Result<Pod, Error> {
        let mut labels = tmpl.metadata.labels.clone();
        labels.insert(JOB_LABEL.to_string(), "true".to_string());
        let mut annotations = tmpl.metadata.annotations.clone();
        if let Some(key) = strategy_key {
            annotations.insert(
                STRATEGY_KEYS_ANNOTATION.to_string(),
                serde_json::to_string(&key.keys)?,
            );
        }
        let init_containers: Vec<Container> = ctx
            .init
            .iter()
            .map(|plan| plan.container.container.clone())
            .collect();
        let mut containers: Vec<Container> = ctx
            .mains
            .iter()
            .map(|plan| plan.container.container.clone())
            .collect();
        if let Some(finalizer) = &ctx.finalizer {
            containers.push(finalizer.container.container.clone());
        }
        Ok(Pod {
            name: generate_name(&tmpl.metadata.name),
            namespace: self.job_builder.namespace().to_string(),
            labels,
            annotations,
            spec: PodSpec {
                init_containers,
                containers,
                volumes: ctx.pod_volumes(),
            },
        })
    }

    /// Every pre-init copy has its own timeout; the copies run in
    /// declaration order inside the pre-init container.
    fn pre_init_callback(
        &self,
        ctx: &BuildContext,
        phase: Arc<Mutex<TaskPhase>>,
    ) -> Result<PreInitCallback, Error> {
        let mut copy_paths: Vec<(PathBuf, String)> = Vec::new();
        for name in ctx.repo_names() {
            let src = self.mgr.repository_path_by_name(&name)?;
            let dst_dir = ctx.repo_archive_path(&name).unwrap_or_default();
            copy_paths.push((src, format!("{}/repo.tar.gz", dst_dir)));
        }
        for name in ctx.token_names() {
            let src = self.mgr.token_path_by_name(&name)?;
            let dst_dir = ctx.token_path(&name).unwrap_or_default();
            copy_paths.push((src, format!("{}/token", dst_dir)));
        }
        if self.run_mode() != RunMode::DryRun {
            for name in ctx.artifact_names() {
                let src = self.mgr.artifact_path_by_name(&name)?;
                let file = src
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let dst_dir = ctx.artifact_path(&name).unwrap_or_default();
                copy_paths.push((src, format!("{}/{}", dst_dir, file)));
            }
            if ctx.uses_log_volume() {
                copy_paths.push((self.mgr.log_path(), LOG_MOUNT_FILE.to_string()));
            }
            if ctx.uses_report_volume() {
                copy_paths.push((
                    self.mgr.report_path(ReportFormat::Json),
                    REPORT_MOUNT_FILE.to_string(),
                ));
            }
        }

        let copy_paths = Arc::new(copy_paths);
        Ok(Arc::new(move |exec: ExecutorRef| {
            let copy_paths = copy_paths.clone();
            let phase = phase.clone();
            async move {
                for (src, dst) in copy_paths.iter() {
                    debug!("staging {} to {}", src.display(), dst);
                    match tokio::time::timeout(PRE_INIT_COPY_TIMEOUT, exec.copy_to(src, dst))
                        .await
                    {
                        Ok(result) => result?,
                        Err(_) => return Err(Error::PreInitTimeout(PRE_INIT_COPY_TIMEOUT)),
                    }
                }
                *phase.lock().unwrap() = TaskPhase::PreInitStaged;
                Ok(())
            }
            .boxed()
        }))
    }

    /// Shell pre-commands that restore the user's declared mount paths
    /// from the staged data, run in each container before its command.
    fn mount_callback(&self, ctx: &BuildContext) -> MountCallback {
        let ctx = Arc::new(ctx.clone());
        let mgr = self.mgr.clone();
        let run_mode = self.run_mode();
        Arc::new(move |exec: ExecutorRef, is_init: bool| {
            let ctx = ctx.clone();
            let mgr = mgr.clone();
            async move {
                let name = exec.container().name.clone();
                let Some(plan) = ctx.plan_for(&name, is_init) else {
                    return Ok(());
                };
                mount_repositories(exec.as_ref(), plan).await?;
                mount_tokens(exec.as_ref(), plan).await?;
                mount_artifacts(exec.as_ref(), plan, &mgr, run_mode).await?;
                mount_log(exec.as_ref(), plan).await?;
                mount_report(exec.as_ref(), plan).await?;
                Ok(())
            }
            .boxed()
        })
    }

    fn copy_artifact_fn(
        &self,
        artifacts: &[ArtifactSpec],
        main_container: &JobContainer,
    ) -> CopyArtifactFn {
        let mut artifact_map: HashMap<String, Vec<ArtifactSpec>> = HashMap::new();
        for artifact in artifacts {
            artifact_map
                .entry(artifact.container.name.clone())
                .or_default()
                .push(artifact.clone());
        }
        let artifact_map = Arc::new(artifact_map);
        let mgr = self.mgr.clone();
        let run_mode = self.run_mode();
        let main_name = main_container.container.name.clone();
        let agent_enabled = main_container.agent.is_some();
        Arc::new(move |exec: ExecutorRef, is_main: bool| {
            let artifact_map = artifact_map.clone();
            let mgr = mgr.clone();
            let main_name = main_name.clone();
            async move {
                if run_mode == RunMode::DryRun {
                    return Ok(());
                }
                let owner = if is_main {
                    main_name
                } else {
                    exec.container().name.clone()
                };
                let Some(artifacts) = artifact_map.get(&owner) else {
                    return Ok(());
                };
                for artifact in artifacts {
                    let local = mgr.artifact_path_by_name_and_container_name(
                        &artifact.name,
                        &exec.container().name,
                    )?;
                    // Agent transport is directory-granular; the file
                    // keeps its base name under the parent.
                    let local = if agent_enabled {
                        local.parent().map(Path::to_path_buf).unwrap_or(local)
                    } else {
                        local
                    };
                    exec.copy_from(&artifact.container.path, &local).await?;
                }
                Ok(())
            }
            .boxed()
        })
    }
}

/// Clone the main container once per key. Clone names are
/// `<name><concurrentIdx>-<keyIdx>`; each clone gets the key exported
/// through the strategy's environment variable. Sidecars are kept
/// once; the original main is replaced by the clones.
fn expand_strategy_containers(
    spec: &mut StepPodSpec,
    main_container: &JobContainer,
    strategy_key: Option<&StrategyKey>,
) -> Vec<String> {
    let Some(key) = strategy_key else {
        return vec![main_container.container.name.clone()];
    };
    let mut clones = Vec::new();
    let mut names = Vec::new();
    for (idx, value) in key.keys.iter().enumerate() {
        let mut clone = main_container.clone();
        clone.container.name = format!(
            "{}{}-{}",
            main_container.container.name, key.concurrent_idx, idx
        );
        clone.container.env.push(EnvVar {
            name: key.env.clone(),
            value: value.clone(),
        });
        names.push(clone.container.name.clone());
        clones.push(clone);
    }
    let mut containers: Vec<JobContainer> = spec
        .containers
        .iter()
        .filter(|c| c.container.name != main_container.container.name)
        .cloned()
        .collect();
    containers.extend(clones);
    spec.containers = containers;
    names
}

fn pre_init_container(ctx: &BuildContext) -> Container {
    Container {
        name: PRE_INIT_CONTAINER_NAME.to_string(),
        image: ctx.pre_init_image(),
        command: vec!["echo".to_string()],
        args: vec!["-n".to_string(), "preinit".to_string()],
        volume_mounts: ctx.pre_init_volume_mounts(),
        image_pull_policy: ctx.pre_init_image_pull_policy(),
        ..Container::default()
    }
}

fn generate_name(base: &str) -> String {
    let base = if base.is_empty() {
        "podtest"
    } else {
        base.trim_end_matches('-')
    };
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &id[..8])
}

async fn mount_repositories(exec: &dyn JobExecutor, plan: &ContainerPlan) -> Result<(), Error> {
    for (repo_name, staging) in &plan.repo_archive_paths {
        let org = plan.repo_org_paths.get(repo_name).ok_or_else(|| {
            Error::Backend(format!(
                "no original mount path recorded for repository {}",
                repo_name
            ))
        })?;
        let cmd = shell_cmd(&[
            "rm",
            "-rf",
            org,
            "&&",
            "mkdir",
            "-p",
            org,
            "&&",
            "tar",
            "-zxvf",
            &format!("{}/repo.tar.gz", staging),
            "-C",
            org,
        ]);
        debug!("mount repository {} with '{}'", repo_name, cmd.join(" "));
        exec.prepare_command(&cmd).await.map_err(|e| {
            Error::Backend(format!("failed to mount repository {}: {}", repo_name, e))
        })?;
    }
    Ok(())
}

async fn mount_tokens(exec: &dyn JobExecutor, plan: &ContainerPlan) -> Result<(), Error> {
    for (token_name, staging) in &plan.token_paths {
        let org = plan.token_org_paths.get(token_name).ok_or_else(|| {
            Error::Backend(format!(
                "no original mount path recorded for token {}",
                token_name
            ))
        })?;
        let cmd = shell_cmd(&[
            "mkdir",
            "-p",
            &parent_dir(org),
            "&&",
            "cp",
            &format!("{}/token", staging),
            org,
        ]);
        debug!("mount token {} with '{}'", token_name, cmd.join(" "));
        exec.prepare_command(&cmd)
            .await
            .map_err(|e| Error::Backend(format!("failed to mount token {}: {}", token_name, e)))?;
    }
    Ok(())
}

async fn mount_artifacts(
    exec: &dyn JobExecutor,
    plan: &ContainerPlan,
    mgr: &ResourceManager,
    run_mode: RunMode,
) -> Result<(), Error> {
    if run_mode == RunMode::DryRun {
        return Ok(());
    }
    for (artifact_name, staging) in &plan.artifact_paths {
        let org = plan.artifact_org_paths.get(artifact_name).ok_or_else(|| {
            Error::Backend(format!(
                "no original mount path recorded for artifact {}",
                artifact_name
            ))
        })?;
        let local = mgr.artifact_path_by_name(artifact_name)?;
        let file = local
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cmd = shell_cmd(&[
            "mkdir",
            "-p",
            &parent_dir(org),
            "&&",
            "rm",
            "-rf",
            org,
            "&&",
            "cp",
            "-rf",
            &format!("{}/{}", staging, file),
            org,
        ]);
        debug!("mount artifact {} with '{}'", artifact_name, cmd.join(" "));
        exec.prepare_command(&cmd).await.map_err(|e| {
            Error::Backend(format!("failed to mount artifact {}: {}", artifact_name, e))
        })?;
    }
    Ok(())
}

async fn mount_log(exec: &dyn JobExecutor, plan: &ContainerPlan) -> Result<(), Error> {
    for org in &plan.log_org_paths {
        let cmd = shell_cmd(&[
            "mkdir",
            "-p",
            &parent_dir(org),
            "&&",
            "cp",
            LOG_MOUNT_FILE,
            org,
        ]);
        debug!("mount log with '{}'", cmd.join(" "));
        exec.prepare_command(&cmd)
            .await
            .map_err(|e| Error::Backend(format!("failed to mount log: {}", e)))?;
    }
    Ok(())
}

async fn mount_report(exec: &dyn JobExecutor, plan: &ContainerPlan) -> Result<(), Error> {
    for org in &plan.report_org_paths {
        let cmd = shell_cmd(&[
            "mkdir",
            "-p",
            &parent_dir(org),
            "&&",
            "cp",
            REPORT_MOUNT_FILE,
            org,
        ]);
        debug!("mount report with '{}'", cmd.join(" "));
        exec.prepare_command(&cmd)
            .await
            .map_err(|e| Error::Backend(format!("failed to mount report: {}", e)))?;
    }
    Ok(())
}

fn shell_cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn parent_dir(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.display().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

/// Per-container mount bookkeeping: which staged inputs the container
/// uses, where the user originally asked for them, and the pod-level
/// volumes backing the staging paths.
#[derive(Clone, Default)]
struct ContainerPlan {
    container: JobContainer,
    repo_archive_paths: BTreeMap<String, String>,
    repo_org_paths: BTreeMap<String, String>,
    token_paths: BTreeMap<String, String>,
    token_org_paths: BTreeMap<String, String>,
    artifact_paths: BTreeMap<String, String>,
    artifact_org_paths: BTreeMap<String, String>,
    log_org_paths: Vec<String>,
    report_org_paths: Vec<String>,
    volumes: BTreeMap<String, Volume>,
    pre_init_mounts: BTreeMap<String, VolumeMount>,
}

impl ContainerPlan {
    fn new(job_container: &JobContainer, volumes: &[TestJobVolume]) -> Self {
        let volume_by_name: HashMap<&str, &TestJobVolume> =
            volumes.iter().map(|v| (v.name.as_str(), v)).collect();

        let mut container = job_container.clone();
        let mut repo_archive_paths = BTreeMap::new();
        let mut repo_org_paths = BTreeMap::new();
        let mut token_paths = BTreeMap::new();
        let mut token_org_paths = BTreeMap::new();
        let mut artifact_paths = BTreeMap::new();
        let mut artifact_org_paths = BTreeMap::new();
        let mut log_org_paths = Vec::new();
        let mut report_org_paths = Vec::new();
        let mut pod_volumes = BTreeMap::new();
        let mut pre_init_mounts = BTreeMap::new();

        for mount in container.container.volume_mounts.iter_mut() {
            let Some(volume) = volume_by_name.get(mount.name.as_str()) else {
                continue;
            };
            match &volume.source {
                TestJobVolumeSource::Repo { name } => {
                    let staging = format!("{}/{}", REPO_ARCHIVE_DIR, volume.name);
                    let org = mount.mount_path.clone();
                    repo_archive_paths.insert(name.clone(), staging.clone());
                    repo_org_paths.insert(name.clone(), org.clone());
                    mount.mount_path = staging.clone();
                    mount.original_mount_path = Some(org);
                    pod_volumes.insert(volume.name.clone(), empty_dir(&volume.name));
                    pre_init_mounts.insert(
                        volume.name.clone(),
                        VolumeMount {
                            name: volume.name.clone(),
                            mount_path: staging,
                            original_mount_path: None,
                        },
                    );
                }
                TestJobVolumeSource::Token { name } => {
                    let staging = format!("{}/{}", TOKEN_DIR, volume.name);
                    let org = mount.mount_path.clone();
                    token_paths.insert(name.clone(), staging.clone());
                    token_org_paths.insert(name.clone(), org.clone());
                    mount.mount_path = staging.clone();
                    mount.original_mount_path = Some(org);
                    pod_volumes.insert(volume.name.clone(), empty_dir(&volume.name));
                    pre_init_mounts.insert(
                        volume.name.clone(),
                        VolumeMount {
                            name: volume.name.clone(),
                            mount_path: staging,
                            original_mount_path: None,
                        },
                    );
                }
                TestJobVolumeSource::Artifact { name } => {
                    let staging = format!("{}/{}", ARTIFACT_ARCHIVE_DIR, volume.name);
                    let org = mount.mount_path.clone();
                    artifact_paths.insert(name.clone(), staging.clone());
                    artifact_org_paths.insert(name.clone(), org.clone());
                    mount.mount_path = staging.clone();
                    mount.original_mount_path = Some(org);
                    pod_volumes.insert(volume.name.clone(), empty_dir(&volume.name));
                    pre_init_mounts.insert(
                        volume.name.clone(),
                        VolumeMount {
                            name: volume.name.clone(),
                            mount_path: staging,
                            original_mount_path: None,
                        },
                    );
                }
                TestJobVolumeSource::Log {} => {
                    let org = mount.mount_path.clone();
                    log_org_paths.push(org.clone());
                    mount.mount_path = LOG_MOUNT_PATH.to_string();
                    mount.original_mount_path = Some(org);
                    pod_volumes.insert(volume.name.clone(), empty_dir(&volume.name));
                    pre_init_mounts.insert(
                        volume.name.clone(),
                        VolumeMount {
                            name: volume.name.clone(),
                            mount_path: LOG_MOUNT_PATH.to_string(),
                            original_mount_path: None,
                        },
                    );
                }
                TestJobVolumeSource::Report {} => {
                    let org = mount.mount_path.clone();
                    report_org_paths.push(org.clone());
                    mount.mount_path = REPORT_MOUNT_PATH.to_string();
                    mount.original_mount_path = Some(org);
                    pod_volumes.insert(volume.name.clone(), empty_dir(&volume.name));
                    pre_init_mounts.insert(
                        volume.name.clone(),
                        VolumeMount {
                            name: volume.name.clone(),
                            mount_path: REPORT_MOUNT_PATH.to_string(),
                            original_mount_path: None,
                        },
                    );
                }
                TestJobVolumeSource::Raw(source) => {
                    pod_volumes.insert(
                        volume.name.clone(),
                        Volume {
                            name: volume.name.clone(),
                            source: source.clone(),
                        },
                    );
                }
            }
        }

        Self {
            container,
            repo_archive_paths,
            repo_org_paths,
            token_paths,
            token_org_paths,
            artifact_paths,
            artifact_org_paths,
            log_org_paths,
            report_org_paths,
            volumes: pod_volumes,
            pre_init_mounts,
        }
    }

    fn has_staged_mounts(&self) -> bool {
        !self.pre_init_mounts.is_empty()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        source: VolumeSource::EmptyDir {},
    }
}

#[derive(Clone, Default)]
struct BuildContext {
    init: Vec<ContainerPlan>,
    mains: Vec<ContainerPlan>,
    finalizer: Option<ContainerPlan>,
}

impl BuildContext {
    fn new(spec: &StepPodSpec) -> Self {
        let init = spec
            .init_containers
            .iter()
            .map(|c| ContainerPlan::new(c, &spec.volumes))
            .collect();
        let mains = spec
            .containers
            .iter()
            .map(|c| ContainerPlan::new(c, &spec.volumes))
            .collect();
        let finalizer = spec
            .finalizer_container
            .as_ref()
            .map(|c| ContainerPlan::new(c, &spec.volumes));
        Self {
            init,
            mains,
            finalizer,
        }
    }

    fn plans(&self) -> impl Iterator<Item = &ContainerPlan> {
        self.init
            .iter()
            .chain(self.mains.iter())
            .chain(self.finalizer.iter())
    }

    fn plan_for(&self, name: &str, is_init: bool) -> Option<&ContainerPlan> {
        if is_init {
            return self
                .init
                .iter()
                .find(|p| p.container.container.name == name);
        }
        if let Some(finalizer) = &self.finalizer {
            if finalizer.container.container.name == name {
                return Some(finalizer);
            }
        }
        self.mains
            .iter()
            .find(|p| p.container.container.name == name)
    }

    fn needs_pre_init(&self) -> bool {
        self.plans().any(|p| p.has_staged_mounts())
    }

    /// Image for the pre-init container: the first user container that
    /// needs staged volumes, to keep the image pull set minimal.
    fn pre_init_image(&self) -> String {
        self.init
            .iter()
            .chain(self.mains.iter())
            .find(|p| p.has_staged_mounts())
            .map(|p| p.container.container.image.clone())
            .unwrap_or_default()
    }

    fn pre_init_image_pull_policy(&self) -> Option<String> {
        self.init
            .iter()
            .chain(self.mains.iter())
            .find(|p| p.has_staged_mounts())
            .and_then(|p| p.container.container.image_pull_policy.clone())
    }

    fn repo_names(&self) -> BTreeSet<String> {
        self.plans()
            .flat_map(|p| p.repo_archive_paths.keys().cloned())
            .collect()
    }

    fn token_names(&self) -> BTreeSet<String> {
        self.plans()
            .flat_map(|p| p.token_paths.keys().cloned())
            .collect()
    }

    fn artifact_names(&self) -> BTreeSet<String> {
        self.plans()
            .flat_map(|p| p.artifact_paths.keys().cloned())
            .collect()
    }

    fn repo_archive_path(&self, name: &str) -> Option<String> {
        self.plans()
            .find_map(|p| p.repo_archive_paths.get(name).cloned())
    }

    fn token_path(&self, name: &str) -> Option<String> {
        self.plans().find_map(|p| p.token_paths.get(name).cloned())
    }

    fn artifact_path(&self, name: &str) -> Option<String> {
        self.plans()
            .find_map(|p| p.artifact_paths.get(name).cloned())
    }

    fn uses_log_volume(&self) -> bool {
        self.plans().any(|p| !p.log_org_paths.is_empty())
    }

    fn uses_report_volume(&self) -> bool {
        self.plans().any(|p| !p.report_org_paths.is_empty())
    }

    fn pod_volumes(&self) -> Vec<Volume> {
        let mut merged: BTreeMap<String, Volume> = BTreeMap::new();
        for plan in self.plans() {
            for (name, volume) in &plan.volumes {
                merged.insert(name.clone(), volume.clone());
            }
        }
        merged.into_values().collect()
    }

    fn pre_init_volume_mounts(&self) -> Vec<VolumeMount> {
        let mut merged: BTreeMap<String, VolumeMount> = BTreeMap::new();
        for plan in self.plans() {
            for (name, mount) in &plan.pre_init_mounts {
                merged.insert(name.clone(), mount.clone());
            }
        }
        merged.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_volume() -> TestJobVolume {
        TestJobVolume {
            name: "repo-volume".to_string(),
            source: TestJobVolumeSource::Repo {
                name: "repo".to_string(),
            },
        }
    }

    fn container_with_mount(name: &str, volume: &str, path: &str) -> JobContainer {
        JobContainer {
            container: Container {
                name: name.to_string(),
                image: "alpine".to_string(),
                command: vec!["true".to_string()],
                volume_mounts: vec![VolumeMount {
                    name: volume.to_string(),
                    mount_path: path.to_string(),
                    original_mount_path: None,
                }],
                ..Container::default()
            },
            agent: None,
        }
    }

    #[test]
    fn repo_mount_is_rewritten_to_the_staging_path() {
        let plan = ContainerPlan::new(
            &container_with_mount("test", "repo-volume", "/work"),
            &[repo_volume()],
        );
        assert_eq!(
            plan.container.container.volume_mounts[0].mount_path,
            "/tmp/repo-archive/repo-volume"
        );
        assert_eq!(
            plan.container.container.volume_mounts[0].original_mount_path,
            Some("/work".to_string())
        );
        assert_eq!(plan.repo_org_paths.get("repo").unwrap(), "/work");
        assert_eq!(
            plan.repo_archive_paths.get("repo").unwrap(),
            "/tmp/repo-archive/repo-volume"
        );
        assert!(matches!(
            plan.volumes.get("repo-volume").unwrap().source,
            VolumeSource::EmptyDir {}
        ));
        assert!(plan.has_staged_mounts());
    }

    #[test]
    fn raw_volumes_pass_through_without_staging() {
        let plan = ContainerPlan::new(
            &container_with_mount("test", "data", "/data"),
            &[TestJobVolume {
                name: "data".to_string(),
                source: TestJobVolumeSource::Raw(VolumeSource::HostPath {
                    path: "/srv/data".to_string(),
                }),
            }],
        );
        assert_eq!(plan.container.container.volume_mounts[0].mount_path, "/data");
        assert!(!plan.has_staged_mounts());
        assert!(matches!(
            plan.volumes.get("data").unwrap().source,
            VolumeSource::HostPath { .. }
        ));
    }

    #[test]
    fn pre_init_image_comes_from_the_first_staged_container() {
        let mut spec = StepPodSpec {
            containers: vec![
                {
                    let mut c = container_with_mount("plain", "none", "/none");
                    c.container.volume_mounts.clear();
                    c.container.image = "other".to_string();
                    c
                },
                container_with_mount("test", "repo-volume", "/work"),
            ],
            volumes: vec![repo_volume()],
            ..StepPodSpec::default()
        };
        spec.main = "test".to_string();
        let ctx = BuildContext::new(&spec);
        assert!(ctx.needs_pre_init());
        assert_eq!(ctx.pre_init_image(), "alpine");
        assert_eq!(ctx.pre_init_volume_mounts().len(), 1);
    }

    #[test]
    fn no_staged_volumes_means_no_pre_init() {
        let spec = StepPodSpec {
            containers: vec![{
                let mut c = container_with_mount("test", "none", "/none");
                c.container.volume_mounts.clear();
                c
            }],
            ..StepPodSpec::default()
        };
        let ctx = BuildContext::new(&spec);
        assert!(!ctx.needs_pre_init());
    }

    #[test]
    fn strategy_expansion_clones_main_and_keeps_sidecars() {
        let mut spec = StepPodSpec {
            main: "test".to_string(),
            containers: vec![
                container_with_mount("test", "repo-volume", "/work"),
                {
                    let mut c = container_with_mount("sidecar", "none", "/none");
                    c.container.volume_mounts.clear();
                    c
                },
            ],
            volumes: vec![repo_volume()],
            ..StepPodSpec::default()
        };
        let main = spec.main_container().unwrap().clone();
        let key = StrategyKey {
            concurrent_idx: 1,
            keys: vec!["A".to_string(), "B".to_string()],
            env: "TEST".to_string(),
            subtask_scheduler: Arc::new(crate::scheduler::SubTaskScheduler::new(0)),
            on_finish: Arc::new(|| {}),
        };
        let names = expand_strategy_containers(&mut spec, &main, Some(&key));
        assert_eq!(names, vec!["test1-0", "test1-1"]);
        let container_names: Vec<_> = spec
            .containers
            .iter()
            .map(|c| c.container.name.as_str())
            .collect();
        assert_eq!(container_names, vec!["sidecar", "test1-0", "test1-1"]);
        let clone = &spec.containers[1];
        let env = clone.container.env.last().unwrap();
        assert_eq!(env.name, "TEST");
        assert_eq!(env.value, "A");
    }
}
