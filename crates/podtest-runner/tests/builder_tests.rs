use podtest_core::error::Error;
use podtest_core::executor::RunMode;
use podtest_core::job::{
    JobContainer, JobMeta, RepositorySpec, StepPodSpec, StepTemplate, TestJobVolume,
    TestJobVolumeSource,
};
use podtest_core::logger::JobLogger;
use podtest_core::pod::{Container, VolumeMount, VolumeSource};
use podtest_core::resource::{RepositoryCloner, ResourceManager};
use podtest_runner::builder::{JOB_LABEL, STRATEGY_KEYS_ANNOTATION};
use podtest_runner::{JobBuilder, TaskBuilder, TaskPhase, TaskScheduler};
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct FakeCloner;

#[async_trait::async_trait]
impl RepositoryCloner for FakeCloner {
    async fn clone_archive(
        &self,
        repo: &RepositorySpec,
        dst_dir: &Path,
    ) -> Result<PathBuf, Error> {
        let path = dst_dir.join(format!("{}.tar.gz", repo.name));
        std::fs::write(&path, b"archive")?;
        Ok(path)
    }
}

fn repo_spec() -> RepositorySpec {
    RepositorySpec {
        name: "repo".to_string(),
        url: "https://example.com/repo.git".to_string(),
        branch: None,
        merge_base: None,
    }
}

fn repo_volume() -> TestJobVolume {
    TestJobVolume {
        name: "repo-volume".to_string(),
        source: TestJobVolumeSource::Repo {
            name: "repo".to_string(),
        },
    }
}

fn template_with_repo() -> StepTemplate {
    StepTemplate {
        metadata: JobMeta {
            name: "test".to_string(),
            ..JobMeta::default()
        },
        spec: StepPodSpec {
            containers: vec![JobContainer {
                container: Container {
                    name: "test".to_string(),
                    image: "alpine".to_string(),
                    command: vec!["echo".to_string()],
                    args: vec!["hello".to_string()],
                    working_dir: "/work".to_string(),
                    volume_mounts: vec![VolumeMount {
                        name: "repo-volume".to_string(),
                        mount_path: "/work".to_string(),
                        original_mount_path: None,
                    }],
                    ..Container::default()
                },
                agent: None,
            }],
            volumes: vec![repo_volume()],
            ..StepPodSpec::default()
        },
    }
}

async fn dry_run_builder() -> TaskBuilder {
    let mgr = Arc::new(ResourceManager::new().unwrap());
    let logger = JobLogger::new();
    mgr.prepare(&[repo_spec()], &[], &FakeCloner, &logger)
        .await
        .unwrap();
    TaskBuilder::new(
        JobBuilder::new(RunMode::DryRun, "default", None),
        mgr,
        logger,
    )
}

#[tokio::test]
async fn repo_mounts_are_staged_and_pod_is_labelled() {
    let builder = dry_run_builder().await;
    let task = builder.build("test", &template_with_repo()).await.unwrap();
    let pod = task.pod();

    assert!(pod.name.starts_with("test-"));
    assert_eq!(pod.namespace, "default");
    assert_eq!(pod.labels.get(JOB_LABEL).unwrap(), "true");

    let container = &pod.spec.containers[0];
    assert_eq!(
        container.volume_mounts[0].mount_path,
        "/tmp/repo-archive/repo-volume"
    );
    assert_eq!(
        container.volume_mounts[0].original_mount_path,
        Some("/work".to_string())
    );
    let volume = pod
        .spec
        .volumes
        .iter()
        .find(|v| v.name == "repo-volume")
        .unwrap();
    assert!(matches!(volume.source, VolumeSource::EmptyDir {}));
    assert_eq!(task.phase(), TaskPhase::Built);
}

#[tokio::test]
async fn strategy_keys_expand_into_named_clones_per_pod() {
    let builder = dry_run_builder().await;
    let strategy = podtest_core::job::Strategy {
        key: podtest_core::job::StrategyKeySpec {
            env: "TEST".to_string(),
            source: podtest_core::job::StrategyKeySource {
                static_keys: vec!["A", "B", "C", "D", "E"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                dynamic: None,
            },
        },
        scheduler: podtest_core::job::SchedulerSpec {
            max_containers_per_pod: 2,
            max_concurrent_num_per_pod: 2,
        },
        retest: false,
    };
    let scheduler = TaskScheduler::new(Some(&strategy), &builder, JobLogger::new());
    let group = scheduler
        .schedule("test", &template_with_repo())
        .await
        .unwrap();

    assert_eq!(group.len(), 3);
    let expected_names = [
        vec!["test0-0", "test0-1"],
        vec!["test1-0", "test1-1"],
        vec!["test2-0"],
    ];
    let expected_keys = [r#"["A","B"]"#, r#"["C","D"]"#, r#"["E"]"#];
    for (idx, task) in group.tasks().iter().enumerate() {
        let pod = task.pod();
        let names: Vec<_> = pod
            .spec
            .containers
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, expected_names[idx]);
        assert_eq!(
            pod.annotations.get(STRATEGY_KEYS_ANNOTATION).unwrap(),
            expected_keys[idx]
        );
        // every clone carries its own key in the strategy env var
        for container in &pod.spec.containers {
            assert!(container.env.iter().any(|e| e.name == "TEST"));
        }
    }
}

#[tokio::test]
async fn unknown_repo_reference_fails_the_build() {
    let mgr = Arc::new(ResourceManager::new().unwrap());
    let builder = TaskBuilder::new(
        JobBuilder::new(RunMode::DryRun, "default", None),
        mgr,
        JobLogger::new(),
    );
    let err = builder
        .build("test", &template_with_repo())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRepoName(name) if name == "repo"));
}

#[tokio::test]
async fn dry_run_task_finalizes_with_placeholder_output() {
    let builder = dry_run_builder().await;
    let task = builder.build("test", &template_with_repo()).await.unwrap();
    let phase = task.phase_handle();
    let result = task.run().await.unwrap();

    assert!(result.status().is_success());
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].out, b"( dry running ... )");
    assert_eq!(*phase.lock().unwrap(), TaskPhase::Finalized);
}
