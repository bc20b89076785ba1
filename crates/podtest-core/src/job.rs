use crate::error::Error;
use crate::pod::{Container, VolumeSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Name and namespace metadata travelling with a job or step template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Declarative description of one test job run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestJob {
    #[serde(default)]
    pub metadata: JobMeta,
    pub spec: TestJobSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestJobSpec {
    #[serde(default)]
    pub repos: Vec<RepositorySpec>,
    #[serde(default)]
    pub tokens: Vec<TokenSpec>,
    #[serde(default)]
    pub pre_steps: Vec<Step>,
    pub template: StepTemplate,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub export_artifacts: Vec<ExportArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub merge_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSpec {
    pub name: String,
    pub source: TokenSource,
}

/// Where a credential token comes from. Each source resolves to a
/// single secret string at prepare time; richer issuers plug in here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenSource {
    File { path: PathBuf },
    Env { name: String },
    Command { command: String },
}

/// A named step run before the main template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub template: StepTemplate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTemplate {
    #[serde(default)]
    pub metadata: JobMeta,
    pub spec: StepPodSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPodSpec {
    /// Name of the main container. May be omitted when the spec
    /// declares exactly one container.
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub init_containers: Vec<JobContainer>,
    #[serde(default)]
    pub containers: Vec<JobContainer>,
    #[serde(default)]
    pub finalizer_container: Option<JobContainer>,
    #[serde(default)]
    pub volumes: Vec<TestJobVolume>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
}

impl StepPodSpec {
    pub fn main_container(&self) -> Result<&JobContainer, Error> {
        if self.main.is_empty() {
            if self.containers.len() == 1 {
                return Ok(&self.containers[0]);
            }
            return Err(Error::MainContainerUnspecified);
        }
        self.containers
            .iter()
            .find(|c| c.container.name == self.main)
            .ok_or_else(|| Error::MainContainerNotFound(self.main.clone()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobContainer {
    #[serde(flatten)]
    pub container: Container,
    #[serde(default)]
    pub agent: Option<Agent>,
}

/// Helper binary baked into a user image that enables
/// directory-granular file transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub installed_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestJobVolume {
    pub name: String,
    #[serde(flatten)]
    pub source: TestJobVolumeSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestJobVolumeSource {
    Repo { name: String },
    Token { name: String },
    Artifact { name: String },
    Log {},
    Report {},
    Raw(VolumeSource),
}

/// A file or directory produced by a container and staged on the
/// controller under the artifact's name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    pub container: ArtifactContainer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactContainer {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub key: StrategyKeySpec,
    pub scheduler: SchedulerSpec,
    /// Rerun failed keys once, sequentially, replacing their results.
    #[serde(default)]
    pub retest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyKeySpec {
    /// Environment variable each expanded main container receives its
    /// key through.
    pub env: String,
    pub source: StrategyKeySource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyKeySource {
    #[serde(default, rename = "static")]
    pub static_keys: Vec<String>,
    #[serde(default)]
    pub dynamic: Option<DynamicKeySource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicKeySource {
    pub template: StepTemplate,
    #[serde(default)]
    pub delim: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSpec {
    /// Upper bound on expanded main containers per pod.
    #[serde(default)]
    pub max_containers_per_pod: usize,
    /// Upper bound on concurrently running sub-tasks per pod.
    /// Zero means uncapped.
    #[serde(default)]
    pub max_concurrent_num_per_pod: usize,
}

impl TestJob {
    /// Reject jobs that cannot be scheduled before any resource is
    /// acquired. Unknown artifact names referenced by volumes are
    /// checked against every artifact declared anywhere in the job.
    pub fn validate(&self) -> Result<(), Error> {
        let repo_names: BTreeSet<&str> =
            self.spec.repos.iter().map(|r| r.name.as_str()).collect();
        let token_names: BTreeSet<&str> =
            self.spec.tokens.iter().map(|t| t.name.as_str()).collect();

        let mut templates: Vec<&StepTemplate> = vec![&self.spec.template];
        templates.extend(self.spec.pre_steps.iter().map(|s| &s.template));
        if let Some(strategy) = &self.spec.strategy {
            if let Some(dynamic) = &strategy.key.source.dynamic {
                templates.push(&dynamic.template);
            }
        }

        let artifact_names: BTreeSet<&str> = templates
            .iter()
            .flat_map(|t| t.spec.artifacts.iter())
            .map(|a| a.name.as_str())
            .collect();

        for tmpl in &templates {
            let main = tmpl.spec.main_container()?;
            if main.container.name.is_empty() {
                return Err(Error::MainContainerUnspecified);
            }
            for volume in &tmpl.spec.volumes {
                match &volume.source {
                    TestJobVolumeSource::Repo { name } => {
                        if !repo_names.contains(name.as_str()) {
                            return Err(Error::UnknownRepoName(name.clone()));
                        }
                    }
                    TestJobVolumeSource::Token { name } => {
                        if !token_names.contains(name.as_str()) {
                            return Err(Error::UnknownTokenName(name.clone()));
                        }
                    }
                    TestJobVolumeSource::Artifact { name } => {
                        if !artifact_names.contains(name.as_str()) {
                            return Err(Error::UnknownArtifactName(name.clone()));
                        }
                    }
                    TestJobVolumeSource::Log {}
                    | TestJobVolumeSource::Report {}
                    | TestJobVolumeSource::Raw(_) => {}
                }
            }
        }

        if let Some(strategy) = &self.spec.strategy {
            if strategy.key.env.is_empty() {
                return Err(Error::InvalidStrategy(
                    "key.env must be specified".to_string(),
                ));
            }
            let source = &strategy.key.source;
            if source.static_keys.is_empty() && source.dynamic.is_none() {
                return Err(Error::InvalidStrategy(
                    "a static key list or a dynamic key source is required".to_string(),
                ));
            }
            if strategy.scheduler.max_containers_per_pod == 0 {
                return Err(Error::InvalidStrategy(
                    "scheduler.maxContainersPerPod must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_container_spec(name: &str) -> StepPodSpec {
        StepPodSpec {
            containers: vec![JobContainer {
                container: Container {
                    name: name.to_string(),
                    command: vec!["true".to_string()],
                    ..Container::default()
                },
                agent: None,
            }],
            ..StepPodSpec::default()
        }
    }

    #[test]
    fn single_container_is_implied_main() {
        let spec = single_container_spec("test");
        assert_eq!(spec.main_container().unwrap().container.name, "test");
    }

    #[test]
    fn unnamed_main_with_multiple_containers_is_rejected() {
        let mut spec = single_container_spec("a");
        spec.containers.push(JobContainer {
            container: Container {
                name: "b".to_string(),
                ..Container::default()
            },
            agent: None,
        });
        assert!(matches!(
            spec.main_container(),
            Err(Error::MainContainerUnspecified)
        ));
    }

    #[test]
    fn unknown_repo_volume_is_an_input_error() {
        let mut spec = single_container_spec("test");
        spec.volumes.push(TestJobVolume {
            name: "repo-volume".to_string(),
            source: TestJobVolumeSource::Repo {
                name: "missing".to_string(),
            },
        });
        let job = TestJob {
            metadata: JobMeta::default(),
            spec: TestJobSpec {
                template: StepTemplate {
                    metadata: JobMeta::default(),
                    spec,
                },
                ..TestJobSpec::default()
            },
        };
        let err = job.validate().unwrap_err();
        assert!(err.is_input_error());
        assert!(matches!(err, Error::UnknownRepoName(name) if name == "missing"));
    }

    #[test]
    fn strategy_without_key_source_is_rejected() {
        let job = TestJob {
            metadata: JobMeta::default(),
            spec: TestJobSpec {
                template: StepTemplate {
                    metadata: JobMeta::default(),
                    spec: single_container_spec("test"),
                },
                strategy: Some(Strategy {
                    key: StrategyKeySpec {
                        env: "TEST".to_string(),
                        source: StrategyKeySource::default(),
                    },
                    scheduler: SchedulerSpec {
                        max_containers_per_pod: 2,
                        max_concurrent_num_per_pod: 2,
                    },
                    retest: false,
                }),
                ..TestJobSpec::default()
            },
        };
        assert!(matches!(
            job.validate(),
            Err(Error::InvalidStrategy(_))
        ));
    }
}
