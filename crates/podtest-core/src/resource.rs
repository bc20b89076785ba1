use crate::error::Error;
use crate::job::{ArtifactSpec, RepositorySpec, TokenSource, TokenSpec};
use crate::logger::JobLogger;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

const LOG_FILE_NAME: &str = "podtest.log";

#[derive(Debug, Clone, Copy)]
pub enum ReportFormat {
    Json,
}

struct ArtifactEntry {
    spec: ArtifactSpec,
    containers: BTreeSet<String>,
}

/// Owns the controller-side staging tree for one run: repository
/// archives, issued tokens, per-container artifact directories, the
/// log file and the report file. Registrations happen during prepare
/// and while tasks are built; path lookups afterwards are read-only.
/// The whole tree is removed when the manager is dropped.
pub struct ResourceManager {
    root: TempDir,
    repos: RwLock<HashMap<String, PathBuf>>,
    tokens: RwLock<HashMap<String, PathBuf>>,
    artifacts: RwLock<HashMap<String, ArtifactEntry>>,
}

impl ResourceManager {
    pub fn new() -> Result<Self, Error> {
        let root = TempDir::new()?;
        std::fs::create_dir_all(root.path().join("log"))?;
        std::fs::create_dir_all(root.path().join("report"))?;
        // Both files are pre-init copy sources; they must exist even
        // before anything is written to them.
        std::fs::write(root.path().join("log").join(LOG_FILE_NAME), b"")?;
        std::fs::write(root.path().join("report").join("report.json"), b"")?;
        Ok(Self {
            root,
            repos: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            artifacts: RwLock::new(HashMap::new()),
        })
    }

    pub fn root_path(&self) -> &Path {
        self.root.path()
    }

    /// Clone every repository and issue every token. Token values are
    /// registered as masks before anything else can log them.
    pub async fn prepare(
        &self,
        repos: &[RepositorySpec],
        tokens: &[TokenSpec],
        cloner: &dyn RepositoryCloner,
        logger: &JobLogger,
    ) -> Result<(), Error> {
        let repo_dir = self.root.path().join("repo");
        std::fs::create_dir_all(&repo_dir)?;
        for repo in repos {
            info!("cloning repository {} from {}", repo.name, repo.url);
            let archive = cloner.clone_archive(repo, &repo_dir).await?;
            self.repos
                .write()
                .unwrap()
                .insert(repo.name.clone(), archive);
        }

        let token_dir = self.root.path().join("token");
        for token in tokens {
            info!("issuing token {}", token.name);
            let value = token.source.issue().await?;
            logger.add_mask(&value);
            let dir = token_dir.join(&token.name);
            std::fs::create_dir_all(&dir)?;
            let path = dir.join("token");
            std::fs::write(&path, value.as_bytes())?;
            self.tokens.write().unwrap().insert(token.name.clone(), path);
        }
        Ok(())
    }

    pub fn repository_path_by_name(&self, name: &str) -> Result<PathBuf, Error> {
        self.repos
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownRepoName(name.to_string()))
    }

    pub fn token_path_by_name(&self, name: &str) -> Result<PathBuf, Error> {
        self.tokens
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTokenName(name.to_string()))
    }

    /// Register artifact specs. Registering the same (name, container)
    /// twice is a no-op; a new container grows the per-artifact set.
    pub fn add_artifacts(&self, specs: &[ArtifactSpec]) {
        let mut artifacts = self.artifacts.write().unwrap();
        for spec in specs {
            let entry = artifacts
                .entry(spec.name.clone())
                .or_insert_with(|| ArtifactEntry {
                    spec: spec.clone(),
                    containers: BTreeSet::new(),
                });
            entry.containers.insert(spec.container.name.clone());
        }
    }

    /// Staged copy of the artifact as produced by its declaring
    /// container. This is what later tasks consume.
    pub fn artifact_path_by_name(&self, name: &str) -> Result<PathBuf, Error> {
        let artifacts = self.artifacts.read().unwrap();
        let entry = artifacts
            .get(name)
            .ok_or_else(|| Error::UnknownArtifactName(name.to_string()))?;
        let container = entry.spec.container.name.clone();
        let file = artifact_file_name(&entry.spec)?;
        drop(artifacts);
        let dir = self.artifact_dir(name, &container)?;
        Ok(dir.join(file))
    }

    /// Staging destination for one container's copy of the artifact.
    /// The directory is guaranteed to exist before the path returns.
    pub fn artifact_path_by_name_and_container_name(
        &self,
        name: &str,
        container: &str,
    ) -> Result<PathBuf, Error> {
        let mut artifacts = self.artifacts.write().unwrap();
        let entry = artifacts
            .get_mut(name)
            .ok_or_else(|| Error::UnknownArtifactName(name.to_string()))?;
        entry.containers.insert(container.to_string());
        let file = artifact_file_name(&entry.spec)?;
        drop(artifacts);
        let dir = self.artifact_dir(name, container)?;
        Ok(dir.join(file))
    }

    /// Root of the per-container staging copies for one artifact,
    /// used when exporting to the host.
    pub fn artifact_root(&self, name: &str) -> Result<PathBuf, Error> {
        if !self.artifacts.read().unwrap().contains_key(name) {
            return Err(Error::UnknownArtifactName(name.to_string()));
        }
        Ok(self.root.path().join("artifact").join(name))
    }

    /// Every container a staging path was handed out for.
    pub fn artifact_containers(&self, name: &str) -> Result<Vec<String>, Error> {
        self.artifacts
            .read()
            .unwrap()
            .get(name)
            .map(|entry| entry.containers.iter().cloned().collect())
            .ok_or_else(|| Error::UnknownArtifactName(name.to_string()))
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.path().join("log").join(LOG_FILE_NAME)
    }

    pub fn report_path(&self, format: ReportFormat) -> PathBuf {
        match format {
            ReportFormat::Json => self.root.path().join("report").join("report.json"),
        }
    }

    fn artifact_dir(&self, name: &str, container: &str) -> Result<PathBuf, Error> {
        let dir = self.root.path().join("artifact").join(name).join(container);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn artifact_file_name(spec: &ArtifactSpec) -> Result<String, Error> {
    Path::new(&spec.container.path)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::Backend(format!(
                "artifact path {} has no file name",
                spec.container.path
            ))
        })
}

/// Materializes a repository spec into a `.tar.gz` archive on the
/// controller. The concrete git client stays behind this seam.
#[async_trait::async_trait]
pub trait RepositoryCloner: Send + Sync {
    async fn clone_archive(
        &self,
        repo: &RepositorySpec,
        dst_dir: &Path,
    ) -> Result<PathBuf, Error>;
}

/// Default cloner driving the `git` and `tar` binaries.
pub struct GitCloner;

#[async_trait::async_trait]
impl RepositoryCloner for GitCloner {
    async fn clone_archive(
        &self,
        repo: &RepositorySpec,
        dst_dir: &Path,
    ) -> Result<PathBuf, Error> {
        let checkout = dst_dir.join(format!("{}.src", repo.name));
        let checkout_str = checkout.to_string_lossy().into_owned();

        let mut args = vec!["clone".to_string()];
        if let Some(branch) = &repo.branch {
            args.push("--branch".to_string());
            args.push(branch.clone());
        }
        args.push(repo.url.clone());
        args.push(checkout_str.clone());
        run_cmd("git", &args).await?;

        if let Some(base) = &repo.merge_base {
            run_cmd(
                "git",
                &[
                    "-C".to_string(),
                    checkout_str.clone(),
                    "fetch".to_string(),
                    "origin".to_string(),
                    base.clone(),
                ],
            )
            .await?;
            run_cmd(
                "git",
                &[
                    "-C".to_string(),
                    checkout_str.clone(),
                    "-c".to_string(),
                    "user.name=podtest".to_string(),
                    "-c".to_string(),
                    "user.email=podtest@localhost".to_string(),
                    "merge".to_string(),
                    "--no-edit".to_string(),
                    "FETCH_HEAD".to_string(),
                ],
            )
            .await?;
        }

        let archive = dst_dir.join(format!("{}.tar.gz", repo.name));
        run_cmd(
            "tar",
            &[
                "-czf".to_string(),
                archive.to_string_lossy().into_owned(),
                "-C".to_string(),
                checkout_str,
                ".".to_string(),
            ],
        )
        .await?;
        Ok(archive)
    }
}

async fn run_cmd(bin: &str, args: &[String]) -> Result<(), Error> {
    debug!("running: {} {}", bin, args.join(" "));
    let output = Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Clone(format!("failed to run {}: {}", bin, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Clone(format!(
            "{} {} failed: {}",
            bin,
            args.first().map(String::as_str).unwrap_or(""),
            stderr.trim()
        )));
    }
    Ok(())
}

impl TokenSource {
    /// Resolve the source to its secret value.
    pub async fn issue(&self) -> Result<String, Error> {
        match self {
            TokenSource::File { path } => tokio::fs::read_to_string(path)
                .await
                .map(|s| s.trim().to_string())
                .map_err(|e| {
                    Error::Token(format!("failed to read {}: {}", path.display(), e))
                }),
            TokenSource::Env { name } => std::env::var(name)
                .map(|s| s.trim().to_string())
                .map_err(|_| Error::Token(format!("environment variable {} is not set", name))),
            TokenSource::Command { command } => {
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .output()
                    .await
                    .map_err(|e| Error::Token(format!("failed to run token command: {}", e)))?;
                if !output.status.success() {
                    return Err(Error::Token(format!(
                        "token command failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ArtifactContainer;

    fn artifact(name: &str, container: &str, path: &str) -> ArtifactSpec {
        ArtifactSpec {
            name: name.to_string(),
            container: ArtifactContainer {
                name: container.to_string(),
                path: path.to_string(),
            },
        }
    }

    #[test]
    fn unknown_names_fail_lookup() {
        let mgr = ResourceManager::new().unwrap();
        assert!(matches!(
            mgr.repository_path_by_name("nope"),
            Err(Error::UnknownRepoName(_))
        ));
        assert!(matches!(
            mgr.token_path_by_name("nope"),
            Err(Error::UnknownTokenName(_))
        ));
        assert!(matches!(
            mgr.artifact_path_by_name("nope"),
            Err(Error::UnknownArtifactName(_))
        ));
    }

    #[test]
    fn artifact_registration_is_idempotent() {
        let mgr = ResourceManager::new().unwrap();
        let spec = artifact("bin", "build", "/work/out.bin");
        mgr.add_artifacts(&[spec.clone()]);
        mgr.add_artifacts(&[spec]);
        let path = mgr.artifact_path_by_name("bin").unwrap();
        assert!(path.ends_with("artifact/bin/build/out.bin"));
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn second_container_grows_the_staging_set() {
        let mgr = ResourceManager::new().unwrap();
        mgr.add_artifacts(&[artifact("bin", "build", "/work/out.bin")]);
        let other = mgr
            .artifact_path_by_name_and_container_name("bin", "test0-1")
            .unwrap();
        assert!(other.ends_with("artifact/bin/test0-1/out.bin"));
        assert!(other.parent().unwrap().is_dir());
        assert_eq!(
            mgr.artifact_containers("bin").unwrap(),
            vec!["build", "test0-1"]
        );
        // the canonical consumption path still points at the declaring
        // container's copy
        let canonical = mgr.artifact_path_by_name("bin").unwrap();
        assert!(canonical.ends_with("artifact/bin/build/out.bin"));
    }

    #[tokio::test]
    async fn tokens_are_issued_and_masked() {
        std::env::set_var("PODTEST_RESOURCE_TEST_TOKEN", "tok-value");
        let mgr = ResourceManager::new().unwrap();
        let logger = JobLogger::new();
        mgr.prepare(
            &[],
            &[TokenSpec {
                name: "t".to_string(),
                source: TokenSource::Env {
                    name: "PODTEST_RESOURCE_TEST_TOKEN".to_string(),
                },
            }],
            &GitCloner,
            &logger,
        )
        .await
        .unwrap();
        let path = mgr.token_path_by_name("t").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "tok-value");
        assert_eq!(logger.filter("say tok-value"), "say *********");
    }
}
