use crate::builder::TaskBuilder;
use crate::job::JobBuilder;
use crate::scheduler::TaskScheduler;
use chrono::Utc;
use podtest_core::error::Error;
use podtest_core::executor::RunMode;
use podtest_core::job::{ExportArtifact, TestJob};
use podtest_core::logger::JobLogger;
use podtest_core::resource::{GitCloner, ReportFormat, RepositoryCloner, ResourceManager};
use podtest_core::result::{RunResult, SubTaskResult, TaskResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Top-level driver for one test job: prepares repositories and
/// tokens, runs the pre-steps, schedules the main step and aggregates
/// the results into a masked report.
pub struct Runner {
    run_mode: RunMode,
    namespace: String,
    kubeconfig: Option<PathBuf>,
    logger: JobLogger,
    cloner: Arc<dyn RepositoryCloner>,
}

impl Runner {
    pub fn new(run_mode: RunMode) -> Self {
        Self {
            run_mode,
            namespace: "default".to_string(),
            kubeconfig: None,
            logger: JobLogger::new(),
            cloner: Arc::new(GitCloner),
        }
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    pub fn set_kubeconfig(&mut self, path: PathBuf) {
        self.kubeconfig = Some(path);
    }

    pub fn set_logger(&mut self, logger: JobLogger) {
        self.logger = logger;
    }

    pub fn set_cloner(&mut self, cloner: Arc<dyn RepositoryCloner>) {
        self.cloner = cloner;
    }

    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }

    /// Returns `Ok` with the aggregated result even when sub-tasks
    /// failed; only scheduler, builder and infrastructure errors are
    /// returned as `Err`.
    pub async fn run(&self, testjob: TestJob) -> Result<RunResult, Error> {
        testjob.validate()?;
        let started_at = Utc::now();
        let start = Instant::now();

        let mgr = Arc::new(ResourceManager::new()?);
        self.logger.set_log_file(&mgr.log_path())?;
        mgr.prepare(
            &testjob.spec.repos,
            &testjob.spec.tokens,
            self.cloner.as_ref(),
            &self.logger,
        )
        .await?;

        let namespace = if testjob.metadata.namespace.is_empty() {
            self.namespace.clone()
        } else {
            testjob.metadata.namespace.clone()
        };
        let builder = TaskBuilder::new(
            JobBuilder::new(self.run_mode, namespace, self.kubeconfig.clone()),
            mgr.clone(),
            self.logger.clone(),
        );

        let job_name = if testjob.metadata.name.is_empty() {
            "testjob".to_string()
        } else {
            testjob.metadata.name.clone()
        };
        let mut run_result = RunResult::new(job_name.clone(), started_at);

        for step in &testjob.spec.pre_steps {
            info!("running pre-step {}", step.name);
            let task = builder.build(&step.name, &step.template).await?;
            let result = task.run().await?;
            let failed = !result.status().is_success();
            run_result.push(result);
            if failed {
                warn!("pre-step {} failed; skipping the remaining steps", step.name);
                self.finish(&run_result, &mgr, start)?;
                return Ok(run_result);
            }
        }

        let scheduler = TaskScheduler::new(
            testjob.spec.strategy.as_ref(),
            &builder,
            self.logger.clone(),
        );
        let step_name = if testjob.spec.template.metadata.name.is_empty() {
            job_name.as_str()
        } else {
            testjob.spec.template.metadata.name.as_str()
        };
        let group = scheduler.schedule(step_name, &testjob.spec.template).await?;
        let mut results = group.run().await?;

        if let Some(strategy) = &testjob.spec.strategy {
            if strategy.retest {
                let failed_keys = failed_main_keys(&results);
                if !failed_keys.is_empty() {
                    self.logger.log(&format!(
                        "retesting {} failed keys sequentially",
                        failed_keys.len()
                    ));
                    let mut retest_strategy = strategy.clone();
                    retest_strategy.scheduler.max_concurrent_num_per_pod = 1;
                    let retest_group = scheduler
                        .schedule_with_keys(
                            step_name,
                            &testjob.spec.template,
                            &retest_strategy,
                            failed_keys,
                        )
                        .await?;
                    let retest_results = retest_group.run().await?;
                    merge_retest_results(&mut results, retest_results);
                }
            }
        }
        run_result.extend(results);

        self.export_artifacts(&testjob.spec.export_artifacts, &mgr)?;
        self.finish(&run_result, &mgr, start)?;
        Ok(run_result)
    }

    fn finish(
        &self,
        run_result: &RunResult,
        mgr: &ResourceManager,
        start: Instant,
    ) -> Result<(), Error> {
        let report = run_result.report(start.elapsed(), &self.logger);
        let json = serde_json::to_string(&report)?;
        std::fs::write(mgr.report_path(ReportFormat::Json), &json)?;
        self.logger.log(&json);
        Ok(())
    }

    /// Deposit per-container copies of each exported artifact under
    /// the configured host directory.
    fn export_artifacts(
        &self,
        exports: &[ExportArtifact],
        mgr: &ResourceManager,
    ) -> Result<(), Error> {
        if self.run_mode == RunMode::DryRun {
            return Ok(());
        }
        for export in exports {
            let root = mgr.artifact_root(&export.name)?;
            info!(
                "exporting artifact {} to {}",
                export.name,
                export.path.display()
            );
            for container in mgr.artifact_containers(&export.name)? {
                let staging = root.join(&container);
                if !staging.exists() {
                    continue;
                }
                copy_tree(&staging, &export.path.join(&container))?;
            }
        }
        Ok(())
    }
}

fn failed_main_keys(results: &[TaskResult]) -> Vec<String> {
    results
        .iter()
        .flat_map(|task| task.results.iter())
        .filter(|r| r.is_main && !r.status.is_success() && !r.key_env_name.is_empty())
        .map(|r| r.name.clone())
        .collect()
}

/// Replace failed main results with their rerun counterparts.
fn merge_retest_results(results: &mut [TaskResult], retest: Vec<TaskResult>) {
    let mut by_name: HashMap<String, SubTaskResult> = HashMap::new();
    for task in retest {
        for result in task.results {
            if result.is_main {
                by_name.insert(result.name.clone(), result);
            }
        }
    }
    for task in results.iter_mut() {
        for result in task.results.iter_mut() {
            if !result.is_main || result.status.is_success() {
                continue;
            }
            if let Some(replacement) = by_name.remove(&result.name) {
                *result = replacement;
            }
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;
    Ok(())
}
