use crate::scheduler::{OnFinishSubTask, StrategyKey, SubTaskScheduler};
use futures::FutureExt;
use podtest_core::error::Error;
use podtest_core::executor::{CopyArtifactFn, ExecutionHandler, ExecutorRef, Job};
use podtest_core::logger::JobLogger;
use podtest_core::pod::Pod;
use podtest_core::result::{SubTaskResult, SubTaskResultGroup, TaskResult, TaskResultStatus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const TERMINATION_LOG: &str = "podtest task is completed";

/// Pod-level lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Built,
    PreInitStaged,
    MainRunning,
    ArtifactCollecting,
    Finalized,
}

/// One pod attempt: the backend job plus everything needed to fan its
/// main containers out into sub-tasks.
pub struct Task {
    pub name: String,
    job: Box<dyn Job>,
    pod: Pod,
    strategy_key: Option<StrategyKey>,
    main_container_names: Vec<String>,
    finalizer_name: Option<String>,
    copy_artifact: CopyArtifactFn,
    logger: JobLogger,
    phase: Arc<Mutex<TaskPhase>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("main_container_names", &self.main_container_names)
            .field("finalizer_name", &self.finalizer_name)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        job: Box<dyn Job>,
        pod: Pod,
        strategy_key: Option<StrategyKey>,
        main_container_names: Vec<String>,
        finalizer_name: Option<String>,
        copy_artifact: CopyArtifactFn,
        logger: JobLogger,
        phase: Arc<Mutex<TaskPhase>>,
    ) -> Self {
        Self {
            name,
            job,
            pod,
            strategy_key,
            main_container_names,
            finalizer_name,
            copy_artifact,
            logger,
            phase,
        }
    }

    /// The pod this task will attempt, as rewritten by the builder.
    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    pub fn phase(&self) -> TaskPhase {
        *self.phase.lock().unwrap()
    }

    /// Handle for observing the phase after the task has been consumed
    /// by [`Task::run`].
    pub fn phase_handle(&self) -> Arc<Mutex<TaskPhase>> {
        self.phase.clone()
    }

    /// Run the pod attempt to completion.
    ///
    /// Sub-task errors never escape: they are folded into the returned
    /// results. A staging failure before any sub-task ran yields one
    /// synthetic failed result. Backend errors after the handler
    /// started are fatal and abort the whole run.
    pub async fn run(mut self) -> Result<TaskResult, Error> {
        let results = Arc::new(SubTaskResultGroup::default());
        let handler_started = Arc::new(AtomicBool::new(false));

        let scheduler = self
            .strategy_key
            .as_ref()
            .map(|k| k.subtask_scheduler.clone())
            .unwrap_or_else(|| Arc::new(SubTaskScheduler::new(0)));
        let key_env = self
            .strategy_key
            .as_ref()
            .map(|k| k.env.clone())
            .unwrap_or_default();
        let key_by_container: HashMap<String, String> = match &self.strategy_key {
            Some(key) => self
                .main_container_names
                .iter()
                .cloned()
                .zip(key.keys.iter().cloned())
                .collect(),
            None => HashMap::new(),
        };
        let on_finish = self.strategy_key.as_ref().map(|k| k.on_finish.clone());
        let main_names: HashSet<String> =
            self.main_container_names.iter().cloned().collect();
        let finalizer_name = self.finalizer_name.clone();
        let copy_artifact = self.copy_artifact.clone();
        let logger = self.logger.clone();
        let task_name = self.name.clone();
        let handler_results = results.clone();
        let handler_phase = self.phase.clone();
        let started_flag = handler_started.clone();

        let handler: ExecutionHandler = Box::new(move |execs: Vec<ExecutorRef>| {
            async move {
                started_flag.store(true, Ordering::SeqCst);
                *handler_phase.lock().unwrap() = TaskPhase::MainRunning;

                let mut mains = Vec::new();
                let mut finalizer_exec = None;
                let mut sidecars = Vec::new();
                for exec in execs {
                    let container_name = exec.container().name.clone();
                    if main_names.contains(&container_name) {
                        mains.push(exec);
                    } else if finalizer_name.as_deref() == Some(container_name.as_str()) {
                        finalizer_exec = Some(exec);
                    } else {
                        sidecars.push(exec);
                    }
                }
                for sidecar in &sidecars {
                    sidecar.exec_async().await;
                }

                let mut subtasks = Vec::new();
                for exec in mains {
                    let container_name = exec.container().name.clone();
                    let name = key_by_container
                        .get(&container_name)
                        .cloned()
                        .unwrap_or_else(|| container_name.clone());
                    let mut subtask = SubTask::new(name, exec, true);
                    subtask.task_name = task_name.clone();
                    subtask.key_env_name = key_env.clone();
                    subtask.copy_artifact = copy_artifact.clone();
                    subtask.on_finish = on_finish.clone();
                    subtask.logger = logger.clone();
                    subtask.phase = Some(handler_phase.clone());
                    subtasks.push(subtask);
                }
                for group in scheduler.schedule(subtasks) {
                    group.run(&handler_results).await;
                }

                // The finalizer runs after every main sub-task, no
                // matter how they ended, and reports separately.
                if let Some(exec) = finalizer_exec {
                    let mut subtask =
                        SubTask::new(exec.container().name.clone(), exec, false);
                    subtask.task_name = task_name.clone();
                    subtask.copy_artifact = copy_artifact.clone();
                    subtask.logger = logger.clone();
                    handler_results.add(subtask.run().await);
                }

                for sidecar in &sidecars {
                    if let Err(e) = sidecar.stop().await {
                        debug!("failed to stop sidecar: {}", e);
                    }
                }
                Ok(())
            }
            .boxed()
        });

        match self.job.run_with_execution_handler(handler).await {
            Ok(()) => {}
            Err(err) if !handler_started.load(Ordering::SeqCst) => {
                warn!("failed to stage pod for task {}: {}", self.name, err);
                results.add(SubTaskResult::staging_failure(&self.name, err));
                *self.phase.lock().unwrap() = TaskPhase::Finalized;
                return Ok(TaskResult {
                    name: self.name,
                    results: results.take_results(),
                });
            }
            Err(err) => {
                *self.phase.lock().unwrap() = TaskPhase::Finalized;
                return Err(err);
            }
        }

        *self.phase.lock().unwrap() = TaskPhase::Finalized;
        Ok(TaskResult {
            name: self.name,
            results: results.take_results(),
        })
    }
}

/// Tasks of one step, run concurrently. The first fatal error aborts
/// the aggregation.
pub struct TaskGroup {
    tasks: Vec<Task>,
}

impl TaskGroup {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub async fn run(self) -> Result<Vec<TaskResult>, Error> {
        let mut set = JoinSet::new();
        for task in self.tasks {
            set.spawn(task.run());
        }
        let mut results = Vec::new();
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(Error::Backend(format!("task panicked: {}", err)));
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        Ok(results)
    }
}

/// One container command execution inside a task.
pub struct SubTask {
    pub name: String,
    pub(crate) task_name: String,
    pub(crate) key_env_name: String,
    pub(crate) exec: ExecutorRef,
    pub(crate) is_main: bool,
    pub(crate) on_finish: Option<OnFinishSubTask>,
    pub(crate) copy_artifact: CopyArtifactFn,
    pub(crate) logger: JobLogger,
    pub(crate) phase: Option<Arc<Mutex<TaskPhase>>>,
}

impl SubTask {
    pub fn new(name: impl Into<String>, exec: ExecutorRef, is_main: bool) -> Self {
        let copy_artifact: CopyArtifactFn = Arc::new(|_exec: ExecutorRef, _is_main: bool| {
            futures::future::ready(Ok(())).boxed()
        });
        Self {
            name: name.into(),
            task_name: String::new(),
            key_env_name: String::new(),
            exec,
            is_main,
            on_finish: None,
            copy_artifact,
            logger: JobLogger::new(),
            phase: None,
        }
    }

    pub async fn run(self) -> SubTaskResult {
        let start = Instant::now();
        let output = self.exec.output().await;
        let elapsed = start.elapsed();

        let (out, err, status) = match output {
            Ok(out) => (out, None, TaskResultStatus::Success),
            Err(Error::CommandFailed { exit_code, output }) => {
                let out = output.clone();
                (
                    out,
                    Some(Error::CommandFailed { exit_code, output }),
                    TaskResultStatus::Failure,
                )
            }
            Err(err) => (Vec::new(), Some(err), TaskResultStatus::Failure),
        };

        let mut result = SubTaskResult {
            status,
            elapsed,
            out,
            err,
            artifact_err: None,
            name: self.name.clone(),
            container: self.exec.container().clone(),
            pod: self.exec.pod().clone(),
            key_env_name: self.key_env_name.clone(),
            is_main: self.is_main,
        };

        debug!("container: {}", result.container.name);
        self.logger.log(&result.command());
        self.logger.log(&String::from_utf8_lossy(&result.out));
        if let Some(err) = &result.err {
            if !matches!(err, Error::CommandFailed { .. }) {
                self.logger.log(&err.to_string());
            }
        }
        if self.task_name.is_empty() {
            self.logger
                .log(&format!("elapsed time: {:.2} sec.", elapsed.as_secs_f64()));
        } else {
            self.logger.log(&format!(
                "{}: elapsed time: {:.2} sec.",
                self.task_name,
                elapsed.as_secs_f64()
            ));
        }

        if let Some(phase) = &self.phase {
            *phase.lock().unwrap() = TaskPhase::ArtifactCollecting;
        }
        if let Err(err) = (self.copy_artifact)(self.exec.clone(), self.is_main).await {
            self.logger.log(&format!("failed to copy artifact: {}", err));
            result.status = TaskResultStatus::Failure;
            result.artifact_err = Some(err);
        }

        if let Err(err) = self.exec.termination_log(TERMINATION_LOG).await {
            warn!("failed to send termination log: {}", err);
        }
        if let Some(on_finish) = &self.on_finish {
            on_finish();
        }
        result
    }
}

/// Sub-tasks that run as one parallel fan-out. The group completes
/// when every child has reported; results append under the group's
/// mutex in completion order.
pub struct SubTaskGroup {
    tasks: Vec<SubTask>,
}

impl SubTaskGroup {
    pub fn new(tasks: Vec<SubTask>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn run(self, results: &SubTaskResultGroup) {
        let mut set = JoinSet::new();
        for task in self.tasks {
            set.spawn(task.run());
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.add(result),
                Err(err) => warn!("sub-task panicked: {}", err),
            }
        }
    }
}
