use crate::builder::TaskBuilder;
use crate::task::{SubTask, SubTaskGroup, TaskGroup};
use podtest_core::error::Error;
use podtest_core::job::{StepTemplate, Strategy, StrategyKeySource};
use podtest_core::logger::JobLogger;
use regex::Regex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

pub type OnFinishSubTask = Arc<dyn Fn() + Send + Sync>;

/// Expansion context for one pod of a strategy run.
#[derive(Clone)]
pub struct StrategyKey {
    pub concurrent_idx: usize,
    pub keys: Vec<String>,
    pub env: String,
    pub subtask_scheduler: Arc<SubTaskScheduler>,
    pub on_finish: OnFinishSubTask,
}

/// Groups a pod's sub-tasks so no more than the configured number run
/// concurrently. Groups run sequentially; a zero cap means one group.
pub struct SubTaskScheduler {
    max_concurrent_num_per_pod: usize,
}

impl SubTaskScheduler {
    pub fn new(max_concurrent_num_per_pod: usize) -> Self {
        Self {
            max_concurrent_num_per_pod,
        }
    }

    fn concurrent_num(&self, task_num: usize) -> usize {
        if self.max_concurrent_num_per_pod == 0 || self.max_concurrent_num_per_pod >= task_num {
            task_num
        } else {
            self.max_concurrent_num_per_pod
        }
    }

    pub fn schedule(&self, tasks: Vec<SubTask>) -> Vec<SubTaskGroup> {
        if tasks.is_empty() {
            return Vec::new();
        }
        let concurrent = self.concurrent_num(tasks.len());
        let mut groups = Vec::new();
        let mut remaining = tasks;
        while !remaining.is_empty() {
            let rest = remaining.split_off(concurrent.min(remaining.len()));
            groups.push(SubTaskGroup::new(remaining));
            remaining = rest;
        }
        groups
    }
}

/// Expands a strategy over its keys into a group of tasks, bounded by
/// the per-pod container cap.
pub struct TaskScheduler<'a> {
    strategy: Option<&'a Strategy>,
    builder: &'a TaskBuilder,
    logger: JobLogger,
}

impl<'a> TaskScheduler<'a> {
    pub fn new(
        strategy: Option<&'a Strategy>,
        builder: &'a TaskBuilder,
        logger: JobLogger,
    ) -> Self {
        Self {
            strategy,
            builder,
            logger,
        }
    }

    pub async fn schedule(&self, name: &str, tmpl: &StepTemplate) -> Result<TaskGroup, Error> {
        let Some(strategy) = self.strategy else {
            let task = self.builder.build(name, tmpl).await?;
            return Ok(TaskGroup::new(vec![task]));
        };
        let keys = self.schedule_keys(&strategy.key.source).await?;
        self.schedule_with_keys(name, tmpl, strategy, keys).await
    }

    /// Build one task per contiguous key slice. Exposed separately so
    /// failed keys can be rescheduled with an adjusted strategy.
    pub async fn schedule_with_keys(
        &self,
        name: &str,
        tmpl: &StepTemplate,
        strategy: &Strategy,
        keys: Vec<String>,
    ) -> Result<TaskGroup, Error> {
        if keys.is_empty() {
            return Ok(TaskGroup::new(Vec::new()));
        }
        let max_containers = strategy.scheduler.max_containers_per_pod;
        if max_containers == 0 {
            return Err(Error::InvalidStrategy(
                "scheduler.maxContainersPerPod must be positive".to_string(),
            ));
        }
        let subtask_scheduler = Arc::new(SubTaskScheduler::new(
            strategy.scheduler.max_concurrent_num_per_pod,
        ));

        let key_num = keys.len() as u32;
        let finished_key_num = Arc::new(AtomicU32::new(0));
        let logger = self.logger.clone();
        let on_finish: OnFinishSubTask = Arc::new(move || {
            let finished = finished_key_num.fetch_add(1, Ordering::SeqCst) + 1;
            logger.log(&format!(
                "{}/{} ({:.1}%) finished.",
                finished,
                key_num,
                (finished as f32 / key_num as f32) * 100.0
            ));
        });

        let mut tasks = Vec::new();
        for (idx, task_keys) in partition_keys(&keys, max_containers).into_iter().enumerate() {
            let task = self
                .builder
                .build_with_key(
                    name,
                    tmpl,
                    Some(StrategyKey {
                        concurrent_idx: idx,
                        keys: task_keys,
                        env: strategy.key.env.clone(),
                        subtask_scheduler: subtask_scheduler.clone(),
                        on_finish: on_finish.clone(),
                    }),
                )
                .await?;
            tasks.push(task);
        }
        Ok(TaskGroup::new(tasks))
    }

    async fn schedule_keys(&self, source: &StrategyKeySource) -> Result<Vec<String>, Error> {
        if !source.static_keys.is_empty() {
            info!(
                "found {} static keys to start distributed task",
                source.static_keys.len()
            );
            return Ok(source.static_keys.clone());
        }
        let Some(dynamic) = &source.dynamic else {
            return Err(Error::InvalidStrategy(
                "a static key list or a dynamic key source is required".to_string(),
            ));
        };

        let name = if dynamic.template.metadata.name.is_empty() {
            "key"
        } else {
            dynamic.template.metadata.name.as_str()
        };
        let task = self.builder.build(name, &dynamic.template).await?;
        let result = task.run().await?;
        let mains: Vec<_> = result.main_results().collect();
        if mains.is_empty() {
            return Err(Error::DynamicKeys(
                "failed to find a main result for the key step".to_string(),
            ));
        }
        if mains.len() > 1 {
            return Err(Error::DynamicKeys(
                "found multiple main results for the key step".to_string(),
            ));
        }
        let main = mains[0];
        if let Some(err) = &main.err {
            return Err(Error::DynamicKeys(format!("key step failed: {}", err)));
        }
        let out = String::from_utf8_lossy(&main.out);
        let keys = split_keys(&out, dynamic.delim.as_deref(), dynamic.filter.as_deref())?;
        info!(
            "found {} dynamic keys to start distributed task. elapsed time {:.2} sec",
            keys.len(),
            main.elapsed.as_secs_f64()
        );
        Ok(keys)
    }
}

/// Contiguous key slices of at most `max` entries. The trailing slice
/// is never empty.
pub fn partition_keys(keys: &[String], max: usize) -> Vec<Vec<String>> {
    keys.chunks(max).map(|chunk| chunk.to_vec()).collect()
}

/// Split a key step's stdout into keys: split on the delimiter, trim,
/// drop empties, apply the optional filter.
pub fn split_keys(
    out: &str,
    delim: Option<&str>,
    filter: Option<&str>,
) -> Result<Vec<String>, Error> {
    let delim = match delim {
        Some(d) if !d.is_empty() => d,
        _ => "\n",
    };
    let filter = match filter {
        Some(f) if !f.is_empty() => Some(
            Regex::new(f)
                .map_err(|e| Error::InvalidStrategy(format!("invalid key filter: {}", e)))?,
        ),
        _ => None,
    };
    Ok(out
        .split(delim)
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .filter(|key| filter.as_ref().map_or(true, |f| f.is_match(key)))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::DryRunExecutor;
    use podtest_core::pod::{Container, Pod};
    use std::sync::Arc;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key{}", i)).collect()
    }

    fn subtasks(n: usize) -> Vec<SubTask> {
        (0..n)
            .map(|i| {
                let exec = Arc::new(DryRunExecutor::new(
                    Container {
                        name: format!("c{}", i),
                        ..Container::default()
                    },
                    i,
                    Pod::default(),
                ));
                SubTask::new(format!("c{}", i), exec, true)
            })
            .collect()
    }

    #[test]
    fn keys_partition_into_contiguous_slices() {
        let parts = partition_keys(&keys(5), 2);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], vec!["key0", "key1"]);
        assert_eq!(parts[1], vec!["key2", "key3"]);
        assert_eq!(parts[2], vec!["key4"]);
    }

    #[test]
    fn exact_multiple_has_no_empty_trailing_slice() {
        let parts = partition_keys(&keys(4), 2);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn fewer_keys_than_cap_is_one_slice() {
        let parts = partition_keys(&keys(3), 10);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), 3);
    }

    #[test]
    fn zero_cap_schedules_one_group() {
        let scheduler = SubTaskScheduler::new(0);
        let groups = scheduler.schedule(subtasks(4));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 4);
    }

    #[test]
    fn cap_larger_than_tasks_schedules_one_group() {
        let scheduler = SubTaskScheduler::new(10);
        let groups = scheduler.schedule(subtasks(3));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn cap_chunks_groups_in_order() {
        let scheduler = SubTaskScheduler::new(2);
        let groups = scheduler.schedule(subtasks(5));
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
    }

    #[test]
    fn split_keys_trims_and_drops_empties() {
        let keys = split_keys("A\nB\n\n C \n", None, None).unwrap();
        assert_eq!(keys, vec!["A", "B", "C"]);
    }

    #[test]
    fn split_keys_honors_custom_delimiter() {
        let keys = split_keys("A,B,,C", Some(","), None).unwrap();
        assert_eq!(keys, vec!["A", "B", "C"]);
    }

    #[test]
    fn split_keys_applies_filter() {
        let keys = split_keys("TestFoo\nBenchBar\nTestBaz", None, Some("^Test")).unwrap();
        assert_eq!(keys, vec!["TestFoo", "TestBaz"]);
    }

    #[test]
    fn split_keys_rejects_bad_filter() {
        assert!(matches!(
            split_keys("A", None, Some("(")),
            Err(Error::InvalidStrategy(_))
        ));
    }
}
