use anyhow::Context;
use podtest_core::executor::RunMode;
use podtest_core::job::TestJob;
use podtest_runner::Runner;
use std::path::{Path, PathBuf};

const EXIT_SUCCESS: i32 = 0;
const EXIT_SUBTASK_FAILED: i32 = 1;
const EXIT_FATAL: i32 = 2;
const EXIT_INVALID_INPUT: i32 = 3;

pub async fn run(
    file: &Path,
    run_mode: RunMode,
    in_cluster: bool,
    config: Option<PathBuf>,
    namespace: String,
) -> i32 {
    let testjob = match load_job(file) {
        Ok(job) => job,
        Err(err) => {
            eprintln!("podtest: {:#}", err);
            return EXIT_INVALID_INPUT;
        }
    };

    let mut runner = Runner::new(run_mode);
    runner.set_namespace(namespace);
    if !in_cluster {
        if let Some(config) = config {
            runner.set_kubeconfig(config);
        }
    }

    match runner.run(testjob).await {
        Ok(result) if result.status().is_success() => EXIT_SUCCESS,
        Ok(_) => EXIT_SUBTASK_FAILED,
        Err(err) if err.is_input_error() => {
            eprintln!("podtest: {}", err);
            EXIT_INVALID_INPUT
        }
        Err(err) => {
            eprintln!("podtest: {}", err);
            EXIT_FATAL
        }
    }
}

fn load_job(file: &Path) -> anyhow::Result<TestJob> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("reading job file {}", file.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing job file {}", file.display()))
}
