mod local_job;

pub use local_job::{LocalExecutor, LocalJob};
