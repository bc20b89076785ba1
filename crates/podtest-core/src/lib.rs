pub mod error;
pub mod executor;
pub mod job;
pub mod logger;
pub mod pod;
pub mod resource;
pub mod result;

pub use error::Error;
pub use executor::{ExecutorRef, Job, JobExecutor, RunMode};
pub use logger::JobLogger;
pub use resource::ResourceManager;
pub use result::{SubTaskResult, TaskResult, TaskResultStatus};
