mod cluster_job;

pub use cluster_job::{ClusterExecutor, ClusterJob};
