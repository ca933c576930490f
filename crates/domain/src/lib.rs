pub mod codec;
pub mod dag;
pub mod entities;
pub mod memory;
pub mod messages;
pub mod repositories;

pub use entities::*;
pub use messages::{ExecutorMessage, LoadSource, RefreshOp, SchedulerMessage};
pub use repositories::*;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::entities::{BlockStrategy, JobRunInfo, JobStatus, RouteStrategy};

    pub fn sample_run(run_id: i64, workflow_run_id: i64) -> JobRunInfo {
        JobRunInfo {
            run_id,
            job_id: run_id,
            workflow_run_id,
            bucket_id: 0,
            namespace_id: 1,
            job_name: format!("job-{run_id}"),
            job_type: "echo".to_string(),
            params: String::new(),
            route_strategy: RouteStrategy::First,
            block_strategy: BlockStrategy::Parallel,
            timeout_seconds: 60,
            max_retry_times: 2,
            retry_count: 0,
            retry_interval_seconds: 0,
            priority: 0,
            trigger_time: 0,
            status: JobStatus::Waiting,
            split_spec: None,
            worker_address: None,
            parent_run_ids: Vec::new(),
        }
    }
}
