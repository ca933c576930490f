//! 跨节点二进制编解码
//!
//! 线格式: `[version u8][manifest u8][MessagePack负载]`。
//! 负载使用字段名编码（map形式），新增字段配合 `#[serde(default)]`
//! 即可向前兼容；字段顺序无关。
//!
//! 本地消息编码直接失败，未知manifest解码直接失败，二者都不做降级。

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use jobflow_core::{SchedulerError, SchedulerResult};

use crate::entities::{JobRunInfo, JobStatus, RouteStrategy, WorkflowStatus};
use crate::messages::{ExecutorMessage, LoadSource, SchedulerMessage};

pub const WIRE_VERSION: u8 = 1;

// 调度器消息manifest
const TAG_REGISTER_JOB: u8 = 1;
const TAG_JOB_COMPLETED: u8 = 2;
const TAG_SPLIT_COMPLETED: u8 = 3;
const TAG_WORKFLOW_COMPLETED: u8 = 4;
const TAG_TIMER_FIRED: u8 = 5;
const TAG_START_SCAN: u8 = 6;
const TAG_BUCKET_ACQUIRED: u8 = 7;
const TAG_BUCKET_LOST: u8 = 8;
const TAG_RENEW_BUCKETS: u8 = 9;
const TAG_JOBS_LOADED: u8 = 10;
const TAG_JOBS_LOAD_FAILED: u8 = 11;

// 执行器消息manifest
const TAG_EXECUTE_JOB: u8 = 21;
const TAG_CANCEL_JOB: u8 = 22;
const TAG_QUERY_STATUS: u8 = 23;

#[derive(Serialize, Deserialize)]
struct RegisterJobPayload {
    run_id: i64,
    job_id: i64,
    trigger_time: i64,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    run: Option<JobRunInfo>,
}

#[derive(Serialize, Deserialize)]
struct JobCompletedPayload {
    run_id: i64,
    #[serde(default)]
    workflow_run_id: i64,
    status: JobStatus,
    #[serde(default)]
    message: String,
    #[serde(default)]
    worker_address: String,
}

#[derive(Serialize, Deserialize)]
struct SplitCompletedPayload {
    run_id: i64,
    split_start: i64,
    split_end: i64,
    status: JobStatus,
    #[serde(default)]
    message: String,
    #[serde(default)]
    worker_address: String,
}

#[derive(Serialize, Deserialize)]
struct WorkflowCompletedPayload {
    workflow_run_id: i64,
    status: WorkflowStatus,
    #[serde(default)]
    message: String,
}

#[derive(Serialize, Deserialize)]
struct BucketPayload {
    bucket_id: i32,
}

#[derive(Serialize, Deserialize)]
struct JobsLoadedPayload {
    runs: Vec<JobRunInfo>,
    new_max_id: i64,
    source: LoadSource,
}

#[derive(Serialize, Deserialize)]
struct JobsLoadFailedPayload {
    #[serde(default)]
    reason: String,
    source: LoadSource,
}

#[derive(Serialize, Deserialize)]
struct ExecuteJobPayload {
    run_id: i64,
    job_id: i64,
    #[serde(default)]
    workflow_run_id: i64,
    #[serde(default)]
    namespace_id: i64,
    job_name: String,
    job_type: String,
    #[serde(default)]
    params: String,
    #[serde(default)]
    route_strategy: RouteStrategy,
    timeout_seconds: i64,
    #[serde(default)]
    retry_count: i32,
    #[serde(default)]
    max_retry_times: i32,
    #[serde(default)]
    retry_interval_seconds: i64,
    #[serde(default)]
    priority: i32,
    trigger_time: i64,
    #[serde(default)]
    split_start: Option<i64>,
    #[serde(default)]
    split_end: Option<i64>,
    callback_address: String,
}

#[derive(Serialize, Deserialize)]
struct CancelJobPayload {
    run_id: i64,
    #[serde(default)]
    reason: String,
}

#[derive(Serialize, Deserialize)]
struct QueryStatusPayload {
    run_id: i64,
    callback_address: String,
}

fn frame<T: Serialize>(tag: u8, payload: &T) -> SchedulerResult<Vec<u8>> {
    let body = rmp_serde::to_vec_named(payload)
        .map_err(|e| SchedulerError::Serialization(format!("消息编码失败: {e}")))?;
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(WIRE_VERSION);
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

fn unframe(bytes: &[u8]) -> SchedulerResult<(u8, &[u8])> {
    if bytes.len() < 2 {
        return Err(SchedulerError::protocol("消息帧过短，缺少版本或manifest"));
    }
    if bytes[0] != WIRE_VERSION {
        return Err(SchedulerError::protocol(format!(
            "不支持的协议版本: {}，当前版本: {WIRE_VERSION}",
            bytes[0]
        )));
    }
    Ok((bytes[1], &bytes[2..]))
}

fn payload<T: DeserializeOwned>(body: &[u8]) -> SchedulerResult<T> {
    rmp_serde::from_slice(body)
        .map_err(|e| SchedulerError::Serialization(format!("消息解码失败: {e}")))
}

/// 编码调度器消息，本地消息立即失败
pub fn encode_scheduler(message: &SchedulerMessage) -> SchedulerResult<Vec<u8>> {
    if message.is_local_only() {
        return Err(SchedulerError::protocol(format!(
            "本地消息不允许跨节点发送: {}",
            message.name()
        )));
    }
    match message {
        SchedulerMessage::RegisterJob {
            run_id,
            job_id,
            trigger_time,
            priority,
            run,
        } => frame(
            TAG_REGISTER_JOB,
            &RegisterJobPayload {
                run_id: *run_id,
                job_id: *job_id,
                trigger_time: *trigger_time,
                priority: *priority,
                run: run.clone(),
            },
        ),
        SchedulerMessage::JobCompleted {
            run_id,
            workflow_run_id,
            status,
            message,
            worker_address,
        } => frame(
            TAG_JOB_COMPLETED,
            &JobCompletedPayload {
                run_id: *run_id,
                workflow_run_id: *workflow_run_id,
                status: *status,
                message: message.clone(),
                worker_address: worker_address.clone(),
            },
        ),
        SchedulerMessage::SplitCompleted {
            run_id,
            split_start,
            split_end,
            status,
            message,
            worker_address,
        } => frame(
            TAG_SPLIT_COMPLETED,
            &SplitCompletedPayload {
                run_id: *run_id,
                split_start: *split_start,
                split_end: *split_end,
                status: *status,
                message: message.clone(),
                worker_address: worker_address.clone(),
            },
        ),
        SchedulerMessage::WorkflowCompleted {
            workflow_run_id,
            status,
            message,
        } => frame(
            TAG_WORKFLOW_COMPLETED,
            &WorkflowCompletedPayload {
                workflow_run_id: *workflow_run_id,
                status: *status,
                message: message.clone(),
            },
        ),
        SchedulerMessage::TimerFired => frame(TAG_TIMER_FIRED, &()),
        SchedulerMessage::StartScan => frame(TAG_START_SCAN, &()),
        SchedulerMessage::BucketAcquired { bucket_id } => frame(
            TAG_BUCKET_ACQUIRED,
            &BucketPayload {
                bucket_id: *bucket_id,
            },
        ),
        SchedulerMessage::BucketLost { bucket_id } => frame(
            TAG_BUCKET_LOST,
            &BucketPayload {
                bucket_id: *bucket_id,
            },
        ),
        SchedulerMessage::RenewBuckets => frame(TAG_RENEW_BUCKETS, &()),
        SchedulerMessage::JobsLoaded {
            runs,
            new_max_id,
            source,
        } => frame(
            TAG_JOBS_LOADED,
            &JobsLoadedPayload {
                runs: runs.clone(),
                new_max_id: *new_max_id,
                source: *source,
            },
        ),
        SchedulerMessage::JobsLoadFailed { reason, source } => frame(
            TAG_JOBS_LOAD_FAILED,
            &JobsLoadFailedPayload {
                reason: reason.clone(),
                source: *source,
            },
        ),
        // is_local_only 已经拦截，这里不可达
        other => Err(SchedulerError::protocol(format!(
            "本地消息不允许跨节点发送: {}",
            other.name()
        ))),
    }
}

pub fn decode_scheduler(bytes: &[u8]) -> SchedulerResult<SchedulerMessage> {
    let (tag, body) = unframe(bytes)?;
    match tag {
        TAG_REGISTER_JOB => {
            let p: RegisterJobPayload = payload(body)?;
            Ok(SchedulerMessage::RegisterJob {
                run_id: p.run_id,
                job_id: p.job_id,
                trigger_time: p.trigger_time,
                priority: p.priority,
                run: p.run,
            })
        }
        TAG_JOB_COMPLETED => {
            let p: JobCompletedPayload = payload(body)?;
            Ok(SchedulerMessage::JobCompleted {
                run_id: p.run_id,
                workflow_run_id: p.workflow_run_id,
                status: p.status,
                message: p.message,
                worker_address: p.worker_address,
            })
        }
        TAG_SPLIT_COMPLETED => {
            let p: SplitCompletedPayload = payload(body)?;
            Ok(SchedulerMessage::SplitCompleted {
                run_id: p.run_id,
                split_start: p.split_start,
                split_end: p.split_end,
                status: p.status,
                message: p.message,
                worker_address: p.worker_address,
            })
        }
        TAG_WORKFLOW_COMPLETED => {
            let p: WorkflowCompletedPayload = payload(body)?;
            Ok(SchedulerMessage::WorkflowCompleted {
                workflow_run_id: p.workflow_run_id,
                status: p.status,
                message: p.message,
            })
        }
        TAG_TIMER_FIRED => Ok(SchedulerMessage::TimerFired),
        TAG_START_SCAN => Ok(SchedulerMessage::StartScan),
        TAG_BUCKET_ACQUIRED => {
            let p: BucketPayload = payload(body)?;
            Ok(SchedulerMessage::BucketAcquired {
                bucket_id: p.bucket_id,
            })
        }
        TAG_BUCKET_LOST => {
            let p: BucketPayload = payload(body)?;
            Ok(SchedulerMessage::BucketLost {
                bucket_id: p.bucket_id,
            })
        }
        TAG_RENEW_BUCKETS => Ok(SchedulerMessage::RenewBuckets),
        TAG_JOBS_LOADED => {
            let p: JobsLoadedPayload = payload(body)?;
            Ok(SchedulerMessage::JobsLoaded {
                runs: p.runs,
                new_max_id: p.new_max_id,
                source: p.source,
            })
        }
        TAG_JOBS_LOAD_FAILED => {
            let p: JobsLoadFailedPayload = payload(body)?;
            Ok(SchedulerMessage::JobsLoadFailed {
                reason: p.reason,
                source: p.source,
            })
        }
        other => Err(SchedulerError::UnknownManifest(other)),
    }
}

/// 编码执行器消息，本地消息立即失败
pub fn encode_executor(message: &ExecutorMessage) -> SchedulerResult<Vec<u8>> {
    if message.is_local_only() {
        return Err(SchedulerError::protocol(format!(
            "本地消息不允许跨节点发送: {}",
            message.name()
        )));
    }
    match message {
        ExecutorMessage::ExecuteJob {
            run_id,
            job_id,
            workflow_run_id,
            namespace_id,
            job_name,
            job_type,
            params,
            route_strategy,
            timeout_seconds,
            retry_count,
            max_retry_times,
            retry_interval_seconds,
            priority,
            trigger_time,
            split_start,
            split_end,
            callback_address,
        } => frame(
            TAG_EXECUTE_JOB,
            &ExecuteJobPayload {
                run_id: *run_id,
                job_id: *job_id,
                workflow_run_id: *workflow_run_id,
                namespace_id: *namespace_id,
                job_name: job_name.clone(),
                job_type: job_type.clone(),
                params: params.clone(),
                route_strategy: *route_strategy,
                timeout_seconds: *timeout_seconds,
                retry_count: *retry_count,
                max_retry_times: *max_retry_times,
                retry_interval_seconds: *retry_interval_seconds,
                priority: *priority,
                trigger_time: *trigger_time,
                split_start: *split_start,
                split_end: *split_end,
                callback_address: callback_address.clone(),
            },
        ),
        ExecutorMessage::CancelJob { run_id, reason } => frame(
            TAG_CANCEL_JOB,
            &CancelJobPayload {
                run_id: *run_id,
                reason: reason.clone(),
            },
        ),
        ExecutorMessage::QueryStatus {
            run_id,
            callback_address,
        } => frame(
            TAG_QUERY_STATUS,
            &QueryStatusPayload {
                run_id: *run_id,
                callback_address: callback_address.clone(),
            },
        ),
        other => Err(SchedulerError::protocol(format!(
            "本地消息不允许跨节点发送: {}",
            other.name()
        ))),
    }
}

pub fn decode_executor(bytes: &[u8]) -> SchedulerResult<ExecutorMessage> {
    let (tag, body) = unframe(bytes)?;
    match tag {
        TAG_EXECUTE_JOB => {
            let p: ExecuteJobPayload = payload(body)?;
            Ok(ExecutorMessage::ExecuteJob {
                run_id: p.run_id,
                job_id: p.job_id,
                workflow_run_id: p.workflow_run_id,
                namespace_id: p.namespace_id,
                job_name: p.job_name,
                job_type: p.job_type,
                params: p.params,
                route_strategy: p.route_strategy,
                timeout_seconds: p.timeout_seconds,
                retry_count: p.retry_count,
                max_retry_times: p.max_retry_times,
                retry_interval_seconds: p.retry_interval_seconds,
                priority: p.priority,
                trigger_time: p.trigger_time,
                split_start: p.split_start,
                split_end: p.split_end,
                callback_address: p.callback_address,
            })
        }
        TAG_CANCEL_JOB => {
            let p: CancelJobPayload = payload(body)?;
            Ok(ExecutorMessage::CancelJob {
                run_id: p.run_id,
                reason: p.reason,
            })
        }
        TAG_QUERY_STATUS => {
            let p: QueryStatusPayload = payload(body)?;
            Ok(ExecutorMessage::QueryStatus {
                run_id: p.run_id,
                callback_address: p.callback_address,
            })
        }
        other => Err(SchedulerError::UnknownManifest(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{BlockStrategy, RouteStrategy};

    fn sample_run() -> JobRunInfo {
        JobRunInfo {
            run_id: 42,
            job_id: 7,
            workflow_run_id: 0,
            bucket_id: 3,
            namespace_id: 1,
            job_name: "nightly_sync".to_string(),
            job_type: "echo".to_string(),
            params: String::new(),
            route_strategy: RouteStrategy::First,
            block_strategy: BlockStrategy::Parallel,
            timeout_seconds: 60,
            max_retry_times: 2,
            retry_count: 0,
            retry_interval_seconds: 30,
            priority: 0,
            trigger_time: 1_700_000_000_000,
            status: JobStatus::Waiting,
            split_spec: None,
            worker_address: None,
            parent_run_ids: Vec::new(),
        }
    }

    #[test]
    fn execute_job_roundtrip_with_empty_optionals() {
        let msg = ExecutorMessage::ExecuteJob {
            run_id: 42,
            job_id: 7,
            workflow_run_id: 0,
            namespace_id: 3,
            job_name: "nightly_sync".to_string(),
            job_type: "echo".to_string(),
            params: String::new(),
            route_strategy: RouteStrategy::RoundRobin,
            timeout_seconds: 60,
            retry_count: 0,
            max_retry_times: 2,
            retry_interval_seconds: 30,
            priority: 0,
            trigger_time: 1_700_000_000_000,
            split_start: None,
            split_end: None,
            callback_address: "sched-a:18100".to_string(),
        };
        let bytes = encode_executor(&msg).unwrap();
        match decode_executor(&bytes).unwrap() {
            ExecutorMessage::ExecuteJob {
                run_id,
                namespace_id,
                params,
                route_strategy,
                retry_interval_seconds,
                split_start,
                split_end,
                callback_address,
                ..
            } => {
                assert_eq!(run_id, 42);
                assert_eq!(namespace_id, 3);
                assert_eq!(params, "");
                assert_eq!(route_strategy, RouteStrategy::RoundRobin);
                assert_eq!(retry_interval_seconds, 30);
                assert_eq!(split_start, None);
                assert_eq!(split_end, None);
                assert_eq!(callback_address, "sched-a:18100");
            }
            other => panic!("解码出错误的消息: {}", other.name()),
        }
    }

    #[test]
    fn jobs_loaded_roundtrip() {
        let msg = SchedulerMessage::JobsLoaded {
            runs: vec![sample_run()],
            new_max_id: 42,
            source: LoadSource::Bucket,
        };
        let bytes = encode_scheduler(&msg).unwrap();
        match decode_scheduler(&bytes).unwrap() {
            SchedulerMessage::JobsLoaded {
                runs,
                new_max_id,
                source,
            } => {
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].run_id, 42);
                assert_eq!(runs[0].status, JobStatus::Waiting);
                assert_eq!(new_max_id, 42);
                assert_eq!(source, LoadSource::Bucket);
            }
            other => panic!("解码出错误的消息: {}", other.name()),
        }
    }

    #[test]
    fn job_completed_roundtrip_preserves_empty_message() {
        let msg = SchedulerMessage::JobCompleted {
            run_id: 42,
            workflow_run_id: 9,
            status: JobStatus::Success,
            message: String::new(),
            worker_address: "w1:18200".to_string(),
        };
        let bytes = encode_scheduler(&msg).unwrap();
        match decode_scheduler(&bytes).unwrap() {
            SchedulerMessage::JobCompleted {
                run_id,
                workflow_run_id,
                status,
                message,
                worker_address,
            } => {
                assert_eq!(run_id, 42);
                assert_eq!(workflow_run_id, 9);
                assert_eq!(status, JobStatus::Success);
                assert_eq!(message, "");
                assert_eq!(worker_address, "w1:18200");
            }
            other => panic!("解码出错误的消息: {}", other.name()),
        }
    }

    #[test]
    fn local_only_scheduler_message_fails_fast() {
        let msg = SchedulerMessage::CancelJob {
            run_id: 1,
            reason: "手动取消".to_string(),
        };
        let err = encode_scheduler(&msg).unwrap_err();
        assert!(matches!(err, SchedulerError::Protocol(_)));
    }

    #[test]
    fn local_only_executor_message_fails_fast() {
        let err = encode_executor(&ExecutorMessage::ExecutionTimeout { run_id: 1 }).unwrap_err();
        assert!(matches!(err, SchedulerError::Protocol(_)));
    }

    #[test]
    fn unknown_manifest_is_rejected() {
        let bytes = vec![WIRE_VERSION, 200, 0x90];
        let err = decode_scheduler(&bytes).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownManifest(200)));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut bytes = encode_scheduler(&SchedulerMessage::TimerFired).unwrap();
        bytes[0] = 99;
        let err = decode_scheduler(&bytes).unwrap_err();
        assert!(matches!(err, SchedulerError::Protocol(_)));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let err = decode_executor(&[WIRE_VERSION]).unwrap_err();
        assert!(matches!(err, SchedulerError::Protocol(_)));
    }

    #[test]
    fn bucket_events_roundtrip() {
        let bytes = encode_scheduler(&SchedulerMessage::BucketLost { bucket_id: 17 }).unwrap();
        match decode_scheduler(&bytes).unwrap() {
            SchedulerMessage::BucketLost { bucket_id } => assert_eq!(bucket_id, 17),
            other => panic!("解码出错误的消息: {}", other.name()),
        }
    }
}
