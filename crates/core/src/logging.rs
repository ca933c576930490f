//! 日志初始化
//!
//! 日志级别优先使用 `RUST_LOG` 环境变量，其次使用命令行传入的级别。

use tracing_subscriber::EnvFilter;

use crate::errors::SchedulerError;
use crate::SchedulerResult;

pub fn init_logging(level: &str, format: &str) -> SchedulerResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| SchedulerError::Configuration(format!("无效的日志级别 {level}: {e}")))?;

    match format {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .try_init()
                .map_err(|e| SchedulerError::Configuration(format!("日志初始化失败: {e}")))?;
        }
        "pretty" | "text" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| SchedulerError::Configuration(format!("日志初始化失败: {e}")))?;
        }
        other => {
            return Err(SchedulerError::Configuration(format!(
                "不支持的日志格式: {other}，可选 json/pretty"
            )));
        }
    }

    Ok(())
}
