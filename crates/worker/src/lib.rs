//! 工作节点运行时：任务处理器注册与执行

pub mod executor;
pub mod handlers;

pub use executor::WorkerRuntime;
pub use handlers::{EchoHandler, HandlerRegistry, JobContext, JobHandler};
