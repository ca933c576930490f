pub mod bucket;
pub mod engine;
pub mod splits;
pub mod strategies;
pub mod trigger_queue;
pub mod workflow;

pub use bucket::{BucketCoordinator, HashRing};
pub use engine::TriggerEngine;
pub use workflow::WorkflowOrchestrator;
