// Task registry
// Capability-set handlers looked up by task type

pub mod model;
pub mod registry;

pub use model::{Task, TaskStatus};
pub use registry::{DehydrateFn, ExecuteFn, HydrateFn, TaskHandler, TaskRegistry};
