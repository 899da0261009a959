//! Tasks
//!
//! Description and lifecycle of a single unit of work.

mod lifecycle;
pub mod model;

pub use model::{Backend, ClusterConfig, Launcher, LogMode, PayloadFiles, Task, TaskStatus};
