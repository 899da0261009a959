//! Task Execution
//!
//! Everything between a packed task and its result.
//!
//! # Architecture
//!
//! - [`payload`]: Wire format of the file handed to a runner
//! - [`runner`]: Entry point executed in the runner process
//! - [`local`]: Child-process backend
//! - [`cluster`]: Batch-cluster backend (`bsub`/`bjobs`/`bkill`)
//! - [`batch`]: Independent tasks started and awaited together

pub mod batch;
pub mod cluster;
pub mod local;
pub mod payload;
pub mod runner;

pub use batch::Batch;
