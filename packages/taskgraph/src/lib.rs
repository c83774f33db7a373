//! Persistent, content-addressed task graph scheduling.
//!
//! Register tasks — a function with a stable identity, its arguments, the
//! files it promises to create, and the tasks it depends on — and the
//! graph executes them in dependency order under a worker budget. Every
//! completion is memoized in a durable store keyed by the task's
//! fingerprint, so re-running an unchanged workflow is a no-op, and a
//! fingerprint hit aimed at new output paths can be satisfied by copying
//! the prior artifact's bytes instead of re-executing.
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskgraph::{FnOp, TaskGraph, TaskSpec, TaskValue};
//!
//! # fn main() -> taskgraph::Result<()> {
//! let graph = TaskGraph::new("workspace", 2)?;
//! let out = std::path::PathBuf::from("workspace/out.txt");
//! graph.add_task(
//!     TaskSpec::builder()
//!         .op(Arc::new(FnOp::new("write_out", "1", |ctx| {
//!             let path = ctx.arg(0).and_then(TaskValue::as_path).expect("path arg");
//!             std::fs::write(path, "done")?;
//!             Ok(())
//!         })))
//!         .args(vec![TaskValue::path(&out)])
//!         .target_path_list(vec![out.clone()])
//!         .build(),
//! )?;
//! graph.close();
//! graph.join(None)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod hash;
pub mod logbridge;
pub mod path;
mod report;
mod scheduler;
pub mod stat;
pub mod store;
pub mod task;
pub mod value;

pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use graph::{TaskGraph, TaskGraphConfig, TaskSpec};
pub use hash::HashAlgorithm;
pub use logbridge::{LogHandle, LogRecord, LogSink};
pub use stat::FileRecord;
pub use store::{CompletionRecord, MemoStore, TASKGRAPH_DATABASE_FILENAME};
pub use task::{FnOp, Task, TaskContext, TaskOp, TaskState};
pub use value::TaskValue;

/// Crate version, for workflows that record the scheduler they ran under.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
