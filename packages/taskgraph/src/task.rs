//! In-memory task nodes and the user-facing task handle.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
    sync::{Condvar, Mutex, OnceLock},
    time::{Duration, Instant},
};

use strum::Display;

use crate::{
    error::Error,
    fingerprint::{Fingerprint, TaskIdentity},
    hash::HashAlgorithm,
    logbridge::LogHandle,
    value::TaskValue,
};

/// A unit of work with a stable identity.
///
/// The identity `(name, version)` stands in for the function's source text:
/// it must change whenever the implementation's behavior changes, and must
/// *not* change when the same code is merely rebuilt or relinked. Bump
/// `version` when you edit the body. Implementors that close over
/// constructor state should fold that state into `version` so that two
/// instances configured differently hash differently.
pub trait TaskOp: Send + Sync + 'static {
    /// Qualified name of the operation. Part of the task's identity.
    fn name(&self) -> &str;

    /// Version string standing in for a digest of the implementation.
    fn version(&self) -> &str;

    /// Execute the operation. Arguments arrive exactly as submitted.
    fn call(&self, ctx: &TaskContext<'_>) -> color_eyre::Result<()>;
}

/// Adapter making a closure into a [`TaskOp`].
pub struct FnOp<F> {
    name: String,
    version: String,
    func: F,
}

impl<F> FnOp<F>
where
    F: Fn(&TaskContext<'_>) -> color_eyre::Result<()> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, version: impl Into<String>, func: F) -> Self {
        FnOp {
            name: name.into(),
            version: version.into(),
            func,
        }
    }
}

impl<F> TaskOp for FnOp<F>
where
    F: Fn(&TaskContext<'_>) -> color_eyre::Result<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn call(&self, ctx: &TaskContext<'_>) -> color_eyre::Result<()> {
        (self.func)(ctx)
    }
}

/// Execution context handed to a running [`TaskOp`].
pub struct TaskContext<'a> {
    pub(crate) args: &'a [TaskValue],
    pub(crate) kwargs: &'a BTreeMap<String, TaskValue>,
    pub(crate) log: &'a LogHandle,
}

impl TaskContext<'_> {
    pub fn args(&self) -> &[TaskValue] {
        self.args
    }

    pub fn arg(&self, index: usize) -> Option<&TaskValue> {
        self.args.get(index)
    }

    pub fn kwargs(&self) -> &BTreeMap<String, TaskValue> {
        self.kwargs
    }

    pub fn kwarg(&self, key: &str) -> Option<&TaskValue> {
        self.kwargs.get(key)
    }

    /// Log handle bridged back to the graph's sink.
    pub fn log(&self) -> &LogHandle {
        self.log
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }

    /// Terminal and usable by dependents.
    pub(crate) fn is_success(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Skipped)
    }
}

/// Handle to a submitted task. Cheap to clone; all clones observe the same
/// underlying node.
#[derive(Clone)]
pub struct Task {
    pub(crate) node: std::sync::Arc<TaskNode>,
}

pub(crate) struct TaskNode {
    pub(crate) seq: u64,
    pub(crate) name: String,
    pub(crate) op: Option<std::sync::Arc<dyn TaskOp>>,
    pub(crate) args: Vec<TaskValue>,
    pub(crate) kwargs: BTreeMap<String, TaskValue>,
    /// Sorted, normalized declared outputs.
    pub(crate) targets: Vec<PathBuf>,
    pub(crate) ignore: BTreeSet<PathBuf>,
    pub(crate) deps: Vec<Task>,
    pub(crate) hash_algorithm: HashAlgorithm,
    pub(crate) copy_duplicate_artifact: bool,
    pub(crate) n_retries: u32,
    pub(crate) submission_id: String,
    pub(crate) fingerprint: OnceLock<Fingerprint>,
    latch: Latch,
}

struct Latch {
    state: Mutex<(TaskState, Option<Error>)>,
    cv: Condvar,
}

impl TaskNode {
    pub(crate) fn new(
        seq: u64,
        name: String,
        op: Option<std::sync::Arc<dyn TaskOp>>,
        args: Vec<TaskValue>,
        kwargs: BTreeMap<String, TaskValue>,
        targets: Vec<PathBuf>,
        ignore: BTreeSet<PathBuf>,
        deps: Vec<Task>,
        hash_algorithm: HashAlgorithm,
        copy_duplicate_artifact: bool,
        n_retries: u32,
        submission_id: String,
    ) -> Self {
        TaskNode {
            seq,
            name,
            op,
            args,
            kwargs,
            targets,
            ignore,
            deps,
            hash_algorithm,
            copy_duplicate_artifact,
            n_retries,
            submission_id,
            fingerprint: OnceLock::new(),
            latch: Latch {
                state: Mutex::new((TaskState::Pending, None)),
                cv: Condvar::new(),
            },
        }
    }

    /// Hashable view of this node for identity digests.
    pub(crate) fn identity(&self) -> TaskIdentity<'_> {
        TaskIdentity {
            op: self
                .op
                .as_deref()
                .map(|op| (op.name(), op.version())),
            args: &self.args,
            kwargs: &self.kwargs,
            targets: &self.targets,
            ignore: &self.ignore,
            alg: self.hash_algorithm,
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        self.latch.state.lock().expect("latch poisoned").0
    }

    pub(crate) fn transition(&self, state: TaskState) {
        let mut guard = self.latch.state.lock().expect("latch poisoned");
        guard.0 = state;
        if state.is_terminal() {
            self.latch.cv.notify_all();
        }
    }

    pub(crate) fn fail(&self, error: Error) {
        let mut guard = self.latch.state.lock().expect("latch poisoned");
        guard.0 = TaskState::Failed;
        guard.1 = Some(error);
        self.latch.cv.notify_all();
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.latch.state.lock().expect("latch poisoned").1.clone()
    }
}

impl Task {
    /// Human label supplied at submission (not part of identity).
    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn state(&self) -> TaskState {
        self.node.state()
    }

    /// The task's fingerprint, once assigned (the task became ready).
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.node.fingerprint.get()
    }

    /// The failure recorded for this task, if any.
    pub fn error(&self) -> Option<Error> {
        self.node.error()
    }

    /// Block until the task reaches a terminal state, or until `timeout`
    /// elapses. Returns whether the task finished in time.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.node.latch.state.lock().expect("latch poisoned");
        loop {
            if guard.0.is_terminal() {
                return true;
            }
            match deadline {
                None => {
                    guard = self.node.latch.cv.wait(guard).expect("latch poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, _) = self
                        .node
                        .latch
                        .cv
                        .wait_timeout(guard, deadline - now)
                        .expect("latch poisoned");
                    guard = next;
                }
            }
        }
    }
}

/// Task handles compare by identity digest: two submissions that would
/// fingerprint identically are the same task.
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.node.submission_id == other.node.submission_id
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node.submission_id.hash(state);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("seq", &self.node.seq)
            .field("name", &self.node.name)
            .field("state", &self.state())
            .finish()
    }
}
