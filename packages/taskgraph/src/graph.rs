//! The task graph facade.
//!
//! A [`TaskGraph`] owns the memo store, the log bridge, the reporter, and
//! (unless fully inline) the dispatcher thread. Submissions are validated
//! and normalized here; everything after that belongs to the scheduler.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io,
    path::PathBuf,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use bon::Builder;
use tap::TapFallible as _;
use tracing::{debug, instrument, trace};

use crate::{
    error::{Error, Result},
    fingerprint::{TaskIdentity, submission_digest},
    hash::HashAlgorithm,
    logbridge::{LogBridge, LogHandle, LogSink, tracing_sink},
    path::normalize,
    report::{Reporter, StateCounts, StopSignal},
    scheduler::{self, Scheduler},
    store::MemoStore,
    task::{Task, TaskNode, TaskOp},
    value::TaskValue,
};

/// Construction options for a [`TaskGraph`].
#[derive(Builder)]
pub struct TaskGraphConfig {
    /// Created if absent; houses the memo store.
    #[builder(into)]
    pub workspace_dir: PathBuf,
    /// `-1`: run tasks inline in the caller's thread. `0`: run tasks on
    /// the dispatcher thread. `>= 1`: a pool of that many worker threads.
    #[builder(default = 0)]
    pub n_workers: i32,
    /// Cadence of the progress reporter.
    #[builder(default = Duration::from_secs(5))]
    pub reporting_interval: Duration,
    /// Receives bridged worker log records; defaults to re-emitting them
    /// through `tracing`.
    pub log_sink: Option<LogSink>,
}

/// One submission. Build with [`TaskSpec::builder`]; every option has the
/// obvious do-nothing default.
#[derive(Builder)]
pub struct TaskSpec {
    /// The operation to run. Omitted, the task is an "empty task": it
    /// succeeds immediately and contributes nothing to the memo store.
    pub op: Option<Arc<dyn TaskOp>>,
    /// Positional arguments, forwarded to the op.
    #[builder(default)]
    pub args: Vec<TaskValue>,
    /// Keyword arguments, forwarded to the op.
    #[builder(default)]
    pub kwargs: BTreeMap<String, TaskValue>,
    /// Paths the op promises to create. Order is irrelevant to identity.
    #[builder(default)]
    pub target_path_list: Vec<PathBuf>,
    /// Paths excluded from stat gathering during fingerprinting.
    #[builder(default)]
    pub ignore_path_list: Vec<PathBuf>,
    /// Upstream tasks that must succeed first.
    #[builder(default)]
    pub dependent_task_list: Vec<Task>,
    /// Human label; not part of identity. Defaults to the op name.
    #[builder(into)]
    pub task_name: Option<String>,
    #[builder(default)]
    pub hash_algorithm: HashAlgorithm,
    /// On a fingerprint hit whose record lists different target paths,
    /// materialize outputs by copying the prior artifact's bytes instead
    /// of re-running. Requires a content hash algorithm.
    #[builder(default)]
    pub copy_duplicate_artifact: bool,
    /// Extra attempts after a failed one.
    #[builder(default)]
    pub n_retries: u32,
}

/// State shared between the facade, the dispatcher, and workers.
pub(crate) struct GraphCore {
    pub(crate) workspace: PathBuf,
    pub(crate) store: Mutex<MemoStore>,
    pub(crate) state: Mutex<GraphState>,
    pub(crate) done: Condvar,
    pub(crate) log: LogHandle,
}

#[derive(Default)]
pub(crate) struct GraphState {
    closed: bool,
    terminated: bool,
    first_error: Option<Error>,
    /// Tasks not yet terminal; `join` waits for zero.
    outstanding: usize,
    /// Submission digest of the first task registered under it.
    seen: HashMap<String, Task>,
    /// Every submitted task, indexed by sequence number.
    tasks: Vec<Task>,
}

impl GraphCore {
    /// Record a terminal failure: the graph is terminated and the first
    /// cause is what `join` reports from now on.
    pub(crate) fn record_failure(&self, error: &Error) {
        let mut state = self.state.lock().expect("graph state poisoned");
        state.terminated = true;
        if state.first_error.is_none() {
            state.first_error = Some(error.clone());
        }
    }

    pub(crate) fn first_error(&self) -> Option<Error> {
        self.state
            .lock()
            .expect("graph state poisoned")
            .first_error
            .clone()
    }

    /// One task reached a terminal state.
    pub(crate) fn task_done(&self) {
        let mut state = self.state.lock().expect("graph state poisoned");
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.done.notify_all();
        }
    }

    pub(crate) fn counts(&self) -> StateCounts {
        let state = self.state.lock().expect("graph state poisoned");
        StateCounts::tally(state.tasks.iter().map(Task::state))
    }
}

/// A persistent, content-addressed task graph.
pub struct TaskGraph {
    core: Arc<GraphCore>,
    inline: bool,
    stop: Arc<StopSignal>,
    scheduler: Mutex<Option<Scheduler>>,
    reporter: Mutex<Option<Reporter>>,
    bridge: Mutex<Option<LogBridge>>,
}

impl TaskGraph {
    /// Open a graph over `workspace_dir` with the given worker count.
    pub fn new(workspace_dir: impl Into<PathBuf>, n_workers: i32) -> Result<Self> {
        Self::with_config(
            TaskGraphConfig::builder()
                .workspace_dir(workspace_dir.into())
                .n_workers(n_workers)
                .build(),
        )
    }

    #[instrument(name = "TaskGraph::with_config", skip(config), fields(workspace = ?config.workspace_dir, n_workers = config.n_workers))]
    pub fn with_config(config: TaskGraphConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_dir)?;
        let store = MemoStore::open_in(&config.workspace_dir)
            .tap_ok(|_| trace!(workspace = ?config.workspace_dir, "opened memo store"))?;
        let bridge = LogBridge::start(config.log_sink.unwrap_or_else(tracing_sink));

        let core = Arc::new(GraphCore {
            workspace: config.workspace_dir,
            store: Mutex::new(store),
            state: Mutex::new(GraphState::default()),
            done: Condvar::new(),
            log: bridge.handle(),
        });

        let stop = StopSignal::new();
        let inline = config.n_workers < 0;
        let scheduler = if inline {
            None
        } else {
            Some(Scheduler::start(
                Arc::clone(&core),
                config.n_workers as usize,
                Arc::clone(&stop),
            ))
        };

        let reporter = Reporter::start(config.reporting_interval, {
            let core = Arc::clone(&core);
            move || core.counts()
        });

        Ok(TaskGraph {
            core,
            inline,
            stop,
            scheduler: Mutex::new(scheduler),
            reporter: Mutex::new(Some(reporter)),
            bridge: Mutex::new(Some(bridge)),
        })
    }

    /// Workspace directory this graph memoizes into.
    pub fn workspace_dir(&self) -> &std::path::Path {
        &self.core.workspace
    }

    /// Register a task. Returns immediately with a joinable handle unless
    /// the graph is fully inline, in which case the task has already been
    /// satisfied (or its failure has already been raised) on return.
    ///
    /// Submitting an identical task again returns the existing handle.
    pub fn add_task(&self, spec: TaskSpec) -> Result<Task> {
        let TaskSpec {
            op,
            args,
            kwargs,
            target_path_list,
            ignore_path_list,
            dependent_task_list,
            task_name,
            hash_algorithm,
            copy_duplicate_artifact,
            n_retries,
        } = spec;

        if op.is_none() && !target_path_list.is_empty() {
            return Err(Error::InvalidSubmission(
                "target paths declared on an empty task".to_owned(),
            ));
        }
        if let Some(op) = &op {
            if op.name().is_empty() {
                return Err(Error::InvalidSubmission("op has an empty name".to_owned()));
            }
        }

        let name = task_name.unwrap_or_else(|| match &op {
            Some(op) => op.name().to_owned(),
            None => "empty task".to_owned(),
        });

        let mut targets = target_path_list
            .iter()
            .map(|path| normalize(path))
            .collect::<io::Result<Vec<_>>>()?;
        targets.sort();
        if targets.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Error::InvalidSubmission(format!(
                "task '{name}' declares duplicate target paths"
            )));
        }

        let ignore = ignore_path_list
            .iter()
            .map(|path| normalize(path))
            .collect::<io::Result<BTreeSet<_>>>()?;
        let args = args
            .iter()
            .map(TaskValue::normalized)
            .collect::<io::Result<Vec<_>>>()?;
        let kwargs = kwargs
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.normalized()?)))
            .collect::<io::Result<BTreeMap<_, _>>>()?;

        let identity = TaskIdentity {
            op: op.as_deref().map(|op| (op.name(), op.version())),
            args: &args,
            kwargs: &kwargs,
            targets: &targets,
            ignore: &ignore,
            alg: hash_algorithm,
        };
        let dep_ids = dependent_task_list
            .iter()
            .map(|dep| dep.node.submission_id.as_str())
            .collect::<Vec<_>>();
        let submission_id = submission_digest(&identity, dep_ids);

        let task = {
            let mut state = self.core.state.lock().expect("graph state poisoned");
            if state.terminated {
                return Err(Error::GraphTerminated);
            }
            if state.closed {
                return Err(Error::GraphClosed);
            }

            for dep in &dependent_task_list {
                let known = state
                    .tasks
                    .get(dep.node.seq as usize)
                    .is_some_and(|task| Arc::ptr_eq(&task.node, &dep.node));
                if !known {
                    return Err(Error::InvalidSubmission(format!(
                        "dependent task '{}' was not created by this graph",
                        dep.name()
                    )));
                }
            }

            if let Some(existing) = state.seen.get(&submission_id) {
                if existing.node.targets == targets {
                    debug!(task = %name, "duplicate submission, returning existing task");
                    return Ok(existing.clone());
                }
                if !(copy_duplicate_artifact && hash_algorithm.is_content()) {
                    return Err(Error::DuplicateTargetMismatch { task: name });
                }
                // Same identity aimed at fresh target paths, with artifact
                // copying enabled: a distinct task, satisfied from the
                // first one's record at ready time.
            }

            let seq = state.tasks.len() as u64;
            let node = TaskNode::new(
                seq,
                name,
                op,
                args,
                kwargs,
                targets,
                ignore,
                dependent_task_list,
                hash_algorithm,
                copy_duplicate_artifact,
                n_retries,
                submission_id.clone(),
            );
            let task = Task {
                node: Arc::new(node),
            };
            state.outstanding += 1;
            state.seen.entry(submission_id).or_insert_with(|| task.clone());
            state.tasks.push(task.clone());
            task
        };

        if self.inline {
            scheduler::run_inline(&self.core, &task, &self.stop)?;
        } else if let Some(scheduler) = self.scheduler.lock().expect("scheduler poisoned").as_ref()
        {
            scheduler.submit(task.clone());
        }
        Ok(task)
    }

    /// Refuse further submissions. Idempotent.
    pub fn close(&self) {
        self.core.state.lock().expect("graph state poisoned").closed = true;
    }

    /// Wait for every submitted task to reach a terminal state.
    ///
    /// Returns `Ok(false)` if `timeout` elapsed first (in-flight work is
    /// *not* cancelled). Once a task failure has terminated the graph,
    /// returns (and keeps returning) the originating error.
    pub fn join(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.core.state.lock().expect("graph state poisoned");
        loop {
            if state.outstanding == 0 {
                return match &state.first_error {
                    Some(error) => Err(error.clone()),
                    None => Ok(true),
                };
            }
            match deadline {
                None => {
                    state = self
                        .core
                        .done
                        .wait(state)
                        .expect("graph state poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    let (next, _) = self
                        .core
                        .done
                        .wait_timeout(state, deadline - now)
                        .expect("graph state poisoned");
                    state = next;
                }
            }
        }
    }

    /// Force shutdown: stop the dispatcher, workers, reporter, and log
    /// bridge, and fail any task that has not finished. Safe to call more
    /// than once; also runs on drop.
    pub fn terminate(&self) {
        self.stop.stop();
        if let Some(mut scheduler) = self.scheduler.lock().expect("scheduler poisoned").take() {
            scheduler.shutdown();
        }
        if let Some(mut reporter) = self.reporter.lock().expect("reporter poisoned").take() {
            reporter.shutdown();
        }

        let (abandoned, cause) = {
            let mut state = self.core.state.lock().expect("graph state poisoned");
            state.terminated = true;
            let cause = state.first_error.clone().unwrap_or(Error::GraphTerminated);
            let abandoned = state
                .tasks
                .iter()
                .filter(|task| !task.state().is_terminal())
                .cloned()
                .collect::<Vec<_>>();
            (abandoned, cause)
        };
        for task in &abandoned {
            task.node.fail(cause.clone());
        }
        {
            let mut state = self.core.state.lock().expect("graph state poisoned");
            state.outstanding = state.outstanding.saturating_sub(abandoned.len());
            if state.outstanding == 0 {
                self.done_notify();
            }
        }

        if let Some(mut bridge) = self.bridge.lock().expect("log bridge poisoned").take() {
            bridge.shutdown();
        }
    }

    fn done_notify(&self) {
        self.core.done.notify_all();
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.terminate();
    }
}
