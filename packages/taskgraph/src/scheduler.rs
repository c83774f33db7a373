//! Dependency-driven execution.
//!
//! Control logic is single-threaded: one dispatcher thread owns the ready
//! queue, every task state transition, and every memo store write. Task
//! bodies run elsewhere — on a pre-spawned pool of named worker threads
//! (`n_workers >= 1`), on the dispatcher itself (`n_workers == 0`), or in
//! the caller's thread (`n_workers == -1`, which bypasses the dispatcher
//! entirely; see `graph`).
//!
//! The dispatcher is a state machine over two channels: submissions in,
//! worker results in; work items out. Workers never touch shared state —
//! they receive a task, run its body (with retries and target
//! verification), and send back the outcome. All blocking waits are timed
//! or stop-aware so teardown cannot deadlock.

use std::{
    collections::{BTreeMap, HashMap},
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use color_eyre::eyre::eyre;
use tracing::{debug, instrument, trace, warn};

use crate::{
    error::Error,
    fingerprint::task_fingerprint,
    graph::GraphCore,
    hash::HashAlgorithm,
    report::StopSignal,
    stat::FileRecord,
    store::{CompletionRecord, MemoStore},
    task::{Task, TaskContext, TaskState},
};

/// How a ready task is satisfied.
pub(crate) enum Resolution {
    /// Proven complete from the memo store (directly or by artifact copy).
    Skip,
    /// Must execute.
    Run,
}

/// Terminal failure of one task body, after retries.
pub(crate) enum TaskFailure {
    User(Arc<color_eyre::Report>),
    MissingTargets(Vec<PathBuf>),
}

pub(crate) fn failure_error(task: &Task, failure: &TaskFailure) -> Error {
    match failure {
        TaskFailure::User(cause) => Error::UserTask {
            task: task.name().to_owned(),
            cause: Arc::clone(cause),
        },
        TaskFailure::MissingTargets(missing) => Error::MissingTargetOutput {
            task: task.name().to_owned(),
            missing: missing.clone(),
        },
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(100 * u64::from(attempt.min(20)))
}

/// Run a task body to completion, retrying failed attempts (including
/// missing declared targets) up to the task's retry budget, with a short
/// stop-aware backoff between attempts.
pub(crate) fn run_with_retries(
    core: &GraphCore,
    task: &Task,
    stop: &StopSignal,
) -> Result<(), TaskFailure> {
    let node = &task.node;
    let mut attempt = 0u32;
    loop {
        match run_once(core, task) {
            Ok(()) => return Ok(()),
            Err(failure) => {
                if attempt >= node.n_retries {
                    return Err(failure);
                }
                attempt += 1;
                debug!(task = %node.name, attempt, "task attempt failed, retrying");
                if stop.wait_timeout(backoff(attempt)) {
                    return Err(failure);
                }
            }
        }
    }
}

fn run_once(core: &GraphCore, task: &Task) -> Result<(), TaskFailure> {
    let node = &task.node;
    if let Some(op) = &node.op {
        let ctx = TaskContext {
            args: &node.args,
            kwargs: &node.kwargs,
            log: &core.log,
        };
        match catch_unwind(AssertUnwindSafe(|| op.call(&ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(report)) => return Err(TaskFailure::User(Arc::new(report))),
            Err(panic) => {
                let message = panic_message(&panic);
                return Err(TaskFailure::User(Arc::new(eyre!(
                    "task body panicked: {message}"
                ))));
            }
        }
    }

    let missing = node
        .targets
        .iter()
        .filter(|target| !target.exists())
        .cloned()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(TaskFailure::MissingTargets(missing));
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Assign the task's fingerprint (its deps are terminal by now) and decide
/// how to satisfy it against the memo store.
#[instrument(skip(core, task), fields(task = %task.name()))]
pub(crate) fn resolve(core: &GraphCore, task: &Task) -> Result<Resolution, Error> {
    let node = &task.node;

    let fingerprint = match node.fingerprint.get() {
        Some(fingerprint) => fingerprint.clone(),
        None => {
            let deps = node
                .deps
                .iter()
                .map(|dep| {
                    dep.fingerprint()
                        .expect("dependency fingerprint assigned before dependent is ready")
                        .as_str()
                        .to_owned()
                })
                .collect::<Vec<_>>();
            let fingerprint =
                task_fingerprint(&node.identity(), deps.iter().map(String::as_str))?;
            let _ = node.fingerprint.set(fingerprint.clone());
            fingerprint
        }
    };

    // Targetless tasks always execute and are never memoized.
    if node.targets.is_empty() {
        return Ok(Resolution::Run);
    }

    let store = core.store.lock().expect("store mutex poisoned");
    let Some(record) = store.lookup(&fingerprint)? else {
        return Ok(Resolution::Run);
    };

    if record.target_path_list == node.targets {
        if record
            .target_path_stats
            .iter()
            .all(|stat| stat.still_matches(node.hash_algorithm))
        {
            debug!(%fingerprint, "memo hit, skipping execution");
            return Ok(Resolution::Skip);
        }
        // Recorded outputs were modified or deleted since the record was
        // taken; the record no longer proves anything.
        debug!(%fingerprint, "memo record drifted, deleting");
        store.delete(&fingerprint)?;
        return Ok(Resolution::Run);
    }

    if node.copy_duplicate_artifact
        && node.hash_algorithm.is_content()
        && copy_artifacts(&store, &record, &node.targets, node.hash_algorithm)?
    {
        debug!(%fingerprint, "memo hit at different targets, copied artifacts");
        return Ok(Resolution::Skip);
    }

    Ok(Resolution::Run)
}

/// Materialize a prior completion's artifacts at new target paths. Pairs
/// recorded artifacts with the new targets in sorted order; every artifact
/// must be locatable on disk with matching content, else nothing is copied
/// and the caller falls back to execution.
fn copy_artifacts(
    store: &MemoStore,
    record: &CompletionRecord,
    targets: &[PathBuf],
    alg: HashAlgorithm,
) -> Result<bool, Error> {
    if record.target_path_stats.len() != targets.len() {
        return Ok(false);
    }

    let mut plan = Vec::with_capacity(targets.len());
    for (stat, target) in record.target_path_stats.iter().zip(targets) {
        let Some(digest) = stat.content_hash.clone() else {
            return Ok(false);
        };
        let Some(source) = locate_artifact(store, stat, &digest, alg)? else {
            return Ok(false);
        };
        plan.push((source, target));
    }

    for (source, target) in plan {
        if source == *target {
            continue;
        }
        if let Err(err) = std::fs::copy(&source, target) {
            warn!(?source, ?target, %err, "artifact copy failed, re-executing");
            return Ok(false);
        }
        trace!(?source, ?target, "copied artifact");
    }
    Ok(true)
}

/// Find a live on-disk file with the given content digest: the recorded
/// path itself if it still matches, else any other record listing an
/// equivalent artifact.
fn locate_artifact(
    store: &MemoStore,
    stat: &FileRecord,
    digest: &str,
    alg: HashAlgorithm,
) -> Result<Option<PathBuf>, Error> {
    if stat.still_matches(alg) {
        return Ok(Some(stat.path.clone()));
    }
    if let Some(other) = store.find_by_content(digest)? {
        for other_stat in &other.target_path_stats {
            if other_stat.content_hash.as_deref() == Some(digest) && other_stat.still_matches(alg) {
                return Ok(Some(other_stat.path.clone()));
            }
        }
    }
    Ok(None)
}

/// Stat the declared targets of a freshly succeeded task and upsert its
/// completion record. Called only from the thread that owns scheduling, so
/// store writes are serialized.
pub(crate) fn record_completion(core: &GraphCore, task: &Task) -> Result<(), Error> {
    let node = &task.node;
    if node.targets.is_empty() || node.op.is_none() {
        return Ok(());
    }

    let fingerprint = node
        .fingerprint
        .get()
        .expect("fingerprint assigned before execution")
        .clone();

    let mut stats = Vec::with_capacity(node.targets.len());
    for target in &node.targets {
        match FileRecord::for_path(target, node.hash_algorithm, false)? {
            Some(record) => stats.push(record),
            None => {
                return Err(Error::MissingTargetOutput {
                    task: node.name.clone(),
                    missing: vec![target.clone()],
                });
            }
        }
    }

    let record = CompletionRecord {
        fingerprint,
        target_path_list: node.targets.clone(),
        target_path_stats: stats,
        timestamp: now_seconds(),
    };
    core.store
        .lock()
        .expect("store mutex poisoned")
        .insert(&record)
}

fn now_seconds() -> f64 {
    jiff::Timestamp::now().as_millisecond() as f64 / 1_000.0
}

/// Satisfy one task in the caller's thread (`n_workers == -1`). Errors are
/// recorded as the graph's terminating failure and returned.
pub(crate) fn run_inline(core: &GraphCore, task: &Task, stop: &StopSignal) -> Result<(), Error> {
    match resolve(core, task) {
        Ok(Resolution::Skip) => {
            task.node.transition(TaskState::Skipped);
            core.task_done();
            Ok(())
        }
        Ok(Resolution::Run) => {
            task.node.transition(TaskState::Running);
            let outcome = run_with_retries(core, task, stop);
            let result = match outcome {
                Ok(()) => record_completion(core, task),
                Err(failure) => Err(failure_error(task, &failure)),
            };
            match result {
                Ok(()) => {
                    task.node.transition(TaskState::Succeeded);
                    core.task_done();
                    Ok(())
                }
                Err(error) => {
                    core.record_failure(&error);
                    task.node.fail(error.clone());
                    core.task_done();
                    Err(error)
                }
            }
        }
        Err(error) => {
            core.record_failure(&error);
            task.node.fail(error.clone());
            core.task_done();
            Err(error)
        }
    }
}

pub(crate) enum Submission {
    Task(Task),
    Shutdown,
}

struct WorkItem {
    task: Task,
}

struct WorkResult {
    task: Task,
    outcome: Result<(), TaskFailure>,
}

/// Handle owned by the graph; the dispatcher thread lives behind it.
pub(crate) struct Scheduler {
    submit_tx: flume::Sender<Submission>,
    dispatcher: Option<JoinHandle<()>>,
    stop: Arc<StopSignal>,
}

impl Scheduler {
    pub(crate) fn start(core: Arc<GraphCore>, n_workers: usize, stop: Arc<StopSignal>) -> Self {
        let (submit_tx, submit_rx) = flume::unbounded();
        let dispatcher = std::thread::Builder::new()
            .name("taskgraph-dispatch".to_owned())
            .spawn({
                let stop = Arc::clone(&stop);
                move || Dispatch::new(core, n_workers, submit_rx, stop).run()
            })
            .expect("spawn dispatcher thread");
        Scheduler {
            submit_tx,
            dispatcher: Some(dispatcher),
            stop,
        }
    }

    pub(crate) fn submit(&self, task: Task) {
        // A failed send means the dispatcher already shut down; the graph
        // is terminated and the task was (or will be) swept by terminate.
        let _ = self.submit_tx.send(Submission::Task(task));
    }

    /// Stop the dispatcher and its workers. Idempotent; blocks until all
    /// threads have exited.
    pub(crate) fn shutdown(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            self.stop.stop();
            let _ = self.submit_tx.send(Submission::Shutdown);
            let _ = handle.join();
        }
    }
}

struct NodeCtl {
    task: Task,
    /// Dependencies not yet terminal.
    remaining: usize,
    /// Seqs of registered tasks waiting on this one.
    dependents: Vec<u64>,
}

struct Dispatch {
    core: Arc<GraphCore>,
    stop: Arc<StopSignal>,
    submit_rx: flume::Receiver<Submission>,
    work_tx: Option<flume::Sender<WorkItem>>,
    result_rx: flume::Receiver<WorkResult>,
    workers: Vec<JoinHandle<()>>,
    /// Non-terminal tasks, by submission sequence.
    nodes: HashMap<u64, NodeCtl>,
    /// Ready tasks in submission order.
    ready: BTreeMap<u64, Task>,
    running: usize,
    capacity: usize,
    /// Set on the first exhausted failure; no new work is started.
    draining: bool,
}

enum Incoming {
    Submit(Submission),
    Result(WorkResult),
    Closed,
}

impl Dispatch {
    fn new(
        core: Arc<GraphCore>,
        n_workers: usize,
        submit_rx: flume::Receiver<Submission>,
        stop: Arc<StopSignal>,
    ) -> Self {
        let (result_tx, result_rx) = flume::unbounded();
        let mut work_tx = None;
        let mut workers = Vec::new();

        if n_workers >= 1 {
            let (tx, rx) = flume::unbounded::<WorkItem>();
            for index in 0..n_workers {
                let worker = std::thread::Builder::new()
                    .name(format!("taskgraph-worker-{index}"))
                    .spawn({
                        let rx = rx.clone();
                        let result_tx = result_tx.clone();
                        let core = Arc::clone(&core);
                        let stop = Arc::clone(&stop);
                        move || worker_main(rx, result_tx, core, stop)
                    })
                    .expect("spawn worker thread");
                workers.push(worker);
            }
            work_tx = Some(tx);
        }

        Dispatch {
            core,
            stop,
            submit_rx,
            work_tx,
            result_rx,
            workers,
            nodes: HashMap::new(),
            ready: BTreeMap::new(),
            running: 0,
            capacity: n_workers.max(1),
            draining: false,
        }
    }

    fn run(mut self) {
        loop {
            let incoming = flume::Selector::new()
                .recv(&self.submit_rx, |msg| match msg {
                    Ok(submission) => Incoming::Submit(submission),
                    Err(_) => Incoming::Closed,
                })
                .recv(&self.result_rx, |msg| match msg {
                    Ok(result) => Incoming::Result(result),
                    Err(_) => Incoming::Closed,
                })
                .wait();

            match incoming {
                Incoming::Submit(Submission::Task(task)) => {
                    self.register(task);
                    self.pump();
                }
                Incoming::Submit(Submission::Shutdown) | Incoming::Closed => break,
                Incoming::Result(result) => {
                    self.complete(result);
                    self.pump();
                }
            }
        }

        // Teardown: close the work channel so idle workers exit, then wait
        // for in-flight bodies to finish.
        drop(self.work_tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn register(&mut self, task: Task) {
        if self.draining {
            self.fail_task(&task, self.termination_error());
            return;
        }

        let seq = task.node.seq;
        let mut remaining = 0;
        for dep in &task.node.deps {
            let state = dep.state();
            if state.is_success() {
                continue;
            }
            if state == TaskState::Failed {
                let cause = dep.error().unwrap_or(Error::GraphTerminated);
                self.fail_task(&task, cause);
                return;
            }
            if let Some(ctl) = self.nodes.get_mut(&dep.node.seq) {
                ctl.dependents.push(seq);
                remaining += 1;
            }
        }

        self.nodes.insert(
            seq,
            NodeCtl {
                task: task.clone(),
                remaining,
                dependents: Vec::new(),
            },
        );
        if remaining == 0 {
            task.node.transition(TaskState::Ready);
            self.ready.insert(seq, task);
        }
    }

    fn pump(&mut self) {
        loop {
            if self.draining || self.running >= self.capacity {
                return;
            }
            let Some((_, task)) = self.ready.pop_first() else {
                return;
            };

            match resolve(&self.core, &task) {
                Ok(Resolution::Skip) => {
                    self.finish(&task, TaskState::Skipped);
                }
                Ok(Resolution::Run) => {
                    task.node.transition(TaskState::Running);
                    match self.work_tx.clone() {
                        Some(tx) => {
                            self.running += 1;
                            let _ = tx.send(WorkItem { task });
                        }
                        None => {
                            // n_workers == 0: the dispatcher is the worker.
                            let outcome = run_with_retries(&self.core, &task, &self.stop);
                            self.handle_outcome(task, outcome);
                        }
                    }
                }
                Err(error) => {
                    self.fail_exhausted(&task, error);
                    return;
                }
            }
        }
    }

    fn complete(&mut self, result: WorkResult) {
        self.running -= 1;
        if self.draining {
            // Fail-fast already engaged: the result is discarded.
            self.fail_task(&result.task, self.termination_error());
            return;
        }
        self.handle_outcome(result.task, result.outcome);
    }

    fn handle_outcome(&mut self, task: Task, outcome: Result<(), TaskFailure>) {
        let result = match outcome {
            Ok(()) => record_completion(&self.core, &task),
            Err(failure) => Err(failure_error(&task, &failure)),
        };
        match result {
            Ok(()) => self.finish(&task, TaskState::Succeeded),
            Err(error) => self.fail_exhausted(&task, error),
        }
    }

    /// Terminal success or skip: notify the latch and promote dependents.
    fn finish(&mut self, task: &Task, state: TaskState) {
        task.node.transition(state);
        self.core.task_done();

        let Some(ctl) = self.nodes.remove(&task.node.seq) else {
            return;
        };
        for dependent_seq in ctl.dependents {
            if let Some(dependent) = self.nodes.get_mut(&dependent_seq) {
                dependent.remaining -= 1;
                if dependent.remaining == 0 {
                    let ready = dependent.task.clone();
                    ready.node.transition(TaskState::Ready);
                    self.ready.insert(dependent_seq, ready);
                }
            }
        }
    }

    /// Terminal failure with no retries left: record the cause, terminate
    /// the graph, and fail everything that has not started running.
    fn fail_exhausted(&mut self, task: &Task, error: Error) {
        warn!(task = %task.name(), %error, "task failed, entering fail-fast");
        self.core.record_failure(&error);
        self.fail_task(task, error.clone());
        self.draining = true;

        let seqs = self.nodes.keys().copied().collect::<Vec<_>>();
        for seq in seqs {
            let Some(ctl) = self.nodes.get(&seq) else {
                continue;
            };
            let pending = ctl.task.clone();
            if pending.state() == TaskState::Running {
                // Allowed to finish; its result is discarded on arrival.
                continue;
            }
            self.fail_task(&pending, error.clone());
        }
        self.ready.clear();
    }

    fn fail_task(&mut self, task: &Task, error: Error) {
        task.node.fail(error);
        self.core.task_done();
        self.nodes.remove(&task.node.seq);
    }

    fn termination_error(&self) -> Error {
        self.core.first_error().unwrap_or(Error::GraphTerminated)
    }
}

fn worker_main(
    rx: flume::Receiver<WorkItem>,
    tx: flume::Sender<WorkResult>,
    core: Arc<GraphCore>,
    stop: Arc<StopSignal>,
) {
    for item in rx.iter() {
        if stop.stopped() {
            break;
        }
        let outcome = run_with_retries(&core, &item.task, &stop);
        if tx.send(WorkResult {
            task: item.task,
            outcome,
        })
        .is_err()
        {
            break;
        }
    }
}
