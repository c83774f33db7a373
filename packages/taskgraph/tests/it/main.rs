use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use color_eyre::eyre::OptionExt as _;
use taskgraph::{FnOp, TaskContext, TaskOp, TaskValue};
use tempfile::TempDir;

pub mod graph;
pub mod logging;

#[track_caller]
pub fn temporary_workspace() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("create temporary workspace");
    let path = dir.path().to_path_buf();
    (dir, path)
}

/// Wrap a closure as an op with version "1".
pub fn op<F>(name: &str, func: F) -> Arc<dyn TaskOp>
where
    F: Fn(&TaskContext<'_>) -> color_eyre::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnOp::new(name, "1", func))
}

/// Writes `length` lines of `value` to the `target_path` kwarg, counting
/// invocations.
pub fn create_list_on_disk(runs: &Arc<AtomicU32>) -> Arc<dyn TaskOp> {
    let runs = Arc::clone(runs);
    op("create_list_on_disk", move |ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        let value = ctx
            .arg(0)
            .and_then(TaskValue::as_i64)
            .ok_or_eyre("missing value argument")?;
        let length = ctx
            .arg(1)
            .and_then(TaskValue::as_i64)
            .ok_or_eyre("missing length argument")?;
        let target = ctx
            .kwarg("target_path")
            .and_then(TaskValue::as_path)
            .ok_or_eyre("missing target_path kwarg")?;
        let mut lines = String::new();
        for _ in 0..length {
            lines.push_str(&value.to_string());
            lines.push('\n');
        }
        std::fs::write(target, lines)?;
        Ok(())
    })
}

/// Reads the two list files in `args`, writes their element-wise sum to
/// the `target_path` kwarg.
pub fn sum_lists_from_disk(runs: &Arc<AtomicU32>) -> Arc<dyn TaskOp> {
    let runs = Arc::clone(runs);
    op("sum_lists_from_disk", move |ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        let list_a = read_list(ctx.arg(0).and_then(TaskValue::as_path).ok_or_eyre("list a")?)?;
        let list_b = read_list(ctx.arg(1).and_then(TaskValue::as_path).ok_or_eyre("list b")?)?;
        let target = ctx
            .kwarg("target_path")
            .and_then(TaskValue::as_path)
            .ok_or_eyre("missing target_path kwarg")?;
        let sum = list_a
            .iter()
            .zip(&list_b)
            .map(|(a, b)| format!("{}\n", a + b))
            .collect::<String>();
        std::fs::write(target, sum)?;
        Ok(())
    })
}

/// Writes the `content` argument to the `target` argument, counting
/// invocations.
pub fn create_file(runs: &Arc<AtomicU32>) -> Arc<dyn TaskOp> {
    let runs = Arc::clone(runs);
    op("create_file", move |ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        let target = ctx
            .arg(0)
            .and_then(TaskValue::as_path)
            .ok_or_eyre("missing target argument")?;
        let content = ctx
            .arg(1)
            .and_then(TaskValue::as_str)
            .ok_or_eyre("missing content argument")?;
        std::fs::write(target, content)?;
        Ok(())
    })
}

pub fn read_list(path: &Path) -> color_eyre::Result<Vec<i64>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(|line| line.parse::<i64>())
        .collect::<Result<_, _>>()?)
}

/// Express `path` relative to the current working directory, for tests
/// that exercise relative-path canonicalization.
pub fn relative_to_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().expect("current dir");
    let mut ups = PathBuf::new();
    let mut base = cwd.as_path();
    loop {
        if let Ok(rest) = path.strip_prefix(base) {
            return ups.join(rest);
        }
        ups.push("..");
        base = base.parent().expect("no common prefix with cwd");
    }
}
