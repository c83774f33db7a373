//! Core scheduling and memoization scenarios.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use pretty_assertions::assert_eq;
use simple_test_case::test_case;
use taskgraph::{FnOp, MemoStore, TaskGraph, TaskSpec, TaskValue};

use crate::{
    create_list_on_disk, op, read_list, relative_to_cwd, sum_lists_from_disk, temporary_workspace,
};

#[test_case(-1; "inline")]
#[test_case(0; "dispatcher")]
#[test_case(1; "single_worker")]
#[test_case(4; "pool")]
#[test_log::test]
fn single_task_creates_output(n_workers: i32) -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let graph = TaskGraph::new(&workspace, n_workers)?;
    let target = workspace.join("1000.dat");

    let runs = Arc::new(AtomicU32::new(0));
    graph.add_task(
        TaskSpec::builder()
            .op(create_list_on_disk(&runs))
            .args(vec![TaskValue::from(5), TaskValue::from(1000)])
            .kwargs([("target_path".to_owned(), TaskValue::path(&target))].into())
            .target_path_list(vec![target.clone()])
            .build(),
    )?;
    graph.close();
    assert!(graph.join(None)?);

    self::assert_eq!(read_list(&target)?, vec![5; 1000]);
    self::assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test_case(-1; "inline")]
#[test_case(0; "dispatcher")]
#[test_case(4; "pool")]
#[test_log::test]
fn task_chain_runs_in_dependency_order(n_workers: i32) -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let graph = TaskGraph::new(&workspace, n_workers)?;
    let a_path = workspace.join("a.dat");
    let b_path = workspace.join("b.dat");
    let result_path = workspace.join("result.dat");

    let creates = Arc::new(AtomicU32::new(0));
    let sums = Arc::new(AtomicU32::new(0));

    let task_a = graph.add_task(
        TaskSpec::builder()
            .op(create_list_on_disk(&creates))
            .args(vec![TaskValue::from(5), TaskValue::from(10)])
            .kwargs([("target_path".to_owned(), TaskValue::path(&a_path))].into())
            .target_path_list(vec![a_path.clone()])
            .build(),
    )?;
    let task_b = graph.add_task(
        TaskSpec::builder()
            .op(create_list_on_disk(&creates))
            .args(vec![TaskValue::from(10), TaskValue::from(10)])
            .kwargs([("target_path".to_owned(), TaskValue::path(&b_path))].into())
            .target_path_list(vec![b_path.clone()])
            .build(),
    )?;
    let sum_task = graph.add_task(
        TaskSpec::builder()
            .op(sum_lists_from_disk(&sums))
            .args(vec![TaskValue::path(&a_path), TaskValue::path(&b_path)])
            .kwargs([("target_path".to_owned(), TaskValue::path(&result_path))].into())
            .target_path_list(vec![result_path.clone()])
            .dependent_task_list(vec![task_a, task_b])
            .build(),
    )?;
    assert!(sum_task.join(Some(Duration::from_secs(30))));

    graph.close();
    graph.join(None)?;
    self::assert_eq!(read_list(&result_path)?, vec![15; 10]);
    Ok(())
}

#[test_log::test]
fn duplicate_submission_returns_existing_task_and_one_record() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let a_path = workspace.join("a.dat");
    let b_path = workspace.join("b.dat");
    let result_path = workspace.join("result.dat");
    let result_2_path = workspace.join("result2.dat");

    let creates = Arc::new(AtomicU32::new(0));
    let sums = Arc::new(AtomicU32::new(0));

    let graph = TaskGraph::new(&workspace, 0)?;
    let task_a = graph.add_task(
        TaskSpec::builder()
            .op(create_list_on_disk(&creates))
            .args(vec![TaskValue::from(5), TaskValue::from(10)])
            .kwargs([("target_path".to_owned(), TaskValue::path(&a_path))].into())
            .target_path_list(vec![a_path.clone()])
            .build(),
    )?;
    let task_b = graph.add_task(
        TaskSpec::builder()
            .op(create_list_on_disk(&creates))
            .args(vec![TaskValue::from(10), TaskValue::from(10)])
            .kwargs([("target_path".to_owned(), TaskValue::path(&b_path))].into())
            .target_path_list(vec![b_path.clone()])
            .build(),
    )?;
    let sum_spec = |deps: Vec<taskgraph::Task>| {
        TaskSpec::builder()
            .op(sum_lists_from_disk(&sums))
            .args(vec![TaskValue::path(&a_path), TaskValue::path(&b_path)])
            .kwargs([("target_path".to_owned(), TaskValue::path(&result_path))].into())
            .target_path_list(vec![result_path.clone()])
            .dependent_task_list(deps)
            .build()
    };
    let sum_task = graph.add_task(sum_spec(vec![task_a.clone(), task_b.clone()]))?;
    sum_task.join(None);

    // An identical resubmission hands back the existing task.
    let duplicate = graph.add_task(sum_spec(vec![task_a.clone(), task_b.clone()]))?;
    assert_eq!(duplicate, sum_task);

    let sum_2_task = graph.add_task(
        TaskSpec::builder()
            .op(sum_lists_from_disk(&sums))
            .args(vec![TaskValue::path(&a_path), TaskValue::path(&result_path)])
            .kwargs([("target_path".to_owned(), TaskValue::path(&result_2_path))].into())
            .target_path_list(vec![result_2_path.clone()])
            .dependent_task_list(vec![task_a, sum_task])
            .build(),
    )?;
    graph.close();
    graph.join(None)?;
    assert!(sum_2_task.state().is_terminal());
    assert_eq!(read_list(&result_2_path)?, vec![20; 10]);
    drop(graph);

    // Five submissions, one a duplicate: four memoized completions.
    let store = MemoStore::open_in(&workspace)?;
    assert_eq!(store.count()?, 4);
    Ok(())
}

#[test_log::test]
fn rerun_of_unchanged_workflow_is_a_noop() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let target = workspace.join("1000.dat");
    let runs = Arc::new(AtomicU32::new(0));

    let submit = |graph: &TaskGraph| {
        graph.add_task(
            TaskSpec::builder()
                .op(create_list_on_disk(&runs))
                .args(vec![TaskValue::from(5), TaskValue::from(1000)])
                .kwargs([("target_path".to_owned(), TaskValue::path(&target))].into())
                .target_path_list(vec![target.clone()])
                .build(),
        )
    };

    let graph = TaskGraph::new(&workspace, 0)?;
    submit(&graph)?;
    graph.close();
    graph.join(None)?;
    drop(graph);
    let first_mtime = std::fs::metadata(&target)?.modified()?;

    let graph = TaskGraph::new(&workspace, 0)?;
    let task = submit(&graph)?;
    graph.close();
    graph.join(None)?;
    drop(graph);

    assert_eq!(task.state(), taskgraph::TaskState::Skipped);
    assert_eq!(std::fs::metadata(&target)?.modified()?, first_mtime);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test_log::test]
fn relative_and_absolute_paths_share_identity() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let absolute = workspace.join("a.txt");
    let relative = relative_to_cwd(&absolute);
    let runs = Arc::new(AtomicU32::new(0));

    let graph = TaskGraph::new(&workspace, 0)?;
    let by_relative = graph.add_task(
        TaskSpec::builder()
            .op(crate::create_file(&runs))
            .args(vec![TaskValue::path(&relative), TaskValue::from("test value")])
            .target_path_list(vec![relative.clone()])
            .task_name("task a")
            .build(),
    )?;
    // Same submission spelled absolutely: the same task.
    let by_absolute = graph.add_task(
        TaskSpec::builder()
            .op(crate::create_file(&runs))
            .args(vec![TaskValue::path(&absolute), TaskValue::from("test value")])
            .target_path_list(vec![absolute.clone()])
            .task_name("task b")
            .build(),
    )?;
    assert_eq!(by_relative, by_absolute);
    graph.close();
    graph.join(None)?;
    drop(graph);

    // And across runs, either spelling is satisfied from the store.
    let graph = TaskGraph::new(&workspace, 0)?;
    graph.add_task(
        TaskSpec::builder()
            .op(crate::create_file(&runs))
            .args(vec![TaskValue::path(&relative), TaskValue::from("test value")])
            .target_path_list(vec![relative.clone()])
            .build(),
    )?;
    graph.close();
    graph.join(None)?;

    assert_eq!(std::fs::read_to_string(&absolute)?, "test value");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test_log::test]
fn target_path_order_is_irrelevant() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let a_path = workspace.join("a.txt");
    let b_path = workspace.join("b.txt");
    let runs = Arc::new(AtomicU32::new(0));

    let two_files = {
        let runs = Arc::clone(&runs);
        move || {
            let runs = Arc::clone(&runs);
            op("create_two_files", move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                let word = ctx.arg(0).and_then(TaskValue::as_str).unwrap_or("word");
                for index in [1, 2] {
                    let path = ctx.arg(index).and_then(TaskValue::as_path).expect("path");
                    std::fs::write(path, word)?;
                }
                Ok(())
            })
        }
    };

    let graph = TaskGraph::new(&workspace, 0)?;
    let forward = graph.add_task(
        TaskSpec::builder()
            .op(two_files())
            .args(vec![
                TaskValue::from("word"),
                TaskValue::path(&a_path),
                TaskValue::path(&b_path),
            ])
            .target_path_list(vec![a_path.clone(), b_path.clone()])
            .build(),
    )?;
    let reversed = graph.add_task(
        TaskSpec::builder()
            .op(two_files())
            .args(vec![
                TaskValue::from("word"),
                TaskValue::path(&a_path),
                TaskValue::path(&b_path),
            ])
            .target_path_list(vec![b_path.clone(), a_path.clone()])
            .build(),
    )?;
    assert_eq!(forward, reversed);
    graph.close();
    graph.join(None)?;

    assert_eq!(std::fs::read_to_string(&a_path)?, "word");
    assert_eq!(std::fs::read_to_string(&b_path)?, "word");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test_log::test]
fn rebinding_an_op_does_not_rerun_but_a_new_version_does() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let target = workspace.join("out.txt");
    let runs = Arc::new(AtomicU32::new(0));

    let write_out = |version: &str| {
        let runs = Arc::clone(&runs);
        let target = target.clone();
        Arc::new(FnOp::new("write_out", version, move |_ctx: &taskgraph::TaskContext<'_>| {
            runs.fetch_add(1, Ordering::SeqCst);
            std::fs::write(&target, "payload")?;
            Ok(())
        }))
    };

    for _ in 0..2 {
        // A fresh op instance each run: same name and version, new address.
        let graph = TaskGraph::new(&workspace, 0)?;
        graph.add_task(
            TaskSpec::builder()
                .op(write_out("1"))
                .target_path_list(vec![target.clone()])
                .build(),
        )?;
        graph.close();
        graph.join(None)?;
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Changing the version (the stand-in for edited source) re-executes.
    let graph = TaskGraph::new(&workspace, 0)?;
    graph.add_task(
        TaskSpec::builder()
            .op(write_out("2"))
            .target_path_list(vec![target.clone()])
            .build(),
    )?;
    graph.close();
    graph.join(None)?;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test_log::test]
fn targetless_tasks_always_rerun() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let runs = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let graph = TaskGraph::new(&workspace, -1)?;
        graph.add_task(
            TaskSpec::builder()
                .op({
                    let runs = Arc::clone(&runs);
                    op("side_effect", move |_ctx| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
                .build(),
        )?;
        graph.close();
        graph.join(None)?;
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test_log::test]
fn empty_task_records_nothing() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let graph = TaskGraph::new(&workspace, 0)?;
    let task = graph.add_task(TaskSpec::builder().build())?;
    graph.close();
    graph.join(None)?;
    assert_eq!(task.state(), taskgraph::TaskState::Succeeded);
    drop(graph);

    let store = MemoStore::open_in(&workspace)?;
    assert_eq!(store.count()?, 0);
    Ok(())
}

#[test_log::test]
fn join_times_out_without_cancelling() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let graph = TaskGraph::new(&workspace, 0)?;
    graph.add_task(
        TaskSpec::builder()
            .op(op("sleepy", |_ctx| {
                std::thread::sleep(Duration::from_millis(800));
                Ok(())
            }))
            .build(),
    )?;
    graph.close();

    // Far shorter than the task body: must report "not finished".
    assert!(!graph.join(Some(Duration::from_millis(50)))?);
    // The work was not cancelled; a patient join sees it finish.
    assert!(graph.join(None)?);
    Ok(())
}

#[test_log::test]
fn distinct_kwargs_are_distinct_tasks() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let runs = Arc::new(AtomicU32::new(0));
    let graph = TaskGraph::new(&workspace, -1)?;

    let noop = |runs: &Arc<AtomicU32>| {
        let runs = Arc::clone(runs);
        op("noop", move |_ctx| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };

    let task_a = graph.add_task(
        TaskSpec::builder()
            .op(noop(&runs))
            .kwargs([("content".to_owned(), TaskValue::from(vec!["this value: a"]))].into())
            .task_name("noop a")
            .build(),
    )?;
    let task_b = graph.add_task(
        TaskSpec::builder()
            .op(noop(&runs))
            .kwargs([("content".to_owned(), TaskValue::from(vec!["this value b"]))].into())
            .task_name("noop b")
            .build(),
    )?;
    graph.close();
    graph.join(None)?;

    assert_ne!(task_a, task_b);
    assert_ne!(task_a.fingerprint(), task_b.fingerprint());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn version_constant_is_populated() {
    assert!(!taskgraph::VERSION.is_empty());
}
