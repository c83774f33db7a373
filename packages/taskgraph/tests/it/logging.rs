//! Log bridging from workers back to the graph's sink.

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use taskgraph::{LogRecord, LogSink, TaskGraph, TaskGraphConfig, TaskSpec};

use crate::{op, temporary_workspace};

fn collecting_sink() -> (LogSink, Arc<Mutex<Vec<LogRecord>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink: LogSink = {
        let seen = Arc::clone(&seen);
        Arc::new(move |record: &LogRecord| {
            seen.lock().unwrap().push(record.clone());
        })
    };
    (sink, seen)
}

#[test_log::test]
fn worker_records_reach_the_sink_with_their_origin() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let (sink, seen) = collecting_sink();

    let graph = TaskGraph::with_config(
        TaskGraphConfig::builder()
            .workspace_dir(&workspace)
            .n_workers(1)
            .log_sink(sink)
            .build(),
    )?;
    graph.add_task(
        TaskSpec::builder()
            .op(op("says_hello", |ctx| {
                ctx.log().info("foo.hello.world", "hello");
                Ok(())
            }))
            .build(),
    )?;
    graph.close();
    graph.join(None)?;
    graph.terminate();

    let seen = seen.lock().unwrap();
    let record = seen
        .iter()
        .find(|record| record.target == "foo.hello.world")
        .expect("bridged record");
    assert_eq!(record.message, "hello");
    // The record names the worker that produced it, not this thread.
    let here = std::thread::current();
    let parent = here.name().unwrap_or("unnamed");
    assert_ne!(record.origin, parent);
    assert!(
        record.origin.starts_with("taskgraph-worker-"),
        "unexpected origin: {}",
        record.origin
    );
    Ok(())
}

#[test_log::test]
fn records_from_inline_tasks_are_bridged_too() -> color_eyre::Result<()> {
    let (_dir, workspace) = temporary_workspace();
    let (sink, seen) = collecting_sink();

    let graph = TaskGraph::with_config(
        TaskGraphConfig::builder()
            .workspace_dir(&workspace)
            .n_workers(-1)
            .log_sink(sink)
            .build(),
    )?;
    graph.add_task(
        TaskSpec::builder()
            .op(op("chatty", |ctx| {
                ctx.log().warn("app", "inline record");
                Ok(())
            }))
            .build(),
    )?;
    graph.close();
    graph.join(None)?;
    graph.terminate();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].message, "inline record");
    Ok(())
}
