mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{completed, engine, engine_with, numbers, Cancel, Flaky, Gate, Record};
use nodeflow::runtime::{RunOptions, RunStatus};
use nodeflow::workflow::{Node, NodeSettings, Workflow, WorkflowRegistry};

#[tokio::test]
async fn cancel_between_nodes_stops_the_run() {
    let token = CancellationToken::new();
    let record = Record::default();
    let engine = engine_with(
        vec![Arc::new(Cancel(token.clone())), Arc::new(record.clone())],
        Arc::new(WorkflowRegistry::new()),
    );
    let workflow = Workflow::new("wf-cancel", "Cancel")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("A", "cancel"))
        .node(Node::new("B", "record"))
        .connect("Start", "A")
        .connect("A", "B");

    let options = RunOptions::default().cancellation(token);
    let report = completed(engine.start_run_with(&workflow, numbers(&[1]), options).await.unwrap());

    assert_eq!(report.status, RunStatus::Canceled);
    assert_eq!(report.run_count("A"), 1);
    assert_eq!(report.node_items("A").len(), 1);
    assert_eq!(report.run_count("B"), 0);
    assert!(record.log().is_empty());
}

#[tokio::test]
async fn cancel_by_run_id() {
    let gate = Arc::new(Gate::default());
    let record = Record::default();
    let engine = engine_with(
        vec![gate.clone(), Arc::new(record.clone())],
        Arc::new(WorkflowRegistry::new()),
    );
    let workflow = Workflow::new("wf-gated", "Gated")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("A", "gate"))
        .node(Node::new("B", "record"))
        .connect("Start", "A")
        .connect("A", "B");

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start_run(&workflow, numbers(&[1])).await })
    };

    tokio::time::timeout(Duration::from_secs(5), gate.started.notified())
        .await
        .expect("gate node never started");
    let active = engine.active_runs();
    assert_eq!(active.len(), 1);
    assert!(engine.cancel(active[0]));
    gate.release.notify_one();

    let report = completed(running.await.unwrap().unwrap());
    assert_eq!(report.run_id, active[0]);
    assert_eq!(report.status, RunStatus::Canceled);
    assert_eq!(report.run_count("A"), 1);
    assert!(record.log().is_empty());
    assert!(engine.active_runs().is_empty());
}

#[tokio::test]
async fn cancelling_a_finished_run_is_a_no_op() {
    let engine = engine();
    let workflow = Workflow::new("wf-quick", "Quick")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("Next", "noop"))
        .connect("Start", "Next");

    let report = completed(engine.start_run(&workflow, numbers(&[1])).await.unwrap());
    assert!(!engine.cancel(report.run_id));
    assert_eq!(report.status, RunStatus::Success);
}

#[tokio::test]
async fn cancel_during_retry_backoff_marks_the_run_canceled() {
    let flaky = Flaky::new(100);
    let record = Record::default();
    let engine = engine_with(
        vec![flaky.clone(), Arc::new(record.clone())],
        Arc::new(WorkflowRegistry::new()),
    );
    let workflow = Workflow::new("wf-backoff", "Backoff")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("Upstream", "flaky").settings(NodeSettings {
            wait_between_tries_ms: 30_000,
            ..NodeSettings::retrying(5)
        }))
        .node(Node::new("After", "record"))
        .connect("Start", "Upstream")
        .connect("Upstream", "After");

    let token = CancellationToken::new();
    let running = {
        let engine = engine.clone();
        let options = RunOptions::default().cancellation(token.clone());
        tokio::spawn(async move { engine.start_run_with(&workflow, numbers(&[1]), options).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while flaky.attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flaky node never ran");
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("run kept waiting out the backoff")
        .unwrap()
        .unwrap();
    let report = completed(report);

    assert_eq!(report.status, RunStatus::Canceled);
    assert!(report.error.is_none());
    assert_eq!(flaky.attempts(), 1);
    assert!(record.log().is_empty());
}
