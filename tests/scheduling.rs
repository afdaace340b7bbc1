mod common;

use serde_json::json;
use std::sync::Arc;

use common::{completed, engine, engine_with, field, numbers, Record};
use nodeflow::runtime::RunStatus;
use nodeflow::workflow::{Node, Workflow, WorkflowRegistry};

fn even_sum() -> Workflow {
    Workflow::new("wf-even-sum", "Even sum")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("Even", "filter").parameters(json!({"condition": "={{ $json.n % 2 == 0 }}"})))
        .node(Node::new("Sum", "summarize").parameters(json!({"field": "n", "operation": "sum"})))
        .connect("Start", "Even")
        .connect("Even", "Sum")
}

#[tokio::test]
async fn filter_then_sum() {
    let report = completed(engine().start_run(&even_sum(), numbers(&[1, 2, 3, 4, 5, 6])).await.unwrap());

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(field(&report.node_items("Even"), "n"), vec![json!(2), json!(4), json!(6)]);
    assert_eq!(field(&report.node_items("Sum"), "sum"), vec![json!(12)]);
    assert_eq!(report.last_node_executed.as_deref(), Some("Sum"));
    assert_eq!(report.result_items().len(), 1);
}

#[tokio::test]
async fn linear_order_is_stable_across_runs() {
    let record = Record::default();
    let engine = engine_with(vec![Arc::new(record.clone())], Arc::new(WorkflowRegistry::new()));
    let workflow = Workflow::new("wf-line", "Line")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("Third", "record"))
        .node(Node::new("First", "record"))
        .node(Node::new("Second", "record"))
        .connect("Start", "First")
        .connect("First", "Second")
        .connect("Second", "Third");

    for _ in 0..3 {
        let report = completed(engine.start_run(&workflow, numbers(&[1])).await.unwrap());
        assert!(report.is_success());
    }
    let log = record.log();
    assert_eq!(log.len(), 9);
    for run in log.chunks(3) {
        assert_eq!(run, ["First", "Second", "Third"]);
    }
}

#[tokio::test]
async fn sibling_branches_follow_connection_order() {
    let record = Record::default();
    let engine = engine_with(vec![Arc::new(record.clone())], Arc::new(WorkflowRegistry::new()));
    let workflow = Workflow::new("wf-fork", "Fork")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("A", "record"))
        .node(Node::new("B", "record"))
        .connect("Start", "B")
        .connect("Start", "A");

    completed(engine.start_run(&workflow, numbers(&[1])).await.unwrap());
    assert_eq!(record.log(), vec!["B", "A"]);
}

#[tokio::test]
async fn fan_in_waits_for_both_inputs() {
    let record = Record::default();
    let engine = engine_with(vec![Arc::new(record.clone())], Arc::new(WorkflowRegistry::new()));
    let workflow = Workflow::new("wf-join", "Join")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("Left", "record"))
        .node(Node::new("Slow", "noop"))
        .node(Node::new("Right", "record"))
        .node(Node::new("Join", "merge"))
        .connect("Start", "Left")
        .connect("Start", "Slow")
        .connect("Slow", "Right")
        .connect_ports("Left", 0, "Join", 0)
        .connect_ports("Right", 0, "Join", 1);

    let report = completed(engine.start_run(&workflow, numbers(&[1, 2])).await.unwrap());
    assert!(report.is_success());
    assert_eq!(report.run_count("Join"), 1);
    assert_eq!(report.node_items("Join").len(), 4);

    let join = report.run_data.latest("Join").unwrap();
    assert_eq!(join.source[0][0].node, "Left");
    assert_eq!(join.source[1][0].node, "Right");
}

#[tokio::test]
async fn fan_in_with_an_empty_required_input_is_skipped() {
    let workflow = Workflow::new("wf-join-empty", "Join")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("None", "filter").parameters(json!({"condition": "={{ $json.n > 100 }}"})))
        .node(Node::new("All", "noop"))
        .node(Node::new("Join", "merge"))
        .connect("Start", "None")
        .connect("Start", "All")
        .connect_ports("None", 0, "Join", 0)
        .connect_ports("All", 0, "Join", 1);

    let report = completed(engine().start_run(&workflow, numbers(&[1, 2])).await.unwrap());
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.run_count("Join"), 0);
    assert_eq!(report.skipped, vec!["Join".to_string()]);
}

#[tokio::test]
async fn false_branch_only() {
    let record = Record::default();
    let engine = engine_with(vec![Arc::new(record.clone())], Arc::new(WorkflowRegistry::new()));
    let workflow = Workflow::new("wf-branch", "Branch")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("Check", "if").parameters(json!({"condition": "={{ $json.n > 10 }}"})))
        .node(Node::new("NodeA", "record"))
        .node(Node::new("NodeB", "record"))
        .node(Node::new("AfterA", "noop"))
        .connect_ports("Start", 0, "Check", 0)
        .connect_ports("Check", 0, "NodeA", 0)
        .connect_ports("Check", 1, "NodeB", 0)
        .connect("NodeA", "AfterA");

    let report = completed(engine.start_run(&workflow, numbers(&[3])).await.unwrap());
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(record.log(), vec!["NodeB"]);
    assert_eq!(report.run_count("NodeB"), 1);
    assert_eq!(report.run_count("NodeA"), 0);
    assert!(report.skipped.contains(&"NodeA".to_string()));
    assert!(report.skipped.contains(&"AfterA".to_string()));
}

#[tokio::test]
async fn disabled_nodes_pass_items_through() {
    let workflow = Workflow::new("wf-disabled", "Disabled")
        .node(Node::new("Start", "trigger"))
        .node(
            Node::new("Drop", "filter")
                .parameters(json!({"condition": "={{ false }}"}))
                .disabled(true),
        )
        .connect("Start", "Drop");

    let report = completed(engine().start_run(&workflow, numbers(&[1, 2])).await.unwrap());
    assert_eq!(field(&report.node_items("Drop"), "n"), vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn parallel_siblings_record_distinct_slots() {
    let mut config = common::config();
    config.max_parallel_nodes = 4;
    let engine = nodeflow::ExecutionEngine::new(config);
    let workflow = Workflow::new("wf-parallel", "Parallel")
        .node(Node::new("Start", "trigger"))
        .node(Node::new("A", "set").parameters(json!({"values": {"branch": "a"}})))
        .node(Node::new("B", "set").parameters(json!({"values": {"branch": "b"}})))
        .node(Node::new("C", "set").parameters(json!({"values": {"branch": "c"}})))
        .connect("Start", "A")
        .connect("Start", "B")
        .connect("Start", "C");

    let report = completed(engine.start_run(&workflow, numbers(&[1])).await.unwrap());
    for (node, branch) in [("A", "a"), ("B", "b"), ("C", "c")] {
        assert_eq!(report.run_count(node), 1);
        assert_eq!(field(&report.node_items(node), "branch"), vec![json!(branch)]);
    }
}
