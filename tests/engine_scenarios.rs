//! End-to-end scenarios over the in-memory fabric.
//!
//! Tasks are driven deterministically: `drain` delivers queued messages
//! one at a time (queues in name order, FIFO within a queue), so every
//! test observes an exact sequence of partial executions.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use redflow::model::internal_request_queue_id;
use redflow::queue::{MemoryQueueConnection, Queue as _, QueueConnection as _};
use redflow::store::MemoryBackend;
use redflow::{
    handler_fn, selector_fn, splitter_fn, BufferingEventHandler, EngineConfig, Event,
    FlowDefinition, FlowRuntime, NodeHandler, Phase, Request, RequestProgress, RequestType, Task,
};

struct Harness {
    runtime: Arc<FlowRuntime>,
    conn: Arc<MemoryQueueConnection>,
    events: Arc<BufferingEventHandler>,
    backend: MemoryBackend,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn harness(flow: FlowDefinition) -> Harness {
    init_tracing();
    let events = Arc::new(BufferingEventHandler::new());
    let config = EngineConfig::builder()
        .worker_concurrency(2)
        .retry_queue_count(2)
        .build()
        .unwrap();
    let (runtime, conn, backend) = FlowRuntime::in_memory(config, events.clone()).unwrap();
    runtime.register(flow).await.unwrap();
    runtime.enter_worker_mode().await.unwrap();
    Harness {
        runtime,
        conn,
        events,
        backend,
    }
}

/// Handler that records `(node, iteration, input)` and emits
/// `<node>-out`.
fn recording(node: &'static str, log: Arc<Mutex<Vec<(String, Option<usize>, String)>>>) -> Arc<dyn NodeHandler> {
    handler_fn(move |ctx, input| {
        let log = log.clone();
        async move {
            log.lock().push((
                node.to_string(),
                ctx.iteration,
                String::from_utf8_lossy(&input).into_owned(),
            ));
            Ok(Bytes::from(format!("{node}-out")))
        }
    })
}

fn partial_deliveries(conn: &MemoryQueueConnection) -> usize {
    conn.deliveries()
        .iter()
        .filter_map(|(_, payload)| serde_json::from_slice::<Task>(payload).ok())
        .filter(|task| task.request_type == RequestType::Partial)
        .count()
}

fn assert_clean(backend: &MemoryBackend) {
    assert_eq!(backend.state_key_count(), 0, "state namespace not cleaned");
    assert_eq!(backend.data_key_count(), 0, "data namespace not cleaned");
}

#[tokio::test]
async fn serial_three_node_flow_runs_each_node_once() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let flow = FlowDefinition::builder("serial")
        .node("a", recording("a", log.clone()))
        .unwrap()
        .node("b", recording("b", log.clone()))
        .unwrap()
        .node("c", recording("c", log.clone()))
        .unwrap()
        .edge("a", "b")
        .edge("b", "c")
        .build()
        .unwrap();
    let h = harness(flow).await;

    let request = Request::new("serial", "r1", Bytes::from_static(b"seed"));
    h.runtime.execute(&request).await.unwrap();
    h.conn.drain().await;

    let entries = log.lock().clone();
    assert_eq!(
        entries,
        vec![
            ("a".to_string(), None, "seed".to_string()),
            ("b".to_string(), None, "a-out".to_string()),
            ("c".to_string(), None, "b-out".to_string()),
        ]
    );
    assert_eq!(partial_deliveries(&h.conn), 3);

    let events = h.events.events();
    assert!(matches!(events.first(), Some(Event::RequestStarted { .. })));
    assert!(matches!(events.last(), Some(Event::RequestFinished { .. })));
    let completions = events
        .iter()
        .filter(|e| matches!(e, Event::NodeCompleted { .. }))
        .count();
    assert_eq!(completions, 3);

    assert_clean(&h.backend);
    assert_eq!(h.conn.acked(), h.conn.published());
    assert_eq!(h.conn.dropped(), 0);
}

async fn run_fan_out_fan_in(first: &'static str, second: &'static str) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let flow = FlowDefinition::builder("diamond")
        .node("a", recording("a", log.clone()))
        .unwrap()
        .node(first, recording(first, log.clone()))
        .unwrap()
        .node(second, recording(second, log.clone()))
        .unwrap()
        .node("z-join", recording("z-join", log.clone()))
        .unwrap()
        .edge("a", first)
        .edge("a", second)
        .edge(first, "z-join")
        .edge(second, "z-join")
        .build()
        .unwrap();
    let h = harness(flow).await;

    let request = Request::new("diamond", "r1", Bytes::from_static(b"seed"));
    h.runtime.execute(&request).await.unwrap();
    h.conn.drain().await;

    let entries = log.lock().clone();
    let joins: Vec<_> = entries.iter().filter(|(n, _, _)| n == "z-join").collect();
    assert_eq!(joins.len(), 1, "join must run exactly once");

    // The join sees both parent outputs, keyed by parent id.
    let input: serde_json::Value = serde_json::from_str(&joins[0].2).unwrap();
    assert_eq!(input[first], format!("{first}-out"));
    assert_eq!(input[second], format!("{second}-out"));

    // Both branches ran, after a and before the join.
    let order: Vec<&str> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(order[0], "a");
    assert_eq!(order[3], "z-join");
    assert_eq!(entries.len(), 4);
    assert_clean(&h.backend);
}

#[tokio::test]
async fn fan_out_fan_in_joins_once_either_completion_order() {
    // Lexicographic scheduling makes the lower-named branch finish
    // first; the two namings put each declared branch on either side
    // of the join's final decrement.
    run_fan_out_fan_in("b", "c").await;
    run_fan_out_fan_in("y", "x").await;
}

#[tokio::test]
async fn condition_skips_the_dead_branch() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let selector = selector_fn(|output| {
        if output.ends_with(b"left") {
            vec!["b".to_string()]
        } else {
            vec!["c".to_string()]
        }
    });
    let chooser = handler_fn(|_ctx, _input| async move { Ok(Bytes::from_static(b"go-left")) });
    let flow = FlowDefinition::builder("condition")
        .branch("a", chooser, selector)
        .unwrap()
        .node("b", recording("b", log.clone()))
        .unwrap()
        .node("c", recording("c", log.clone()))
        .unwrap()
        .node("d", recording("d", log.clone()))
        .unwrap()
        .edge("a", "b")
        .edge("a", "c")
        .edge("b", "d")
        .edge("c", "d")
        .build()
        .unwrap();
    let h = harness(flow).await;

    let request = Request::new("condition", "r1", Bytes::from_static(b"seed"));
    h.runtime.execute(&request).await.unwrap();
    h.conn.drain().await;

    let entries = log.lock().clone();
    let names: Vec<&str> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(names, ["b", "d"], "c is skipped, d still joins once");

    // With c skipped, d has a single live parent and receives its
    // output directly.
    let d_input = &entries[1].2;
    assert_eq!(d_input, "b-out");
    assert_clean(&h.backend);
}

#[tokio::test]
async fn loop_runs_one_body_instance_per_item_then_the_terminator() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let splitter = splitter_fn(|input| {
        let items: Vec<String> = serde_json::from_slice(input)?;
        Ok(items.into_iter().map(|s| Bytes::from(s.into_bytes())).collect())
    });
    let body = handler_fn(|ctx, input| async move {
        let item = String::from_utf8_lossy(&input).into_owned();
        Ok(Bytes::from(format!("{}:{item}", ctx.iteration.unwrap())))
    });
    let flow = FlowDefinition::builder("looped")
        .node("x", body)
        .unwrap()
        .node("t", recording("t", log.clone()))
        .unwrap()
        .for_each("l", splitter, "x")
        .unwrap()
        .edge("x", "t")
        .build()
        .unwrap();
    let h = harness(flow).await;

    let request = Request::new("looped", "r1", Bytes::from(r#"["p","q","r"]"#));
    h.runtime.execute(&request).await.unwrap();
    h.conn.drain().await;

    let entries = log.lock().clone();
    assert_eq!(entries.len(), 1, "terminator runs once");
    let aggregate: Vec<String> = serde_json::from_str(&entries[0].2).unwrap();
    assert_eq!(aggregate, ["0:p", "1:q", "2:r"]);
    assert_clean(&h.backend);
}

#[tokio::test]
async fn zero_iteration_loop_still_reaches_the_terminator() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let splitter = splitter_fn(|_input| Ok(Vec::new()));
    let body = handler_fn(|_ctx, input| async move { Ok(input) });
    let flow = FlowDefinition::builder("empty-loop")
        .node("x", body)
        .unwrap()
        .node("t", recording("t", log.clone()))
        .unwrap()
        .for_each("l", splitter, "x")
        .unwrap()
        .edge("x", "t")
        .build()
        .unwrap();
    let h = harness(flow).await;

    h.runtime
        .execute(&Request::new("empty-loop", "r1", Bytes::new()))
        .await
        .unwrap();
    h.conn.drain().await;

    let entries = log.lock().clone();
    assert_eq!(entries.len(), 1);
    let aggregate: Vec<String> = serde_json::from_str(&entries[0].2).unwrap();
    assert!(aggregate.is_empty());
    assert_clean(&h.backend);
}

fn serial_five(log: &Arc<Mutex<Vec<(String, Option<usize>, String)>>>) -> FlowDefinition {
    FlowDefinition::builder("five")
        .node("n1", recording("n1", log.clone()))
        .unwrap()
        .node("n2", recording("n2", log.clone()))
        .unwrap()
        .node("n3", recording("n3", log.clone()))
        .unwrap()
        .node("n4", recording("n4", log.clone()))
        .unwrap()
        .node("n5", recording("n5", log.clone()))
        .unwrap()
        .edge("n1", "n2")
        .edge("n2", "n3")
        .edge("n3", "n4")
        .edge("n4", "n5")
        .build()
        .unwrap()
}

#[tokio::test]
async fn pause_holds_progress_and_resume_completes() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let h = harness(serial_five(&log)).await;
    let request = Request::new("five", "r1", Bytes::from_static(b"seed"));

    h.runtime.execute(&request).await.unwrap();
    assert!(h.conn.deliver_one().await); // NEW
    assert!(h.conn.deliver_one().await); // partial: n1

    // PAUSE lands behind n2's partial and ahead of n3's, so it takes
    // effect after node 2 completes.
    h.runtime.pause(&request).await.unwrap();
    assert!(h.conn.deliver_one().await); // partial: n2
    assert!(h.conn.deliver_one().await); // PAUSE

    // The already-enqueued partial for n3 is acked without advancing.
    let idle = h.conn.drain().await;
    assert_eq!(idle, 1);
    assert_eq!(log.lock().len(), 2);

    let progress: RequestProgress =
        serde_json::from_str(&h.runtime.flow_state("five", "r1").await.unwrap()).unwrap();
    assert_eq!(progress.phase, Phase::Paused);
    assert_eq!(progress.nodes["n1"], redflow::NodeState::Completed);
    assert_eq!(progress.nodes["n2"], redflow::NodeState::Completed);
    assert_eq!(progress.nodes["n3"], redflow::NodeState::Pending);

    // Nothing moves while paused.
    assert_eq!(h.conn.drain().await, 0);
    assert_eq!(log.lock().len(), 2);

    // RESUME republishes the ready frontier and the flow completes.
    h.runtime.resume(&request).await.unwrap();
    h.conn.drain().await;
    let names: Vec<String> = log.lock().iter().map(|(n, _, _)| n.clone()).collect();
    assert_eq!(names, ["n1", "n2", "n3", "n4", "n5"]);
    assert_clean(&h.backend);
}

#[tokio::test]
async fn stop_finishes_nothing_further_and_cleans_up() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let flow = FlowDefinition::builder("serial")
        .node("a", recording("a", log.clone()))
        .unwrap()
        .node("b", recording("b", log.clone()))
        .unwrap()
        .node("c", recording("c", log.clone()))
        .unwrap()
        .edge("a", "b")
        .edge("b", "c")
        .build()
        .unwrap();
    let h = harness(flow).await;
    let request = Request::new("serial", "r1", Bytes::from_static(b"seed"));

    h.runtime.execute(&request).await.unwrap();
    assert!(h.conn.deliver_one().await); // NEW
    assert!(h.conn.deliver_one().await); // partial: a
    h.runtime.stop(&request).await.unwrap();
    h.conn.drain().await; // partial b (in flight before STOP), STOP, then b's orphaned successor partial

    // The node in flight when STOP was published still completed; no
    // successor ran afterwards.
    let names: Vec<String> = log.lock().iter().map(|(n, _, _)| n.clone()).collect();
    assert_eq!(names, ["a", "b"]);

    // Cleanup ran: the request is no longer live.
    assert!(h.runtime.flow_state("serial", "r1").await.is_err());
    assert_clean(&h.backend);
    assert_eq!(h.conn.acked() + h.conn.dropped(), h.conn.published());
}

#[tokio::test]
async fn duplicate_new_task_starts_the_request_once() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let flow = FlowDefinition::builder("serial")
        .node("a", recording("a", log.clone()))
        .unwrap()
        .build()
        .unwrap();
    let h = harness(flow).await;
    let request = Request::new("serial", "r1", Bytes::from_static(b"seed"));

    h.runtime.execute(&request).await.unwrap();
    h.runtime.execute(&request).await.unwrap();
    h.conn.drain().await;

    assert_eq!(log.lock().len(), 1, "node ran once despite duplicate NEW");
    let started = h
        .events
        .events()
        .iter()
        .filter(|e| matches!(e, Event::RequestStarted { .. }))
        .count();
    assert_eq!(started, 1);
}

#[tokio::test]
async fn duplicate_partial_does_not_double_run_any_node() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let flow = FlowDefinition::builder("serial")
        .node("a", recording("a", log.clone()))
        .unwrap()
        .node("b", recording("b", log.clone()))
        .unwrap()
        .edge("a", "b")
        .build()
        .unwrap();
    let h = harness(flow).await;
    let request = Request::new("serial", "r1", Bytes::from_static(b"seed"));

    h.runtime.execute(&request).await.unwrap();
    assert!(h.conn.deliver_one().await); // NEW enqueues a's partial

    // Inject a duplicate of the pending partial.
    let queue = h
        .conn
        .open_queue(&internal_request_queue_id("serial"))
        .await
        .unwrap();
    let dup = Task {
        flow_name: "serial".into(),
        request_id: "r1".into(),
        body: String::new(),
        header: Default::default(),
        raw_query: String::new(),
        query: Default::default(),
        request_type: RequestType::Partial,
    };
    queue.publish(serde_json::to_vec(&dup).unwrap()).await.unwrap();

    h.conn.drain().await;

    let mut names: Vec<String> = log.lock().iter().map(|(n, _, _)| n.clone()).collect();
    names.sort();
    assert_eq!(names, ["a", "b"], "each node advanced exactly once");
    assert_clean(&h.backend);
}

#[tokio::test]
async fn empty_dag_finishes_immediately_without_partials() {
    let flow = FlowDefinition::builder("empty").build().unwrap();
    let h = harness(flow).await;

    h.runtime
        .execute(&Request::new("empty", "r1", Bytes::new()))
        .await
        .unwrap();
    h.conn.drain().await;

    assert_eq!(partial_deliveries(&h.conn), 0);
    let events = h.events.events();
    assert!(matches!(events.first(), Some(Event::RequestStarted { .. })));
    assert!(matches!(events.last(), Some(Event::RequestFinished { .. })));
    assert_clean(&h.backend);
}

#[tokio::test]
async fn single_node_flow_consumes_exactly_one_partial() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let flow = FlowDefinition::builder("single")
        .node("only", recording("only", log.clone()))
        .unwrap()
        .build()
        .unwrap();
    let h = harness(flow).await;

    h.runtime
        .execute(&Request::new("single", "r1", Bytes::from_static(b"seed")))
        .await
        .unwrap();
    h.conn.drain().await;

    assert_eq!(partial_deliveries(&h.conn), 1);
    assert_eq!(log.lock().len(), 1);
    assert_clean(&h.backend);
}

#[tokio::test]
async fn failing_node_fails_the_request_without_retry() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let boom = handler_fn(|_ctx, _input| async move { anyhow::bail!("user function exploded") });
    let flow = FlowDefinition::builder("failing")
        .node("a", recording("a", log.clone()))
        .unwrap()
        .node("b", boom)
        .unwrap()
        .node("c", recording("c", log.clone()))
        .unwrap()
        .edge("a", "b")
        .edge("b", "c")
        .build()
        .unwrap();
    let h = harness(flow).await;
    let request = Request::new("failing", "r1", Bytes::from_static(b"seed"));

    h.runtime.execute(&request).await.unwrap();
    h.conn.drain().await;

    // b ran once (no node-level retry), c never ran.
    let names: Vec<String> = log.lock().iter().map(|(n, _, _)| n.clone()).collect();
    assert_eq!(names, ["a"]);
    let failed = h
        .events
        .events()
        .iter()
        .filter(|e| matches!(e, Event::RequestFailed { .. }))
        .count();
    assert_eq!(failed, 1);

    // The terminal phase stays visible; data blobs are released.
    let progress: RequestProgress =
        serde_json::from_str(&h.runtime.flow_state("failing", "r1").await.unwrap()).unwrap();
    assert_eq!(progress.phase, Phase::Failed);
    assert_eq!(progress.nodes["b"], redflow::NodeState::Failed);
    assert_eq!(h.backend.data_key_count(), 0);

    // Failure is acked, not pushed: nothing was dropped.
    assert_eq!(h.conn.dropped(), 0);
    assert_eq!(h.conn.acked(), h.conn.published());
}

#[tokio::test]
async fn concurrent_sibling_failure_halts_the_in_flight_advance() {
    // a -> {b, c} -> d, with b and c claimed by two concurrent
    // partial executions. b fails while c's handler is still running:
    // once the request is failed, c's result must be discarded, with
    // no completion event, no data write, and no successor enqueued.
    init_tracing();
    let events = Arc::new(BufferingEventHandler::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let c_started = Arc::new(tokio::sync::Notify::new());

    let gate = c_started.clone();
    let failer = handler_fn(move |_ctx, _input| {
        let gate = gate.clone();
        async move {
            // Fail only once the sibling has been claimed and is
            // mid-execution.
            gate.notified().await;
            anyhow::bail!("sibling exploded")
        }
    });

    let gate = c_started.clone();
    let failure_seen = events.clone();
    let log_c = log.clone();
    let straggler = handler_fn(move |_ctx, _input| {
        let gate = gate.clone();
        let events = failure_seen.clone();
        let log = log_c.clone();
        async move {
            log.lock().push(("c".to_string(), None, String::new()));
            gate.notify_one();
            // Return only after the request is terminally failed.
            while !events
                .events()
                .iter()
                .any(|e| matches!(e, Event::RequestFailed { .. }))
            {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            Ok(Bytes::from_static(b"c-out"))
        }
    });

    let flow = FlowDefinition::builder("race")
        .node("a", recording("a", log.clone()))
        .unwrap()
        .node("b", failer)
        .unwrap()
        .node("c", straggler)
        .unwrap()
        .node("d", recording("d", log.clone()))
        .unwrap()
        .edge("a", "b")
        .edge("a", "c")
        .edge("b", "d")
        .edge("c", "d")
        .build()
        .unwrap();

    let config = EngineConfig::builder()
        .worker_concurrency(2)
        .retry_queue_count(2)
        .build()
        .unwrap();
    let (runtime, conn, backend) = FlowRuntime::in_memory(config, events.clone()).unwrap();
    runtime.register(flow).await.unwrap();
    runtime.enter_worker_mode().await.unwrap();

    let request = Request::new("race", "r1", Bytes::from_static(b"seed"));
    runtime.execute(&request).await.unwrap();
    assert!(conn.deliver_one().await); // NEW
    assert!(conn.deliver_one().await); // partial: a, enqueues b's and c's partials

    // Two workers, one request: the first claims b, the second claims c.
    let worker_one = runtime.create_executor(&request).await.unwrap();
    let worker_two = runtime.create_executor(&request).await.unwrap();
    let (one, two) = tokio::join!(worker_one.partial_execute(), worker_two.partial_execute());
    one.unwrap();
    two.unwrap();

    let evs = events.events();
    assert_eq!(
        evs.iter().filter(|e| matches!(e, Event::RequestFailed { .. })).count(),
        1
    );
    // Neither the failed node nor the discarded sibling completed.
    assert!(!evs.iter().any(
        |e| matches!(e, Event::NodeCompleted { node, .. } if node == "b" || node == "c")
    ));

    // No orphan blob: the failure's data cleanup is final.
    assert_eq!(backend.data_key_count(), 0);

    let progress: RequestProgress =
        serde_json::from_str(&runtime.flow_state("race", "r1").await.unwrap()).unwrap();
    assert_eq!(progress.phase, Phase::Failed);
    assert_eq!(progress.nodes["b"], redflow::NodeState::Failed);
    assert_eq!(progress.nodes["c"], redflow::NodeState::Skipped);
    assert_eq!(progress.nodes["d"], redflow::NodeState::Pending);

    // The partials already queued for b and c short-circuit; nothing
    // else runs and d is never enqueued or advanced.
    conn.drain().await;
    let names: Vec<String> = log.lock().iter().map(|(n, _, _)| n.clone()).collect();
    assert_eq!(names, ["a", "c"], "d must never run");
}

#[tokio::test]
async fn pause_rejects_non_running_and_resume_rejects_non_paused() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let h = harness(serial_five(&log)).await;
    let request = Request::new("five", "r1", Bytes::from_static(b"seed"));

    h.runtime.execute(&request).await.unwrap();
    assert!(h.conn.deliver_one().await); // NEW

    // Resume while running is a phase conflict.
    let executor = h.runtime.create_executor(&request).await.unwrap();
    let err = executor.resume().await.unwrap_err();
    assert!(matches!(err, redflow::EngineError::PhaseConflict { .. }));

    executor.pause().await.unwrap();
    let err = executor.pause().await.unwrap_err();
    assert!(matches!(err, redflow::EngineError::PhaseConflict { .. }));

    executor.resume().await.unwrap();
    h.conn.drain().await;
    assert_eq!(log.lock().len(), 5);
    assert_clean(&h.backend);
}
