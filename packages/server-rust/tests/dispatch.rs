//! End-to-end dispatch behaviour of a running terminal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use terminal_core::{ResponseBody, ServiceOutput, TerminalMessage};
use terminal_server::{
    MetricsSink, RequestTags, ServiceDescriptor, TerminalConfig, TerminalServer,
};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingMetrics {
    received: AtomicU32,
    durations: Mutex<Vec<(RequestTags, u16)>>,
}

impl MetricsSink for RecordingMetrics {
    fn request_received(&self, _tags: &RequestTags) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    fn request_duration(&self, tags: &RequestTags, code: u16, _elapsed: Duration) {
        self.durations.lock().push((tags.clone(), code));
    }
}

struct Terminal {
    server: TerminalServer,
    input: mpsc::UnboundedSender<TerminalMessage>,
    output: mpsc::UnboundedReceiver<TerminalMessage>,
    metrics: Arc<RecordingMetrics>,
}

impl Terminal {
    fn start() -> Self {
        let config = TerminalConfig {
            terminal_id: "host".to_string(),
            ..TerminalConfig::default()
        };
        let (input, in_rx) = mpsc::unbounded_channel();
        let (out_tx, output) = mpsc::unbounded_channel();
        let metrics = Arc::new(RecordingMetrics::default());
        let server = TerminalServer::start_with_metrics(
            config,
            UnboundedReceiverStream::new(in_rx),
            out_tx,
            metrics.clone(),
        );
        Self {
            server,
            input,
            output,
            metrics,
        }
    }

    fn request(&self, trace_id: &str, method: &str, req: Value) {
        self.input
            .send(TerminalMessage::request(trace_id, method, req, "caller", "host"))
            .unwrap();
    }

    async fn next(&mut self) -> TerminalMessage {
        tokio::time::timeout(Duration::from_secs(120), self.output.recv())
            .await
            .expect("terminal replied in time")
            .expect("output open")
    }

    /// Collects output until `count` terminal responses have been seen.
    async fn responses(&mut self, count: usize) -> Vec<TerminalMessage> {
        let mut seen = Vec::new();
        while seen.iter().filter(|m: &&TerminalMessage| m.res.is_some()).count() < count {
            seen.push(self.next().await);
        }
        seen
    }

    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while self.server.in_flight() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("every request finalized");
    }
}

fn res(msg: &TerminalMessage) -> &ResponseBody {
    msg.res.as_ref().expect("a terminal response")
}

fn echo(method: &str) -> ServiceDescriptor {
    ServiceDescriptor::unary(method, |msg, _sink| async move {
        anyhow::Ok(ResponseBody::new(200, msg.trace_id))
    })
}

/// A service whose handler waits for a permit before answering and records
/// the order in which handlers started.
fn gated(
    method: &str,
    gate: &Arc<Semaphore>,
    started: &Arc<Mutex<Vec<String>>>,
) -> ServiceDescriptor {
    let gate = Arc::clone(gate);
    let started = Arc::clone(started);
    ServiceDescriptor::unary(method, move |msg, _sink| {
        let gate = Arc::clone(&gate);
        started.lock().push(msg.trace_id.clone());
        async move {
            gate.acquire().await?.forget();
            anyhow::Ok(ResponseBody::new(200, msg.trace_id))
        }
    })
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_method_yields_400() {
    let mut t = Terminal::start();
    t.server.add_service(echo("Echo"));

    t.request("t1", "Missing", json!({}));
    let reply = t.next().await;

    assert_eq!(reply.trace_id, "t1");
    assert_eq!(reply.method.as_deref(), Some("Missing"));
    assert_eq!(reply.target_terminal_id, "caller");
    assert_eq!(res(&reply).code, 400);
    assert_eq!(res(&reply).message, "Bad Request: Method Not Found");

    let stats = t.server.service_stats("Echo").unwrap();
    assert_eq!(stats.total_routed, 0);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn ambiguous_validators_yield_400_without_running_handlers() {
    let mut t = Terminal::start();
    let invoked = Arc::new(AtomicU32::new(0));
    for (id, prefix) in [("by-symbol", "BTC"), ("by-any", "")] {
        let invoked = Arc::clone(&invoked);
        t.server.add_service(
            ServiceDescriptor::unary("SubmitOrder", move |_msg, _sink| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok(ResponseBody::new(0, "OK")) }
            })
            .with_service_id(id)
            .with_validator(move |req| {
                req["symbol"]
                    .as_str()
                    .is_some_and(|symbol| symbol.starts_with(prefix))
            }),
        );
    }

    t.request("t1", "SubmitOrder", json!({ "symbol": "BTC-USDT" }));
    let reply = t.next().await;
    assert_eq!(res(&reply).code, 400);
    assert_eq!(res(&reply).message, "Bad Request: Ambiguous Service");
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn validator_selects_the_single_matching_service() {
    let mut t = Terminal::start();
    for account in ["alice", "bob"] {
        t.server.add_service(
            ServiceDescriptor::unary("Query", move |_msg, _sink| async move {
                anyhow::Ok(ResponseBody::new(0, account))
            })
            .with_service_id(format!("query-{account}"))
            .with_validator(move |req| req["account"] == account),
        );
    }

    t.request("t1", "Query", json!({ "account": "bob" }));
    t.request("t2", "Query", json!({ "account": "carol" }));
    let replies = t.responses(2).await;
    let by_trace: HashMap<&str, &ResponseBody> =
        replies.iter().map(|m| (m.trace_id.as_str(), res(m))).collect();

    assert_eq!(by_trace["t1"].message, "bob");
    assert_eq!(by_trace["t2"].code, 400);
    assert_eq!(by_trace["t2"].message, "Bad Request: No Matching Service");
    t.settle().await;
    assert_eq!(t.server.service_stats("query-bob").unwrap().total_processed, 1);
    assert_eq!(t.server.service_stats("query-alice").unwrap().total_routed, 0);
}

// ---------------------------------------------------------------------------
// Admission and scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capacity_overflow_yields_503_and_queue_never_exceeds_capacity() {
    let mut t = Terminal::start();
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(Mutex::new(Vec::new()));
    t.server.add_service(
        gated("Slow", &gate, &started)
            .with_concurrency(1)
            .with_capacity(2),
    );

    for trace_id in ["a", "b", "c", "d"] {
        t.request(trace_id, "Slow", json!({}));
    }

    let rejected = t.next().await;
    assert_eq!(rejected.trace_id, "d");
    assert_eq!(res(&rejected).code, 503);
    assert_eq!(res(&rejected).message, "Service Unavailable");

    let stats = t.server.service_stats("Slow").unwrap();
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.pending, 2);

    gate.add_permits(3);
    let replies = t.responses(3).await;
    let order: Vec<&str> = replies.iter().map(|m| m.trace_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    t.settle().await;
}

#[tokio::test]
async fn freed_slots_go_to_the_longest_waiting_request() {
    let mut t = Terminal::start();
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(Mutex::new(Vec::new()));
    t.server
        .add_service(gated("Serial", &gate, &started).with_concurrency(1));

    for trace_id in ["A", "B", "C"] {
        t.request(trace_id, "Serial", json!({}));
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while t.server.service_stats("Serial").unwrap().pending < 2 || started.lock().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("B and C queue behind A");
    assert_eq!(*started.lock(), vec!["A"]);

    gate.add_permits(1);
    assert_eq!(t.next().await.trace_id, "A");
    gate.add_permits(1);
    assert_eq!(t.next().await.trace_id, "B");
    gate.add_permits(1);
    assert_eq!(t.next().await.trace_id, "C");

    assert_eq!(*started.lock(), vec!["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_reach_queued_requests_only() {
    let mut t = Terminal::start();
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(Mutex::new(Vec::new()));
    t.server
        .add_service(gated("Serial", &gate, &started).with_concurrency(1));

    t.request("running", "Serial", json!({}));
    t.request("queued", "Serial", json!({}));

    // Past one heartbeat period, well inside the first-output window.
    tokio::time::sleep(Duration::from_secs(12)).await;
    gate.add_permits(2);
    let messages = t.responses(2).await;

    let mut by_trace: HashMap<&str, Vec<&TerminalMessage>> = HashMap::new();
    for msg in &messages {
        by_trace.entry(msg.trace_id.as_str()).or_default().push(msg);
    }

    let running = &by_trace["running"];
    assert_eq!(running.len(), 1);
    assert!(running[0].res.is_some());

    let queued = &by_trace["queued"];
    let (last, heartbeats) = queued.split_last().unwrap();
    assert!(heartbeats.len() >= 2, "got {} heartbeats", heartbeats.len());
    assert!(heartbeats.iter().all(|m| m.is_heartbeat()));
    assert!(heartbeats.iter().all(|m| m.source_terminal_id == "host"));
    assert_eq!(res(last).code, 200);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn silent_handler_times_out_with_500() {
    let mut t = Terminal::start();
    t.server.add_service(ServiceDescriptor::new("Hang", |_msg, _sink| {
        futures_util::stream::pending::<anyhow::Result<ServiceOutput>>()
    }));

    t.request("t1", "Hang", json!({}));
    let reply = t.next().await;

    assert_eq!(res(&reply).code, 500);
    assert!(
        res(&reply).message.contains("Timeout"),
        "{}",
        res(&reply).message
    );
    t.settle().await;
    assert_eq!(t.metrics.durations.lock()[0].1, 500);
    assert_eq!(t.server.service_stats("Hang").unwrap().total_processed, 1);
}

#[tokio::test]
async fn panicking_handler_does_not_block_other_requests() {
    let mut t = Terminal::start();
    t.server.add_service(
        ServiceDescriptor::unary("Boom", |_msg, _sink| {
            if true {
                panic!("handler exploded");
            }
            async { anyhow::Ok(ResponseBody::new(0, "unreachable")) }
        })
        .with_concurrency(1),
    );
    t.server.add_service(echo("Echo"));

    t.request("b1", "Boom", json!({}));
    t.request("b2", "Boom", json!({}));
    t.request("e1", "Echo", json!({}));
    let replies = t.responses(3).await;

    let codes: HashMap<&str, u16> = replies
        .iter()
        .map(|m| (m.trace_id.as_str(), res(m).code))
        .collect();
    assert_eq!(codes["b1"], 500);
    assert_eq!(codes["b2"], 500);
    assert_eq!(codes["e1"], 200);
    t.settle().await;
}

#[tokio::test]
async fn panicking_validator_leaves_the_terminal_serving() {
    let mut t = Terminal::start();
    t.server.add_service(echo("Bad").with_validator(|req| {
        assert!(req.get("boom").is_none(), "validator exploded");
        true
    }));
    t.server.add_service(echo("Echo"));

    t.request("p1", "Bad", json!({ "boom": true }));
    t.request("p2", "Echo", json!({}));
    let replies = t.responses(2).await;

    let by_trace: HashMap<&str, &ResponseBody> =
        replies.iter().map(|m| (m.trace_id.as_str(), res(m))).collect();
    assert_eq!(by_trace["p1"].code, 400);
    assert_eq!(by_trace["p1"].message, "Bad Request: No Matching Service");
    assert_eq!(by_trace["p2"].code, 200);
    t.settle().await;
    assert_eq!(t.metrics.durations.lock().len(), 2);
}

#[tokio::test]
async fn streamed_frames_precede_the_response() {
    let mut t = Terminal::start();
    t.server.add_service(ServiceDescriptor::new("Ticks", |_msg, sink| {
        // The write-only sink and the returned stream feed the same output.
        let _ = sink.frame(json!({ "via": "sink" }));
        futures_util::stream::iter(vec![
            anyhow::Ok(ServiceOutput::Frame(json!({ "via": "stream" }))),
            anyhow::Ok(ServiceOutput::response(0, "OK")),
        ])
    }));

    t.request("t1", "Ticks", json!({}));
    let messages = t.responses(1).await;

    let frames: Vec<&Value> = messages.iter().filter_map(|m| m.frame.as_ref()).collect();
    assert_eq!(frames, vec![&json!({ "via": "sink" }), &json!({ "via": "stream" })]);
    assert_eq!(res(messages.last().unwrap()).code, 0);
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_request_finalizes_exactly_once() {
    let mut t = Terminal::start();
    t.server.add_service(echo("Echo").with_concurrency(2).with_capacity(3));
    t.server.add_service(ServiceDescriptor::unary("Fail", |_msg, _sink| async {
        Err::<ResponseBody, _>(anyhow::anyhow!("downstream unavailable"))
    }));

    let sent = 20;
    for i in 0..sent {
        let method = match i % 4 {
            0 => "Echo",
            1 => "Fail",
            2 => "Missing",
            _ => "Echo",
        };
        t.request(&format!("t{i}"), method, json!({ "i": i }));
    }
    // Not requests: ignored without a reply or a metric.
    let mut frame = TerminalMessage::request("f", "Echo", json!({}), "caller", "host");
    frame.frame = Some(json!({}));
    t.input.send(frame).unwrap();

    let replies = t.responses(sent).await;
    t.settle().await;

    let mut per_trace: HashMap<&str, usize> = HashMap::new();
    for msg in replies.iter().filter(|m| m.res.is_some()) {
        *per_trace.entry(msg.trace_id.as_str()).or_default() += 1;
    }
    assert_eq!(per_trace.len(), sent);
    assert!(per_trace.values().all(|&n| n == 1));

    assert_eq!(t.metrics.received.load(Ordering::SeqCst), 20);
    let durations = t.metrics.durations.lock();
    assert_eq!(durations.len(), sent);
    assert!(durations
        .iter()
        .all(|(tags, _)| tags.target_terminal_id == "host" && tags.source_terminal_id == "caller"));
    assert_eq!(t.server.in_flight(), 0);
}

#[tokio::test]
async fn disposed_terminal_stops_replying() {
    let mut t = Terminal::start();
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(Mutex::new(Vec::new()));
    t.server.add_service(gated("Slow", &gate, &started));

    t.request("t1", "Slow", json!({}));
    tokio::time::timeout(Duration::from_secs(5), async {
        while started.lock().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("handler started");

    t.server.dispose();
    t.server.join().await;
    gate.add_permits(1);
    let late = TerminalMessage::request("t2", "Slow", json!({}), "caller", "host");
    assert!(t.input.send(late).is_err());

    t.settle().await;
    assert_eq!(t.server.in_flight(), 0);
    let closed = tokio::time::timeout(Duration::from_secs(5), t.output.recv())
        .await
        .expect("output closes after disposal");
    assert!(closed.is_none());
    assert!(t.metrics.durations.lock().is_empty());
}
