use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use super::{Agent, AgentConfig, RunBudget};
use crate::adapters::ledger::SqliteLedger;
use crate::adapters::tools::{ToolExecutor, ToolRegistry};
use crate::core::error::{OracleError, ToolInvocationError, TriageError};
use crate::core::model::{
    Conclusion, KnowledgeChunk, NewTraceStep, RunStatus, ScoredChunk, StepKind,
};
use crate::core::ports::emitter::NullEmitter;
use crate::core::ports::ledger::LedgerPort;
use crate::core::ports::oracle::{Decision, OracleContext, OraclePort};
use crate::core::ports::retriever::RetrieverPort;
use crate::core::ports::tools::{Observation, ToolDefinition, ToolFuture};
use crate::core::retry::RetryPolicy;
use crate::testing::{message, remove_db, temp_db_path};

/// What the oracle saw on each call.
#[derive(Debug, Clone)]
struct SeenContext {
    trace_len: usize,
    grounding_len: usize,
    must_conclude: bool,
}

struct ScriptedOracle {
    script: Mutex<VecDeque<Result<Decision, OracleError>>>,
    fallback: Result<Decision, OracleError>,
    seen: Mutex<Vec<SeenContext>>,
}

impl ScriptedOracle {
    fn new(script: Vec<Result<Decision, OracleError>>, fallback: Result<Decision, OracleError>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<SeenContext> {
        self.seen.lock().expect("seen lock").clone()
    }
}

impl OraclePort for ScriptedOracle {
    fn backend(&self) -> &str {
        "scripted"
    }

    fn reason<'a>(
        &'a self,
        context: OracleContext<'a>,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<Decision, OracleError>> {
        self.seen.lock().expect("seen lock").push(SeenContext {
            trace_len: context.trace.len(),
            grounding_len: context.grounding.len(),
            must_conclude: context.must_conclude,
        });
        let next = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Box::pin(async move { next })
    }
}

struct FixedRetriever {
    hits: Vec<ScoredChunk>,
}

impl RetrieverPort for FixedRetriever {
    fn retrieve<'a>(
        &'a self,
        _query: &'a str,
        k: usize,
    ) -> BoxFuture<'a, Result<Vec<ScoredChunk>, TriageError>> {
        Box::pin(async move { Ok(self.hits.iter().take(k).cloned().collect()) })
    }
}

fn runbook_hit() -> ScoredChunk {
    ScoredChunk {
        chunk: KnowledgeChunk {
            id: 1,
            source_document: "cpu.md".to_string(),
            chunk_index: 0,
            heading_path: Some("High CPU".to_string()),
            text: "Check pod_cpu_usage for the pod, then compare with its limit.".to_string(),
            embedding: Vec::new(),
        },
        similarity: 0.91,
    }
}

/// A tool that counts calls and answers from a closure.
struct StubTool {
    definition: ToolDefinition,
    calls: Arc<AtomicU32>,
    behaviour: fn(u32) -> Result<Observation, ToolInvocationError>,
    delay: Duration,
}

impl StubTool {
    fn new(name: &str, behaviour: fn(u32) -> Result<Observation, ToolInvocationError>) -> Self {
        Self {
            definition: ToolDefinition {
                name: name.to_string(),
                description: format!("stub {name}"),
                input_schema: json!({
                    "type": "object",
                    "properties": { "pod": { "type": "string" }, "namespace": { "type": "string" } },
                    "required": ["pod"],
                    "additionalProperties": false
                }),
            },
            calls: Arc::new(AtomicU32::new(0)),
            behaviour,
            delay: Duration::ZERO,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ToolExecutor for StubTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn execute<'a>(&'a self, _input: Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.behaviour)(call)
        })
    }
}

fn cpu_reading(_call: u32) -> Result<Observation, ToolInvocationError> {
    Ok(Observation::text("{container=\"app\", pod=\"podA\"} => 0.98"))
}

fn always_unreachable(_call: u32) -> Result<Observation, ToolInvocationError> {
    Err(ToolInvocationError::failed("flaky_metrics", "connection refused", true))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        multiplier: 2.0,
    }
}

fn config(budget: RunBudget) -> AgentConfig {
    AgentConfig {
        budget,
        tool_retry: fast_retry(),
        oracle_retry: fast_retry(),
        ..AgentConfig::default()
    }
}

struct Harness {
    agent: Agent,
    ledger: Arc<SqliteLedger>,
    oracle: Arc<ScriptedOracle>,
    db_path: std::path::PathBuf,
}

fn harness(
    label: &str,
    tools: Vec<StubTool>,
    oracle: ScriptedOracle,
    hits: Vec<ScoredChunk>,
    budget: RunBudget,
) -> Harness {
    let db_path = temp_db_path(label);
    let ledger = Arc::new(SqliteLedger::new(db_path.clone()));
    let oracle = Arc::new(oracle);
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).expect("register stub");
    }
    let agent = Agent::new(
        Arc::new(registry),
        oracle.clone(),
        ledger.clone(),
        Arc::new(FixedRetriever { hits }),
        Arc::new(NullEmitter),
        config(budget),
    );
    Harness {
        agent,
        ledger,
        oracle,
        db_path,
    }
}

fn call(tool: &str, input: Value) -> Result<Decision, OracleError> {
    Ok(Decision::ToolCall {
        thought: Some(format!("check {tool}")),
        tool: tool.to_string(),
        input,
    })
}

fn answer(text: &str) -> Result<Decision, OracleError> {
    Ok(Decision::FinalAnswer {
        thought: None,
        conclusion: Conclusion::from_text(text),
    })
}

#[tokio::test]
async fn cpu_alert_is_investigated_to_completion() {
    let h = harness(
        "agent-cpu",
        vec![StubTool::new("pod_cpu_usage", cpu_reading)],
        ScriptedOracle::new(
            vec![
                call("pod_cpu_usage", json!({ "pod": "podA", "namespace": "prod" })),
                answer("podA is CPU-throttled at its 1 core limit."),
            ],
            answer("unused"),
        ),
        vec![runbook_hit()],
        RunBudget::default(),
    );

    let run = h
        .agent
        .investigate(&message("job-cpu", 1), "w1")
        .await
        .expect("investigate");

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.trace.len() <= 10);
    assert!(run
        .trace
        .iter()
        .any(|step| step.tool_name() == Some("pod_cpu_usage") && step.error.is_none()));
    let kinds: Vec<StepKind> = run.trace.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![StepKind::Retrieval, StepKind::ToolCall, StepKind::FinalAnswer]
    );
    let sequence: Vec<u32> = run.trace.iter().map(|s| s.sequence_no).collect();
    assert_eq!(sequence, vec![1, 2, 3]);
    assert!(run.final_conclusion().is_some_and(|c| !c.trim().is_empty()));
    assert!(!run.ungrounded);
    assert_eq!(run.metrics.tool_calls, 1);
    assert_eq!(h.oracle.seen()[0].grounding_len, 1);

    remove_db(&h.db_path);
}

#[tokio::test]
async fn empty_corpus_completes_ungrounded() {
    let h = harness(
        "agent-ungrounded",
        Vec::new(),
        ScriptedOracle::new(vec![answer("Insufficient data; likely load spike.")], answer("unused")),
        Vec::new(),
        RunBudget::default(),
    );

    let run = h
        .agent
        .investigate(&message("job-empty", 1), "w1")
        .await
        .expect("investigate");

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.ungrounded);
    assert_eq!(run.trace[0].kind, StepKind::Retrieval);
    assert_eq!(run.trace[0].output["chunks"], json!([]));

    remove_db(&h.db_path);
}

#[tokio::test]
async fn failing_tool_is_recorded_after_retries_and_loop_continues() {
    let flaky = StubTool::new("flaky_metrics", always_unreachable);
    let calls = flaky.calls.clone();
    let h = harness(
        "agent-flaky",
        vec![flaky],
        ScriptedOracle::new(
            vec![
                call("flaky_metrics", json!({ "pod": "podA" })),
                answer("Metrics backend unreachable; escalate."),
            ],
            answer("unused"),
        ),
        vec![runbook_hit()],
        RunBudget::default(),
    );

    let run = h
        .agent
        .investigate(&message("job-flaky", 1), "w1")
        .await
        .expect("investigate");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(run.status, RunStatus::Completed);
    let failed = &run.trace[1];
    assert_eq!(failed.kind, StepKind::ToolCall);
    assert!(failed
        .error
        .as_deref()
        .is_some_and(|e| e.contains("connection refused")));
    assert_eq!(failed.output["attempts"], json!(3));
    // The oracle was consulted again with the failure in its context.
    assert_eq!(h.oracle.seen()[1].trace_len, 2);

    remove_db(&h.db_path);
}

#[tokio::test]
async fn invalid_tool_input_is_not_invoked() {
    let tool = StubTool::new("pod_cpu_usage", cpu_reading);
    let calls = tool.calls.clone();
    let h = harness(
        "agent-invalid",
        vec![tool],
        ScriptedOracle::new(
            vec![
                call("pod_cpu_usage", json!({ "name": "podA" })),
                call("no_such_tool", json!({})),
                answer("Could not inspect the pod."),
            ],
            answer("unused"),
        ),
        Vec::new(),
        RunBudget::default(),
    );

    let run = h
        .agent
        .investigate(&message("job-invalid", 1), "w1")
        .await
        .expect("investigate");

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.trace[1].output["attempts"], json!(0));
    assert!(run.trace[1].error.is_some());
    assert!(run.trace[2]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("unknown tool")));

    remove_db(&h.db_path);
}

#[tokio::test]
async fn loop_terminates_within_step_budget() {
    let h = harness(
        "agent-budget",
        vec![StubTool::new("pod_cpu_usage", cpu_reading)],
        ScriptedOracle::new(
            vec![Ok(Decision::Unparsed {
                raw: "hmm".to_string(),
                reason: "no action".to_string(),
            })],
            call("pod_cpu_usage", json!({ "pod": "podA" })),
        ),
        vec![runbook_hit()],
        RunBudget {
            max_iterations: 4,
            ..RunBudget::default()
        },
    );

    let run = h
        .agent
        .investigate(&message("job-budget", 1), "w1")
        .await
        .expect("investigate");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.trace.len(), 5);
    assert_eq!(run.trace[1].kind, StepKind::Thought);
    assert!(run.trace[1].error.is_some());
    let last = run.trace.last().expect("final step");
    assert_eq!(last.kind, StepKind::FinalAnswer);
    let conclusion = run.conclusion.expect("conclusion");
    assert!(conclusion.synthesized);
    assert!(!conclusion.is_empty());
    assert!(h.oracle.seen().last().is_some_and(|seen| seen.must_conclude));
    assert_eq!(run.metrics.iterations, 4);

    remove_db(&h.db_path);
}

#[tokio::test]
async fn exhausted_oracle_fails_the_run_and_keeps_the_trace() {
    let h = harness(
        "agent-oracle-down",
        Vec::new(),
        ScriptedOracle::new(
            Vec::new(),
            Err(OracleError::Transport("connection reset".to_string())),
        ),
        vec![runbook_hit()],
        RunBudget::default(),
    );

    let run = h
        .agent
        .investigate(&message("job-oracle", 1), "w1")
        .await
        .expect("investigate");

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.starts_with("oracle_unavailable")));
    assert_eq!(run.trace.len(), 1);
    assert_eq!(h.oracle.seen().len(), 3);

    remove_db(&h.db_path);
}

#[tokio::test]
async fn oracle_lost_while_concluding_fails_instead_of_synthesizing() {
    let h = harness(
        "agent-oracle-lost-at-budget",
        vec![StubTool::new("pod_cpu_usage", cpu_reading)],
        ScriptedOracle::new(
            vec![call("pod_cpu_usage", json!({ "pod": "podA" }))],
            Err(OracleError::Transport("connection reset".to_string())),
        ),
        vec![runbook_hit()],
        RunBudget {
            max_iterations: 2,
            ..RunBudget::default()
        },
    );

    let run = h
        .agent
        .investigate(&message("job-lost-at-budget", 1), "w1")
        .await
        .expect("investigate");

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.starts_with("oracle_unavailable")));
    assert!(run.conclusion.is_none());
    let kinds: Vec<StepKind> = run.trace.iter().map(|step| step.kind).collect();
    assert_eq!(kinds, [StepKind::Retrieval, StepKind::ToolCall]);
    let seen = h.oracle.seen();
    assert_eq!(seen.len(), 4);
    assert!(!seen[0].must_conclude);
    assert!(seen[1..].iter().all(|context| context.must_conclude));

    remove_db(&h.db_path);
}

#[tokio::test]
async fn non_retriable_oracle_error_fails_after_one_call() {
    let h = harness(
        "agent-oracle-auth",
        Vec::new(),
        ScriptedOracle::new(
            Vec::new(),
            Err(OracleError::Provider {
                status: 401,
                message: "bad key".to_string(),
            }),
        ),
        Vec::new(),
        RunBudget::default(),
    );

    let run = h
        .agent
        .investigate(&message("job-auth", 1), "w1")
        .await
        .expect("investigate");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(h.oracle.seen().len(), 1);

    remove_db(&h.db_path);
}

#[tokio::test]
async fn redelivery_resumes_without_duplicating_steps() {
    let h = harness(
        "agent-resume",
        vec![StubTool::new("pod_cpu_usage", cpu_reading)],
        ScriptedOracle::new(vec![answer("Throttled by its limit.")], answer("unused")),
        vec![runbook_hit()],
        RunBudget::default(),
    );

    // First delivery dies after two committed steps.
    h.ledger
        .claim_run(&message("job-resume", 1), "w1")
        .expect("first claim");
    h.ledger
        .append_step(
            "job-resume",
            "w1",
            NewTraceStep::new(
                StepKind::Retrieval,
                json!({ "query": "cpu", "k": 3 }),
                json!({ "chunks": [runbook_hit()] }),
            ),
        )
        .expect("retrieval");
    h.ledger
        .append_step(
            "job-resume",
            "w1",
            NewTraceStep::new(
                StepKind::ToolCall,
                json!({ "tool": "pod_cpu_usage", "input": { "pod": "podA" } }),
                json!({ "summary": "0.98 cores", "attempts": 1 }),
            ),
        )
        .expect("tool call");

    let run = h
        .agent
        .investigate(&message("job-resume", 2), "w2")
        .await
        .expect("resume");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.trace.len(), 3);
    assert_eq!(run.trace[2].kind, StepKind::FinalAnswer);
    assert_eq!(run.worker_id.as_deref(), Some("w2"));
    let seen = h.oracle.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].trace_len, 2);
    assert_eq!(seen[0].grounding_len, 1);

    // A further redelivery of a settled run changes nothing.
    let again = h
        .agent
        .investigate(&message("job-resume", 3), "w3")
        .await
        .expect("settled");
    assert_eq!(again.trace.len(), 3);
    assert_eq!(h.oracle.seen().len(), 1);

    remove_db(&h.db_path);
}

#[tokio::test]
async fn stale_delivery_does_not_touch_the_run() {
    let h = harness(
        "agent-stale",
        Vec::new(),
        ScriptedOracle::new(Vec::new(), answer("unused")),
        Vec::new(),
        RunBudget::default(),
    );
    h.ledger
        .claim_run(&message("job-stale", 2), "w2")
        .expect("current owner");

    let err = h
        .agent
        .investigate(&message("job-stale", 1), "w1")
        .await
        .expect_err("stale");
    assert!(matches!(err, TriageError::JobRedeliveryConflict { .. }));
    let run = h.ledger.get_run("job-stale").expect("get").expect("run");
    assert_eq!(run.status, RunStatus::InProgress);
    assert!(run.trace.is_empty());
    assert!(h.oracle.seen().is_empty());

    remove_db(&h.db_path);
}

#[tokio::test]
async fn wall_clock_overrun_fails_with_partial_trace() {
    let h = harness(
        "agent-wallclock",
        vec![StubTool::new("pod_cpu_usage", cpu_reading).slow(Duration::from_secs(5))],
        ScriptedOracle::new(
            vec![call("pod_cpu_usage", json!({ "pod": "podA" }))],
            answer("unused"),
        ),
        vec![runbook_hit()],
        RunBudget {
            wall_clock_ms: 200,
            ..RunBudget::default()
        },
    );

    let run = h
        .agent
        .investigate(&message("job-slow", 1), "w1")
        .await
        .expect("investigate");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.failure_reason.as_deref(),
        Some("wall_clock_budget_exceeded")
    );
    assert_eq!(run.trace.len(), 1);
    assert_eq!(run.trace[0].kind, StepKind::Retrieval);

    remove_db(&h.db_path);
}
