use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::core::error::{OracleError, ToolInvocationError, TriageError};
use crate::core::model::{Conclusion, NewTraceStep, QueueMessage, Run, RunMetrics, StepKind};
use crate::core::ports::ledger::RunClaim;
use crate::core::ports::oracle::{Decision, OracleContext};
use crate::core::ports::tools::ToolDefinition;
use crate::core::retry::retry_with_backoff;

use super::budget::{budget_exhausted, BudgetExhausted};
use super::events::{emit_retry, emit_run_state};
use super::instructions::{retrieval_query, synthesize_conclusion};
use super::ledger::{complete_run, fail_run, record_step};
use super::state::{AgentPhase, InvestigationState};
use super::Agent;

/// Why the loop stopped without a conclusion.
enum Abort {
    WallClock,
    Oracle(OracleError),
    /// Lost ownership or storage failure: the ledger must not be touched further.
    Ledger(TriageError),
}

impl From<TriageError> for Abort {
    fn from(err: TriageError) -> Self {
        Abort::Ledger(err)
    }
}

fn elapsed_since(created_at: DateTime<Utc>) -> Duration {
    (Utc::now() - created_at).to_std().unwrap_or(Duration::ZERO)
}

impl Agent {
    /// Runs one job to a settled run. Idempotent per job id: a settled run is
    /// returned untouched, an unsettled one is resumed from its trace.
    pub async fn investigate(
        &self,
        message: &QueueMessage,
        worker_id: &str,
    ) -> Result<Run, TriageError> {
        let (run, phase) = match self.ledger.claim_run(message, worker_id)? {
            RunClaim::Settled(run) => {
                log::debug!(
                    "run {} already {}; nothing to do",
                    run.id,
                    run.status
                );
                return Ok(run);
            }
            RunClaim::Started(run) => (run, AgentPhase::Accepted),
            RunClaim::Resumed(run) => (run, AgentPhase::Resumed),
        };

        let run_id = run.id.clone();
        let mut state = InvestigationState::replay(run.trace.clone());
        if phase == AgentPhase::Resumed {
            log::info!(
                "resuming run {run_id} after {} recorded step(s)",
                state.trace.len()
            );
        }
        emit_run_state(self.emitter.as_ref(), &run_id, phase, state.steps_used, None);

        // The wall clock counts from run creation, across redeliveries.
        let elapsed = elapsed_since(run.created_at);
        let started = Instant::now().checked_sub(elapsed).unwrap_or_else(Instant::now);
        let remaining = self.config.budget.wall_clock().saturating_sub(elapsed);
        let tools = self.tools.definitions();

        let outcome = match tokio::time::timeout(
            remaining,
            self.drive(&run, worker_id, &tools, started, &mut state),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(Abort::WallClock),
        };

        let metrics = state.metrics(elapsed_since(run.created_at).as_millis() as u64);
        let ungrounded = !state.grounded;
        match outcome {
            Ok(conclusion) => {
                let finished = complete_run(
                    self.ledger.as_ref(),
                    &run_id,
                    worker_id,
                    conclusion,
                    metrics,
                    ungrounded,
                )?;
                emit_run_state(
                    self.emitter.as_ref(),
                    &run_id,
                    AgentPhase::Completed,
                    metrics.iterations,
                    None,
                );
                log::info!(
                    "run {run_id} completed: steps={} tool_calls={} ungrounded={ungrounded} duration_ms={}",
                    finished.trace.len(),
                    metrics.tool_calls,
                    metrics.duration_ms
                );
                Ok(finished)
            }
            Err(Abort::WallClock) => self.fail(
                &run_id,
                worker_id,
                BudgetExhausted::WallClock.as_str(),
                metrics,
                ungrounded,
            ),
            Err(Abort::Oracle(err)) => self.fail(
                &run_id,
                worker_id,
                &format!("oracle_unavailable: {err}"),
                metrics,
                ungrounded,
            ),
            Err(Abort::Ledger(err)) => {
                log::warn!("run {run_id} abandoned by {worker_id}: {err}");
                Err(err)
            }
        }
    }

    fn fail(
        &self,
        run_id: &str,
        worker_id: &str,
        reason: &str,
        metrics: RunMetrics,
        ungrounded: bool,
    ) -> Result<Run, TriageError> {
        log::warn!("run {run_id} failed: {reason}");
        let run = fail_run(
            self.ledger.as_ref(),
            run_id,
            worker_id,
            reason,
            metrics,
            ungrounded,
        )?;
        emit_run_state(
            self.emitter.as_ref(),
            run_id,
            AgentPhase::Failed,
            metrics.iterations,
            Some(reason),
        );
        Ok(run)
    }

    async fn drive(
        &self,
        run: &Run,
        worker_id: &str,
        tools: &[ToolDefinition],
        started: Instant,
        state: &mut InvestigationState,
    ) -> Result<Conclusion, Abort> {
        loop {
            // A previous delivery may have recorded the answer but died before finishing.
            if let Some(conclusion) = state.final_answer.clone() {
                return Ok(conclusion);
            }

            match budget_exhausted(&self.config.budget, started, state.steps_used) {
                Some(BudgetExhausted::WallClock) => return Err(Abort::WallClock),
                Some(exhausted @ BudgetExhausted::Iterations) => {
                    return self
                        .conclude(run, worker_id, tools, state, exhausted.as_str())
                        .await;
                }
                None => {}
            }

            if self.should_retrieve(state) {
                self.retrieve(run, worker_id, state).await?;
                continue;
            }

            emit_run_state(
                self.emitter.as_ref(),
                &run.id,
                AgentPhase::Thinking,
                state.steps_used,
                None,
            );
            let decision = self
                .ask_oracle(run, tools, state, false)
                .await
                .map_err(Abort::Oracle)?;

            match decision {
                Decision::ToolCall {
                    thought,
                    tool,
                    input,
                } => {
                    self.call_tool(run, worker_id, state, thought, tool, input)
                        .await?;
                }
                Decision::FinalAnswer {
                    thought,
                    conclusion,
                } => {
                    if conclusion.is_empty() {
                        let step = NewTraceStep::new(
                            StepKind::Thought,
                            json!({ "thought": thought }),
                            Value::Null,
                        )
                        .with_error("final answer was empty");
                        self.record(run, worker_id, state, step)?;
                        continue;
                    }
                    self.record_final(run, worker_id, state, json!({ "thought": thought }), &conclusion)?;
                    return Ok(conclusion);
                }
                Decision::Unparsed { raw, reason } => {
                    log::debug!("run {} unparsed oracle output: {reason}", run.id);
                    let step =
                        NewTraceStep::new(StepKind::Thought, json!({ "raw": raw }), Value::Null)
                            .with_error(reason);
                    self.record(run, worker_id, state, step)?;
                }
            }
        }
    }

    fn record(
        &self,
        run: &Run,
        worker_id: &str,
        state: &mut InvestigationState,
        step: NewTraceStep,
    ) -> Result<(), TriageError> {
        record_step(
            self.ledger.as_ref(),
            self.emitter.as_ref(),
            &run.id,
            worker_id,
            state,
            step,
        )
    }

    fn record_final(
        &self,
        run: &Run,
        worker_id: &str,
        state: &mut InvestigationState,
        input: Value,
        conclusion: &Conclusion,
    ) -> Result<(), TriageError> {
        let output = serde_json::to_value(conclusion)?;
        self.record(
            run,
            worker_id,
            state,
            NewTraceStep::new(StepKind::FinalAnswer, input, output),
        )
    }

    fn should_retrieve(&self, state: &InvestigationState) -> bool {
        let budget = &self.config.budget;
        if budget.retrieval_k == 0 {
            return false;
        }
        if state.retrievals == 0 {
            return true;
        }
        budget.retrieve_each_iteration && state.last_kind() == Some(StepKind::ToolCall)
    }

    /// Retrieval never fails the run: outages and empty results leave it ungrounded.
    async fn retrieve(
        &self,
        run: &Run,
        worker_id: &str,
        state: &mut InvestigationState,
    ) -> Result<(), TriageError> {
        emit_run_state(
            self.emitter.as_ref(),
            &run.id,
            AgentPhase::Retrieving,
            state.steps_used,
            None,
        );
        let budget = &self.config.budget;
        let refinement = if state.retrievals > 0 {
            state.last_observation()
        } else {
            None
        };
        let query = retrieval_query(&run.alert, refinement);
        let k = budget.retrieval_k;

        let result = match tokio::time::timeout(
            budget.retrieval_timeout(),
            self.retriever.retrieve(&query, k),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TriageError::RetrievalUnavailable(format!(
                "retrieval timed out after {}ms",
                budget.retrieval_timeout_ms
            ))),
        };

        let input = json!({ "query": query, "k": k });
        let step = match result {
            Ok(chunks) => {
                if chunks.is_empty() {
                    log::debug!("run {}: no grounding found", run.id);
                }
                NewTraceStep::new(StepKind::Retrieval, input, json!({ "chunks": chunks }))
            }
            Err(err) => {
                log::warn!("run {}: proceeding ungrounded: {err}", run.id);
                NewTraceStep::new(StepKind::Retrieval, input, json!({ "chunks": [] }))
                    .with_error(err.to_string())
            }
        };
        self.record(run, worker_id, state, step)
    }

    async fn ask_oracle(
        &self,
        run: &Run,
        tools: &[ToolDefinition],
        state: &InvestigationState,
        must_conclude: bool,
    ) -> Result<Decision, OracleError> {
        let context = OracleContext {
            instructions: &self.config.instructions,
            alert: &run.alert,
            trace: &state.trace,
            grounding: &state.grounding,
            tools,
            must_conclude,
        };
        let timeout = self.config.budget.oracle_timeout();
        let policy = self.config.oracle_retry;
        let max_attempts = policy.attempts();
        let oracle = self.oracle.as_ref();

        let retried = retry_with_backoff(
            &policy,
            move |_attempt| async move {
                match tokio::time::timeout(timeout, oracle.reason(context, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(OracleError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            },
            OracleError::is_retriable,
            |attempt, err, delay| {
                log::warn!(
                    "oracle {} attempt {attempt}/{max_attempts} failed for run {}: {err}",
                    oracle.backend(),
                    run.id
                );
                emit_retry(
                    self.emitter.as_ref(),
                    &run.id,
                    "oracle",
                    attempt,
                    max_attempts,
                    delay.as_millis() as u64,
                    &err.to_string(),
                );
            },
        )
        .await;
        retried.result
    }

    /// Failures are recorded on the step, never raised: the loop continues
    /// with the error visible to the oracle.
    async fn call_tool(
        &self,
        run: &Run,
        worker_id: &str,
        state: &mut InvestigationState,
        thought: Option<String>,
        tool: String,
        input: Value,
    ) -> Result<(), TriageError> {
        emit_run_state(
            self.emitter.as_ref(),
            &run.id,
            AgentPhase::ToolCalling,
            state.steps_used,
            Some(tool.as_str()),
        );
        let step_input = json!({ "tool": &tool, "input": &input, "thought": &thought });

        let step = match self.tools.validate(&tool, &input) {
            Err(err) => {
                log::warn!("run {}: rejected call to {tool}: {err}", run.id);
                NewTraceStep::new(StepKind::ToolCall, step_input, json!({ "attempts": 0 }))
                    .with_error(err.to_string())
            }
            Ok(()) => {
                let timeout = self.config.budget.tool_timeout();
                let policy = self.config.tool_retry;
                let max_attempts = policy.attempts();
                let belt = self.tools.as_ref();
                let name = tool.as_str();
                let input = &input;

                let retried = retry_with_backoff(
                    &policy,
                    move |_attempt| {
                        let input = input.clone();
                        async move {
                            match tokio::time::timeout(timeout, belt.invoke(name, input)).await {
                                Ok(result) => result,
                                Err(_) => Err(ToolInvocationError::Timeout {
                                    tool: name.to_string(),
                                    timeout_ms: timeout.as_millis() as u64,
                                }),
                            }
                        }
                    },
                    ToolInvocationError::is_retriable,
                    |attempt, err, delay| {
                        log::warn!(
                            "tool {name} attempt {attempt}/{max_attempts} failed for run {}: {err}",
                            run.id
                        );
                        emit_retry(
                            self.emitter.as_ref(),
                            &run.id,
                            name,
                            attempt,
                            max_attempts,
                            delay.as_millis() as u64,
                            &err.to_string(),
                        );
                    },
                )
                .await;

                match retried.result {
                    Ok(observation) => NewTraceStep::new(
                        StepKind::ToolCall,
                        step_input,
                        json!({
                            "summary": observation.summary,
                            "data": observation.data,
                            "attempts": retried.attempts,
                        }),
                    ),
                    Err(err) => {
                        log::warn!(
                            "run {}: {tool} failed after {} attempt(s): {err}",
                            run.id,
                            retried.attempts
                        );
                        NewTraceStep::new(
                            StepKind::ToolCall,
                            step_input,
                            json!({ "attempts": retried.attempts }),
                        )
                        .with_error(err.to_string())
                    }
                }
            }
        };
        self.record(run, worker_id, state, step)
    }

    /// Budget spent: one last request for an answer, then a synthesized one.
    async fn conclude(
        &self,
        run: &Run,
        worker_id: &str,
        tools: &[ToolDefinition],
        state: &mut InvestigationState,
        reason: &str,
    ) -> Result<Conclusion, Abort> {
        emit_run_state(
            self.emitter.as_ref(),
            &run.id,
            AgentPhase::Concluding,
            state.steps_used,
            Some(reason),
        );
        log::debug!("run {}: {reason}; concluding", run.id);

        // A reply that is not an answer still concludes; an oracle that stays
        // unreachable after retries fails the run like any other turn.
        let conclusion = match self
            .ask_oracle(run, tools, state, true)
            .await
            .map_err(Abort::Oracle)?
        {
            Decision::FinalAnswer { conclusion, .. } if !conclusion.is_empty() => conclusion,
            _ => {
                log::warn!("run {}: oracle did not conclude; synthesizing", run.id);
                synthesize_conclusion(&run.alert, &state.trace, reason)
            }
        };
        self.record_final(run, worker_id, state, json!({ "reason": reason }), &conclusion)?;
        Ok(conclusion)
    }
}
