use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunBudget {
    /// Non-final trace steps allowed before the agent must conclude.
    pub max_iterations: u32,
    pub wall_clock_ms: u64,
    pub oracle_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    pub retrieval_timeout_ms: u64,
    pub retrieval_k: usize,
    /// Re-query the knowledge base after every observation instead of once.
    pub retrieve_each_iteration: bool,
}

impl Default for RunBudget {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            wall_clock_ms: 300_000,
            oracle_timeout_ms: 120_000,
            tool_timeout_ms: 30_000,
            retrieval_timeout_ms: 10_000,
            retrieval_k: 3,
            retrieve_each_iteration: false,
        }
    }
}

impl RunBudget {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_millis(self.wall_clock_ms.max(1))
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms.max(1))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms.max(1))
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BudgetExhausted {
    /// The run must be terminated and marked failed.
    WallClock,
    /// The agent must conclude with what it has.
    Iterations,
}

impl BudgetExhausted {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            BudgetExhausted::WallClock => "wall_clock_budget_exceeded",
            BudgetExhausted::Iterations => "max_iterations_reached",
        }
    }
}

pub(super) fn budget_exhausted(
    budget: &RunBudget,
    run_started: Instant,
    steps_used: u32,
) -> Option<BudgetExhausted> {
    if run_started.elapsed() >= budget.wall_clock() {
        return Some(BudgetExhausted::WallClock);
    }
    if steps_used >= budget.max_iterations.max(1) {
        return Some(BudgetExhausted::Iterations);
    }
    None
}
