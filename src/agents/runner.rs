//! Parallel execution of analysis agents.
//!
//! Every agent runs on the blocking pool against the same `Arc<CodeSnapshot>`,
//! bounded by its own timeout measured from outside the agent, so an agent
//! that never yields still times out. The runner waits for all of them and
//! returns exactly one [`AgentResult`] per agent, in the order the agents were
//! given, regardless of completion order. An agent that errors, panics, or
//! times out becomes a failed result; it never affects its siblings.
//!
//! Dropping the future returned by [`AgentRunner::run`] cancels every agent
//! still in flight at its next await point. Synchronous work already running
//! on the blocking pool finishes in the background and its output is discarded.
//!
//! ```no_run
//! use std::sync::Arc;
//! use futureproof::agents::{AgentRunner, aggregate_score};
//! use futureproof::repo::CodeSnapshot;
//!
//! # async fn example() {
//! let runner = AgentRunner::with_defaults();
//! let results = runner.run(Arc::new(CodeSnapshot::default())).await;
//! assert_eq!(results.len(), runner.len());
//! let aggregate = aggregate_score(&results);
//! assert!((0.0..=100.0).contains(&aggregate));
//! # }
//! ```

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use super::{AgentOutput, AgentResult, AnalysisAgent, Category, default_agents};
use crate::errors::AgentError;
use crate::repo::CodeSnapshot;

/// Default per-agent timeout.
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 60;

/// Default cap on findings kept per agent.
pub const DEFAULT_MAX_FINDINGS: usize = 10;

/// Configuration for the agent runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub agent_timeout: Duration,
    /// Findings kept per agent result; `None` keeps everything.
    pub max_findings: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
            max_findings: Some(DEFAULT_MAX_FINDINGS),
        }
    }
}

impl RunnerConfig {
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_max_findings(mut self, max_findings: usize) -> Self {
        self.max_findings = Some(max_findings);
        self
    }

    pub fn without_findings_cap(mut self) -> Self {
        self.max_findings = None;
        self
    }
}

/// Runs a fixed, ordered set of agents concurrently.
#[derive(Clone)]
pub struct AgentRunner {
    agents: Vec<Arc<dyn AnalysisAgent>>,
    config: RunnerConfig,
}

impl AgentRunner {
    pub fn new(agents: Vec<Arc<dyn AnalysisAgent>>, config: RunnerConfig) -> Self {
        Self { agents, config }
    }

    /// The production agent set with the default timeout and findings cap.
    pub fn with_defaults() -> Self {
        Self::new(default_agents(), RunnerConfig::default())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Run every agent and return one result per agent, in agent order.
    pub async fn run(&self, snapshot: Arc<CodeSnapshot>) -> Vec<AgentResult> {
        let timeout = self.config.agent_timeout;
        let max_findings = self.config.max_findings;
        info!(agents = self.agents.len(), "running analysis agents");

        let runtime = tokio::runtime::Handle::current();
        let pending: Vec<_> = self
            .agents
            .iter()
            .map(|agent| {
                let name = agent.name().to_string();
                let category = agent.category();
                let started = Instant::now();
                let mut task = AgentTask::spawn(&runtime, agent.clone(), snapshot.clone());
                async move {
                    let outcome = tokio::time::timeout(timeout, &mut task.handle).await;
                    let elapsed = started.elapsed();
                    settle(name, category, outcome, timeout, max_findings, elapsed)
                }
            })
            .collect();

        let results = join_all(pending).await;

        let failed = results.iter().filter(|r| r.failed).count();
        if failed > 0 {
            warn!(failed, total = results.len(), "some agents failed");
        }
        results
    }
}

/// `None` when the agent was cancelled before it finished.
type AgentOutcome = Option<Result<AgentOutput, AgentError>>;

/// One agent in flight. Dropping it cancels the agent.
struct AgentTask {
    handle: JoinHandle<AgentOutcome>,
    cancel: Arc<Notify>,
}

impl AgentTask {
    fn spawn(
        runtime: &tokio::runtime::Handle,
        agent: Arc<dyn AnalysisAgent>,
        snapshot: Arc<CodeSnapshot>,
    ) -> Self {
        let cancel = Arc::new(Notify::new());
        let cancelled = cancel.clone();
        let runtime = runtime.clone();
        let handle = tokio::task::spawn_blocking(move || {
            runtime.block_on(async {
                tokio::select! {
                    output = agent.analyze(&snapshot) => Some(output),
                    _ = cancelled.notified() => None,
                }
            })
        });
        Self { handle, cancel }
    }
}

impl Drop for AgentTask {
    fn drop(&mut self) {
        // Stored permit: a task that has not polled yet still sees it.
        self.cancel.notify_one();
        self.handle.abort();
    }
}

/// Convert whatever happened to one agent task into its result.
///
/// The score is computed from every finding the agent reported. Only then is
/// the list cut to `max_findings`, keeping the most severe first and the
/// agent's own order within a severity.
fn settle(
    name: String,
    category: Category,
    outcome: Result<Result<AgentOutcome, JoinError>, tokio::time::error::Elapsed>,
    timeout: Duration,
    max_findings: Option<usize>,
    elapsed: Duration,
) -> AgentResult {
    let duration_ms = elapsed.as_millis() as u64;
    let error = match outcome {
        Ok(Ok(Some(Ok(output)))) => {
            let mut result = AgentResult::completed(
                name,
                category,
                output.findings,
                output.recommendations,
                duration_ms,
            );
            if let Some(cap) = max_findings
                && result.findings.len() > cap
            {
                result.findings.sort_by_key(|f| f.severity());
                result.findings.truncate(cap);
            }
            debug!(
                agent = %result.agent,
                score = result.score,
                findings = result.findings.len(),
                duration_ms,
                "agent completed"
            );
            return result;
        }
        Ok(Ok(Some(Err(e)))) => e,
        Ok(Ok(None)) => AgentError::Failed {
            agent: name.clone(),
            message: "cancelled".to_string(),
        },
        Ok(Err(join_err)) => AgentError::Panicked {
            agent: name.clone(),
            message: join_error_message(join_err),
        },
        Err(_elapsed) => AgentError::Timeout {
            agent: name.clone(),
            secs: timeout.as_secs(),
        },
    };
    warn!(agent = %name, error = %error, "agent failed");
    AgentResult::failed(name, category, error.to_string(), duration_ms)
}
/// Human-readable message for a task that panicked or was cancelled.
pub(crate) fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        panic_payload_message(err.into_panic())
    } else {
        "task was cancelled".to_string()
    }
}

fn panic_payload_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Per-category scores for one run. A failed or missing agent scores 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryScores {
    pub security: u32,
    pub performance: u32,
    pub architecture: u32,
    pub code_quality: u32,
    pub maintainability: u32,
}

impl CategoryScores {
    pub fn from_results(results: &[AgentResult]) -> Self {
        let score_for = |category: Category| {
            results
                .iter()
                .find(|r| r.category == category)
                .filter(|r| !r.failed)
                .map(|r| r.score)
                .unwrap_or(0)
        };
        Self {
            security: score_for(Category::Security),
            performance: score_for(Category::Performance),
            architecture: score_for(Category::Architecture),
            code_quality: score_for(Category::CodeQuality),
            maintainability: score_for(Category::Maintainability),
        }
    }

    pub fn get(&self, category: Category) -> u32 {
        match category {
            Category::Security => self.security,
            Category::Performance => self.performance,
            Category::Architecture => self.architecture,
            Category::CodeQuality => self.code_quality,
            Category::Maintainability => self.maintainability,
        }
    }

    /// Weighted mean over all categories, rounded to two decimals, in [0, 100].
    pub fn aggregate(&self) -> f64 {
        let weighted: f64 = Category::ALL
            .iter()
            .map(|c| c.weight() * f64::from(self.get(*c)))
            .sum();
        ((weighted * 100.0).round() / 100.0).clamp(0.0, 100.0)
    }
}

/// Aggregate score for a set of agent results.
pub fn aggregate_score(results: &[AgentResult]) -> f64 {
    CategoryScores::from_results(results).aggregate()
}
