//! Per-project analysis pipeline.
//!
//! `pending → cloning → extracting → analyzing → deciding → completed`, with
//! `failed` reachable from any non-terminal state. Each state change is
//! persisted before its progress event is broadcast, and exactly one
//! [`AnalysisRun`] row is written per run, at the terminal state, in the same
//! transaction as the terminal project status.
//!
//! [`PipelineRunner`] admits at most one run per project. Each run is two
//! tasks: a stage task that drives the state machine, and a supervisor that
//! awaits it and turns any error, panic, or shutdown abort into a failed run.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::agents::runner::join_error_message;
use crate::agents::{AgentResult, AgentRunner, CategoryScores};
use crate::db::{DbHandle, FinalizeOutcome, StatusUpdate};
use crate::decision::{DecisionClient, DecisionRequest};
use crate::errors::{AdmissionError, PipelineError};
use crate::messages::ServerMessage;
use crate::models::{AnalysisRun, ProjectMetadata, ProjectStatus, RunStatus, now_timestamp};
use crate::registry::ConnectionRegistry;
use crate::repo::{CodeExtractor, RepositorySource};

/// Error recorded for runs found in flight when the server starts.
pub const INTERRUPTED_ON_STARTUP: &str = "Analysis interrupted by server restart";

/// How long shutdown waits for aborted runs to record their failure.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a run needs. Shared by all runs.
pub struct PipelineDeps {
    pub db: DbHandle,
    pub registry: Arc<ConnectionRegistry>,
    pub source: Arc<dyn RepositorySource>,
    pub extractor: Arc<dyn CodeExtractor>,
    pub agents: AgentRunner,
    pub decider: Arc<dyn DecisionClient>,
}

/// Returned to the caller when a run is admitted.
#[derive(Debug, Clone, Serialize)]
pub struct RunTicket {
    pub run_id: String,
    pub project_id: i64,
    pub status: ProjectStatus,
}

/// An admitted run. The entry stays until its supervisor has recorded the
/// outcome, so a run id never disappears before its row exists.
struct ActiveRun {
    run_id: String,
    stage: AbortHandle,
    /// Taken by shutdown when it waits on the run.
    supervisor: Option<JoinHandle<()>>,
}

type ActiveRuns = Arc<Mutex<HashMap<i64, ActiveRun>>>;

#[derive(Clone)]
struct RunContext {
    project_id: i64,
    run_id: String,
    started_at: String,
    started: Instant,
}

impl RunContext {
    fn elapsed_secs(&self) -> f64 {
        (self.started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0
    }
}

/// Admits, tracks, and shuts down pipeline runs.
pub struct PipelineRunner {
    deps: Arc<PipelineDeps>,
    active: ActiveRuns,
    shutting_down: AtomicBool,
}

impl PipelineRunner {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            deps: Arc::new(deps),
            active: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.deps.db
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.deps.registry
    }

    /// Admit a run for `project_id` and start it in the background.
    pub async fn start(&self, project_id: i64) -> Result<RunTicket, AdmissionError> {
        // Checked under the lock: shutdown flips the flag while holding it.
        let mut active = self.active.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(AdmissionError::ShuttingDown);
        }
        if let Some(run) = active.get(&project_id) {
            return Err(AdmissionError::AlreadyRunning {
                project_id,
                run_id: run.run_id.clone(),
            });
        }

        let project = self
            .deps
            .db
            .call(move |db| db.get_project(project_id))
            .await
            .map_err(AdmissionError::Database)?
            .ok_or(AdmissionError::ProjectNotFound { id: project_id })?;

        let ctx = RunContext {
            project_id,
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: now_timestamp(),
            started: Instant::now(),
        };
        let span = info_span!("analysis_run", project_id, run_id = %ctx.run_id);

        let stage = tokio::spawn(drive(self.deps.clone(), ctx.clone()).instrument(span.clone()));
        let abort = stage.abort_handle();
        let supervisor = tokio::spawn(
            supervise(self.deps.clone(), self.active.clone(), ctx.clone(), stage).instrument(span),
        );
        active.insert(
            project_id,
            ActiveRun {
                run_id: ctx.run_id.clone(),
                stage: abort,
                supervisor: Some(supervisor),
            },
        );

        info!(project_id, project = %project.name, run_id = %ctx.run_id, "analysis run admitted");
        Ok(RunTicket {
            run_id: ctx.run_id,
            project_id,
            status: ProjectStatus::Pending,
        })
    }

    /// The active run id for a project, if any.
    pub async fn active_run(&self, project_id: i64) -> Option<String> {
        self.active
            .lock()
            .await
            .get(&project_id)
            .map(|run| run.run_id.clone())
    }

    /// The project owning an active run, if `run_id` is still running.
    pub async fn project_for_active_run(&self, run_id: &str) -> Option<i64> {
        self.active
            .lock()
            .await
            .iter()
            .find(|(_, run)| run.run_id == run_id)
            .map(|(project_id, _)| *project_id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Delete a project unless it has an active run. Admission is blocked
    /// while the delete is in progress.
    pub async fn delete_project(&self, project_id: i64) -> Result<bool, AdmissionError> {
        let active = self.active.lock().await;
        if let Some(run) = active.get(&project_id) {
            return Err(AdmissionError::AlreadyRunning {
                project_id,
                run_id: run.run_id.clone(),
            });
        }
        let deleted = self
            .deps
            .db
            .call(move |db| db.delete_project(project_id))
            .await
            .map_err(AdmissionError::Database)?;
        drop(active);
        if deleted {
            info!(project_id, "project deleted");
        }
        Ok(deleted)
    }

    /// Fail projects a previous process left in flight.
    pub async fn recover_interrupted(&self) -> Result<Vec<i64>> {
        let recovered = self
            .deps
            .db
            .call(|db| db.recover_interrupted(INTERRUPTED_ON_STARTUP))
            .await?;
        if !recovered.is_empty() {
            warn!(projects = ?recovered, "marked interrupted analyses as failed");
        }
        Ok(recovered)
    }

    /// Stop admitting runs, wait up to `grace` for active runs, then abort
    /// the rest. Aborted runs are recorded as failed.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let _admission = self.active.lock().await;
            self.shutting_down.store(true, Ordering::SeqCst);
        }
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.active.lock().await.len();
            if remaining == 0 {
                info!("no active analysis runs at shutdown");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            debug!(remaining, "waiting for active runs");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Entries stay in place; each supervisor removes its own after the
        // failed run is persisted.
        let supervisors: Vec<JoinHandle<()>> = {
            let mut active = self.active.lock().await;
            active
                .iter_mut()
                .filter_map(|(project_id, run)| {
                    warn!(project_id, run_id = %run.run_id, "aborting analysis run at shutdown");
                    run.stage.abort();
                    run.supervisor.take()
                })
                .collect()
        };
        if tokio::time::timeout(FINALIZE_TIMEOUT, join_all(supervisors))
            .await
            .is_err()
        {
            error!("timed out recording interrupted runs");
        }
    }
}

/// Await the stage task and record its failure, if any.
async fn supervise(
    deps: Arc<PipelineDeps>,
    active: ActiveRuns,
    ctx: RunContext,
    stage: JoinHandle<Result<(), PipelineError>>,
) {
    let outcome = match stage.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => Err(PipelineError::Interrupted),
        Err(e) => Err(PipelineError::Panicked(join_error_message(e))),
    };
    if let Err(e) = outcome {
        fail_run(&deps, &ctx, e).await;
    }

    let mut active = active.lock().await;
    if active
        .get(&ctx.project_id)
        .is_some_and(|run| run.run_id == ctx.run_id)
    {
        active.remove(&ctx.project_id);
    }
}

/// Persist `to` on the project, then broadcast its checkpoint.
async fn advance(
    deps: &PipelineDeps,
    ctx: &RunContext,
    to: ProjectStatus,
    message: &str,
) -> Result<(), PipelineError> {
    let project_id = ctx.project_id;
    let update = deps
        .db
        .call(move |db| db.transition_project(project_id, to))
        .await
        .map_err(PipelineError::Store)?;
    match update {
        StatusUpdate::Applied { from } => debug!(%from, %to, "status advanced"),
        StatusUpdate::Invalid { from } => return Err(PipelineError::InvalidTransition { from, to }),
        StatusUpdate::NotFound => return Err(PipelineError::ProjectVanished { id: project_id }),
    }
    deps.registry
        .publish(&ServerMessage::Progress {
            project_id,
            percent: to.percent(),
            message: message.to_string(),
            status: to,
        })
        .await;
    Ok(())
}

/// Drive one run from `pending` to `completed`.
async fn drive(deps: Arc<PipelineDeps>, ctx: RunContext) -> Result<(), PipelineError> {
    let project_id = ctx.project_id;
    let project = deps
        .db
        .call(move |db| db.get_project(project_id))
        .await
        .map_err(PipelineError::Store)?
        .ok_or(PipelineError::ProjectVanished { id: project_id })?;

    if project.status == ProjectStatus::Pending {
        deps.registry
            .publish(&ServerMessage::Progress {
                project_id,
                percent: ProjectStatus::Pending.percent(),
                message: "Analysis queued".to_string(),
                status: ProjectStatus::Pending,
            })
            .await;
    } else {
        advance(&deps, &ctx, ProjectStatus::Pending, "Analysis queued").await?;
    }

    advance(&deps, &ctx, ProjectStatus::Cloning, "Cloning repository").await?;
    let checkout = deps.source.acquire(&project.repo_url).await?;

    advance(&deps, &ctx, ProjectStatus::Extracting, "Extracting code").await?;
    let snapshot = Arc::new(deps.extractor.extract(checkout.path()).await?);
    let metadata = ProjectMetadata {
        total_files: snapshot.total_files as i64,
        total_lines: snapshot.total_lines as i64,
        language: snapshot.primary_language.clone(),
        framework: snapshot.framework.clone(),
    };
    deps.db
        .call(move |db| db.update_project_metadata(project_id, &metadata))
        .await
        .map_err(PipelineError::Store)?;
    info!(
        files = snapshot.total_files,
        lines = snapshot.total_lines,
        language = snapshot.primary_language.as_deref().unwrap_or("unknown"),
        "code extracted"
    );

    advance(&deps, &ctx, ProjectStatus::Analyzing, "Running analysis agents").await?;
    let results = deps.agents.run(snapshot.clone()).await;
    for result in &results {
        deps.registry
            .publish(&ServerMessage::AgentUpdate {
                project_id,
                agent: result.agent.clone(),
                status: if result.failed { "failed" } else { "completed" }.to_string(),
                score: result.score,
            })
            .await;
    }
    let scores = CategoryScores::from_results(&results);
    let aggregate = scores.aggregate();

    advance(&deps, &ctx, ProjectStatus::Deciding, "Analysis complete, requesting decision").await?;
    let decision = deps
        .decider
        .decide(&DecisionRequest {
            project_name: &project.name,
            language: snapshot.primary_language.as_deref(),
            framework: snapshot.framework.as_deref(),
            total_files: snapshot.total_files,
            total_lines: snapshot.total_lines,
            aggregate_score: aggregate,
            results: &results,
        })
        .await;
    drop(checkout);

    let run = completed_run(&ctx, scores, aggregate, results, &decision);
    let confidence = decision.confidence;
    let outcome = deps
        .db
        .call(move |db| db.finalize_run(&run))
        .await
        .map_err(PipelineError::Store)?;
    match outcome {
        FinalizeOutcome::Written => {}
        FinalizeOutcome::AlreadyFinalized => {
            warn!("run was already finalized");
            return Ok(());
        }
        FinalizeOutcome::ProjectMissing => {
            return Err(PipelineError::ProjectVanished { id: project_id });
        }
    }

    deps.registry
        .publish(&ServerMessage::Progress {
            project_id,
            percent: ProjectStatus::Completed.percent(),
            message: "Analysis completed".to_string(),
            status: ProjectStatus::Completed,
        })
        .await;
    deps.registry
        .publish(&ServerMessage::AnalysisComplete {
            project_id,
            run_id: ctx.run_id.clone(),
            scores,
            aggregate_score: aggregate,
            decision: decision.label,
            confidence,
        })
        .await;
    info!(
        aggregate_score = aggregate,
        decision = %decision.label,
        seconds = ctx.elapsed_secs(),
        "analysis run completed"
    );
    Ok(())
}

fn completed_run(
    ctx: &RunContext,
    scores: CategoryScores,
    aggregate: f64,
    results: Vec<AgentResult>,
    decision: &crate::decision::Decision,
) -> AnalysisRun {
    let findings = results.iter().flat_map(|r| r.findings.iter().cloned()).collect();
    let recommendations = results
        .iter()
        .flat_map(|r| r.recommendations.iter().cloned())
        .collect();
    AnalysisRun {
        id: ctx.run_id.clone(),
        project_id: ctx.project_id,
        status: RunStatus::Completed,
        started_at: ctx.started_at.clone(),
        completed_at: now_timestamp(),
        scores: Some(scores),
        aggregate_score: Some(aggregate),
        findings,
        recommendations,
        agent_results: results,
        decision: Some(decision.label),
        decision_rationale: Some(decision.rationale.clone()),
        decision_confidence: Some(decision.confidence),
        error_message: None,
        processing_time_seconds: ctx.elapsed_secs(),
    }
}

/// Record a failed run and tell subscribers.
async fn fail_run(deps: &PipelineDeps, ctx: &RunContext, err: PipelineError) {
    let project_id = ctx.project_id;
    let message = err.to_string();
    error!(error = %message, "analysis run failed");

    let run = AnalysisRun::failed(
        ctx.run_id.clone(),
        project_id,
        ctx.started_at.clone(),
        message.clone(),
        ctx.elapsed_secs(),
    );
    match deps.db.call(move |db| db.finalize_run(&run)).await {
        Ok(FinalizeOutcome::Written) => {}
        Ok(FinalizeOutcome::AlreadyFinalized) => {
            debug!("run already finalized, failure not recorded");
            return;
        }
        Ok(FinalizeOutcome::ProjectMissing) => {
            warn!("project deleted before the failure could be recorded");
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "failed to record failed run");
        }
    }
    deps.registry
        .publish(&ServerMessage::Error {
            project_id,
            error: message,
        })
        .await;
}
