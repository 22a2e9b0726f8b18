//! End-to-end pipeline runs against fake collaborators.
//!
//! Each test wires a real `PipelineRunner` (in-memory SQLite, real
//! `ConnectionRegistry`, real `AgentRunner`) to fake clone/extract/agent
//! implementations and observes what subscribers receive.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use futureproof::agents::{
    AgentOutput, AgentRunner, AnalysisAgent, Category, Finding, RunnerConfig, Severity,
};
use futureproof::config::LlmConfig;
use futureproof::db::{AnalysisDb, DbHandle};
use futureproof::decision::{
    DecisionClient, DecisionLabel, LlmDecisionClient, RuleBasedDecisionClient,
};
use futureproof::errors::{AgentError, CloneError, ExtractError};
use futureproof::models::{NewProject, ProjectStatus, RunStatus};
use futureproof::pipeline::{PipelineDeps, PipelineRunner};
use futureproof::registry::{ConnectionRegistry, Subscriber, SubscriberId};
use futureproof::repo::{CheckedOutRepo, CodeExtractor, CodeSnapshot, RepositorySource};

// =============================================================================
// Fakes
// =============================================================================

struct LocalSource;

#[async_trait]
impl RepositorySource for LocalSource {
    async fn acquire(&self, _url: &str) -> Result<CheckedOutRepo, CloneError> {
        Ok(CheckedOutRepo::at(std::env::temp_dir()))
    }
}

struct MissingRepoSource;

#[async_trait]
impl RepositorySource for MissingRepoSource {
    async fn acquire(&self, url: &str) -> Result<CheckedOutRepo, CloneError> {
        Err(CloneError::Git {
            url: url.to_string(),
            source: git2::Error::from_str("remote: Repository not found"),
        })
    }
}

struct FixedExtractor;

#[async_trait]
impl CodeExtractor for FixedExtractor {
    async fn extract(&self, _root: &Path) -> Result<CodeSnapshot, ExtractError> {
        Ok(CodeSnapshot {
            total_files: 12,
            total_lines: 840,
            primary_language: Some("Python".into()),
            framework: Some("FastAPI".into()),
            ..Default::default()
        })
    }
}

/// Reports `highs` high findings and `mediums` medium findings.
struct Scripted {
    category: Category,
    highs: usize,
    mediums: usize,
}

#[async_trait]
impl AnalysisAgent for Scripted {
    fn name(&self) -> &str {
        self.category.as_str()
    }

    fn category(&self) -> Category {
        self.category
    }

    async fn analyze(&self, _snapshot: &CodeSnapshot) -> Result<AgentOutput, AgentError> {
        let mut findings = Vec::new();
        for i in 0..self.highs {
            findings.push(Finding::new(Severity::High, self.category.as_str(), format!("high {}", i)));
        }
        for i in 0..self.mediums {
            findings.push(Finding::new(
                Severity::Medium,
                self.category.as_str(),
                format!("medium {}", i),
            ));
        }
        Ok(AgentOutput {
            findings,
            recommendations: Vec::new(),
        })
    }
}

struct Broken(Category);

#[async_trait]
impl AnalysisAgent for Broken {
    fn name(&self) -> &str {
        self.0.as_str()
    }

    fn category(&self) -> Category {
        self.0
    }

    async fn analyze(&self, _snapshot: &CodeSnapshot) -> Result<AgentOutput, AgentError> {
        Err(AgentError::Failed {
            agent: self.0.as_str().to_string(),
            message: "parser crashed".into(),
        })
    }
}

/// Records every message and, for progress events, the project status
/// stored at the moment of delivery.
struct Observer {
    id: SubscriberId,
    db: DbHandle,
    project_id: i64,
    seen: Mutex<Vec<Value>>,
    stored_status: Mutex<Vec<(String, String)>>,
}

impl Observer {
    fn new(id: SubscriberId, db: DbHandle, project_id: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            db,
            project_id,
            seen: Mutex::new(Vec::new()),
            stored_status: Mutex::new(Vec::new()),
        })
    }

    fn messages(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }

    fn of_type(&self, kind: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["type"] == kind)
            .collect()
    }

    fn percents(&self) -> Vec<u64> {
        self.of_type("progress")
            .iter()
            .map(|m| m["percent"].as_u64().unwrap())
            .collect()
    }
}

#[async_trait]
impl Subscriber for Observer {
    fn id(&self) -> SubscriberId {
        self.id
    }

    async fn deliver(&self, message: &str) -> Result<(), futureproof::errors::DeliveryError> {
        let value: Value = serde_json::from_str(message).unwrap();
        if value["type"] == "progress" {
            let project_id = self.project_id;
            let stored = self
                .db
                .call(move |db| db.get_project(project_id))
                .await
                .unwrap()
                .unwrap()
                .status;
            self.stored_status.lock().unwrap().push((
                value["status"].as_str().unwrap().to_string(),
                stored.as_str().to_string(),
            ));
        }
        self.seen.lock().unwrap().push(value);
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    runner: PipelineRunner,
    project_id: i64,
    observer: Arc<Observer>,
}

fn harness(
    source: Arc<dyn RepositorySource>,
    agents: Vec<Arc<dyn AnalysisAgent>>,
    decider: Arc<dyn DecisionClient>,
) -> Harness {
    let db = DbHandle::new(AnalysisDb::new_in_memory().unwrap());
    let project_id = db
        .lock_sync()
        .unwrap()
        .create_project(&NewProject {
            name: "inventory-service".into(),
            repo_url: "https://github.com/acme/inventory-service".into(),
            description: Some("Legacy inventory API".into()),
        })
        .unwrap()
        .id;

    let registry = Arc::new(ConnectionRegistry::default());
    let observer = Observer::new(registry.next_subscriber_id(), db.clone(), project_id);
    registry.register(observer.clone(), project_id);

    let runner = PipelineRunner::new(PipelineDeps {
        db,
        registry,
        source,
        extractor: Arc::new(FixedExtractor),
        agents: AgentRunner::new(agents, RunnerConfig::default()),
        decider,
    });
    Harness {
        runner,
        project_id,
        observer,
    }
}

fn scripted(scores: [(usize, usize); 5]) -> Vec<Arc<dyn AnalysisAgent>> {
    Category::ALL
        .iter()
        .zip(scores)
        .map(|(category, (highs, mediums))| {
            Arc::new(Scripted {
                category: *category,
                highs,
                mediums,
            }) as Arc<dyn AnalysisAgent>
        })
        .collect()
}

async fn run_to_end(h: &Harness) -> String {
    let ticket = h.runner.start(h.project_id).await.unwrap();
    for _ in 0..400 {
        if h.runner.active_run(h.project_id).await.is_none() {
            return ticket.run_id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} did not finish", ticket.run_id);
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_clone_failure_fails_the_run_without_analyzing() {
    let h = harness(
        Arc::new(MissingRepoSource),
        scripted([(0, 0); 5]),
        Arc::new(RuleBasedDecisionClient),
    );
    let run_id = run_to_end(&h).await;

    let db = h.runner.db().lock_sync().unwrap();
    let project = db.get_project(h.project_id).unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);

    let runs = db.list_runs(h.project_id).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run_id);
    assert_eq!(runs[0].status, RunStatus::Failed);
    let error = runs[0].error_message.clone().unwrap();
    assert!(error.contains("Repository not found"), "{}", error);
    assert!(runs[0].scores.is_none());

    assert_eq!(h.observer.percents(), vec![0, 10]);
    assert!(
        h.observer
            .of_type("progress")
            .iter()
            .all(|m| m["status"] != "analyzing" && m["status"] != "extracting")
    );
    let last = h.observer.messages().pop().unwrap();
    assert_eq!(last["type"], "error");
    assert_eq!(last["project_id"], h.project_id);
    assert!(last["error"].as_str().unwrap().contains("Repository not found"));
    assert!(h.observer.of_type("analysis_complete").is_empty());
}

#[tokio::test]
async fn test_weighted_aggregate_of_mixed_scores() {
    // 70 / 80 / 75 / 85 / 90
    let h = harness(
        Arc::new(LocalSource),
        scripted([(3, 0), (2, 0), (2, 1), (1, 1), (1, 0)]),
        Arc::new(RuleBasedDecisionClient),
    );
    let run_id = run_to_end(&h).await;

    let run = h
        .runner
        .db()
        .lock_sync()
        .unwrap()
        .get_run(&run_id)
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.aggregate_score, Some(79.0));
    let scores = run.scores.unwrap();
    assert_eq!(
        [
            scores.security,
            scores.performance,
            scores.architecture,
            scores.code_quality,
            scores.maintainability
        ],
        [70, 80, 75, 85, 90]
    );
    assert_eq!(run.findings.len(), 13);
    assert_eq!(run.decision, Some(DecisionLabel::NeedsWork));

    let complete = h.observer.of_type("analysis_complete");
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0]["aggregate_score"], 79.0);
    assert_eq!(complete[0]["decision"], "NEEDS_WORK");
    assert_eq!(complete[0]["run_id"], run_id.as_str());
}

#[tokio::test]
async fn test_progress_checkpoints_follow_persisted_status() {
    let h = harness(
        Arc::new(LocalSource),
        scripted([(0, 0); 5]),
        Arc::new(RuleBasedDecisionClient),
    );
    run_to_end(&h).await;

    assert_eq!(h.observer.percents(), vec![0, 10, 30, 50, 80, 100]);
    for (announced, stored) in h.observer.stored_status.lock().unwrap().iter() {
        assert_eq!(announced, stored);
    }

    let agents: Vec<String> = h
        .observer
        .of_type("agent_update")
        .iter()
        .map(|m| m["agent"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = Category::ALL.iter().map(|c| c.as_str().to_string()).collect();
    assert_eq!(agents, expected);

    let project = h
        .runner
        .db()
        .lock_sync()
        .unwrap()
        .get_project(h.project_id)
        .unwrap()
        .unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.total_files, Some(12));
    assert_eq!(project.total_lines, Some(840));
    assert_eq!(project.framework.as_deref(), Some("FastAPI"));
}

#[tokio::test]
async fn test_failing_agent_is_isolated_from_siblings() {
    let mut agents = scripted([(0, 0), (1, 0), (0, 0), (0, 0), (0, 0)]);
    agents[2] = Arc::new(Broken(Category::Architecture));
    let h = harness(Arc::new(LocalSource), agents, Arc::new(RuleBasedDecisionClient));
    let run_id = run_to_end(&h).await;

    let run = h
        .runner
        .db()
        .lock_sync()
        .unwrap()
        .get_run(&run_id)
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.agent_results.len(), 5);

    let broken = &run.agent_results[2];
    assert!(broken.failed);
    assert_eq!(broken.score, 0);
    assert!(broken.findings.is_empty());
    assert!(broken.error.as_deref().unwrap().contains("parser crashed"));

    assert!(!run.agent_results[1].failed);
    assert_eq!(run.agent_results[1].score, 90);
    assert_eq!(run.agent_results[1].findings.len(), 1);
    // 25 + 18 + 0 + 20 + 15
    assert_eq!(run.aggregate_score, Some(78.0));

    let updates = h.observer.of_type("agent_update");
    assert_eq!(updates[2]["status"], "failed");
    assert_eq!(updates[2]["score"], 0);
}

#[tokio::test]
async fn test_unreachable_decision_service_defaults_to_needs_review() {
    let llm = LlmConfig {
        base_url: "http://127.0.0.1:9".into(),
        timeout_secs: 2,
        ..Default::default()
    };
    let h = harness(
        Arc::new(LocalSource),
        scripted([(0, 0); 5]),
        Arc::new(LlmDecisionClient::new(llm, "test-key")),
    );
    let run_id = run_to_end(&h).await;

    let run = h
        .runner
        .db()
        .lock_sync()
        .unwrap()
        .get_run(&run_id)
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.decision, Some(DecisionLabel::NeedsReview));
    assert_eq!(run.decision_confidence, Some(0.0));
    assert!(run.decision_rationale.unwrap().starts_with("Error in AI analysis"));
}

#[tokio::test]
async fn test_rerun_after_completion_records_a_second_run() {
    let h = harness(
        Arc::new(LocalSource),
        scripted([(0, 0); 5]),
        Arc::new(RuleBasedDecisionClient),
    );
    let first = run_to_end(&h).await;
    let second = run_to_end(&h).await;
    assert_ne!(first, second);

    let db = h.runner.db().lock_sync().unwrap();
    let runs = db.list_runs(h.project_id).unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
    assert_eq!(
        db.get_project(h.project_id).unwrap().unwrap().status,
        ProjectStatus::Completed
    );
    drop(db);

    // The second run restarts from 0 after the first reached 100.
    let percents = h.observer.percents();
    assert_eq!(percents.len(), 12);
    assert_eq!(&percents[6..], &[0, 10, 30, 50, 80, 100]);
}
