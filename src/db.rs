use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::decision::DecisionLabel;
use crate::models::*;

/// Async-safe handle to the analysis database.
///
/// Wraps `AnalysisDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<AnalysisDb>>,
}

impl DbHandle {
    pub fn new(db: AnalysisDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&AnalysisDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, AnalysisDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Outcome of a guarded status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied { from: ProjectStatus },
    Invalid { from: ProjectStatus },
    NotFound,
}

/// Outcome of writing a terminal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Written,
    /// A row with this run id already exists; nothing changed.
    AlreadyFinalized,
    ProjectMissing,
}

pub struct AnalysisDb {
    conn: Connection,
}

const PROJECT_COLUMNS: &str = "id, name, description, repo_url, status, total_files, total_lines, language, framework, created_at, updated_at";

const RUN_COLUMNS: &str = "id, project_id, status, started_at, completed_at, scores, aggregate_score, findings, recommendations, agent_results, decision, decision_rationale, decision_confidence, error_message, processing_time_seconds";

impl AnalysisDb {
    /// Open (or create) a SQLite database at the given path and create tables.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.create_tables().context("Failed to create tables")?;
        Ok(())
    }

    fn create_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT,
                    repo_url TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    total_files INTEGER,
                    total_lines INTEGER,
                    language TEXT,
                    framework TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS analysis_runs (
                    id TEXT PRIMARY KEY,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    status TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    completed_at TEXT NOT NULL,
                    scores TEXT,
                    aggregate_score REAL,
                    findings TEXT NOT NULL DEFAULT '[]',
                    recommendations TEXT NOT NULL DEFAULT '[]',
                    agent_results TEXT NOT NULL DEFAULT '[]',
                    decision TEXT,
                    decision_rationale TEXT,
                    decision_confidence REAL,
                    error_message TEXT,
                    processing_time_seconds REAL NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_analysis_runs_project ON analysis_runs(project_id);
                CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status);
                ",
            )
            .context("Failed to run schema")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, new: &NewProject) -> Result<Project> {
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO projects (name, description, repo_url, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
                params![new.name, new.description, new.repo_url, now],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ProjectRow::from_row)
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Newest first. `page` is 1-based.
    pub fn list_projects(&self, page: u32, page_size: u32) -> Result<ProjectPage> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .context("Failed to count projects")?;
        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        let sql = format!(
            "SELECT {} FROM projects ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            PROJECT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![page_size, offset], ProjectRow::from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(ProjectPage {
            projects,
            total,
            page,
            page_size,
        })
    }

    /// Delete a project and its runs. Returns whether a row was removed.
    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(changed > 0)
    }

    /// Move a project to `to` if the lifecycle allows it from its current status.
    pub fn transition_project(&self, id: i64, to: ProjectStatus) -> Result<StatusUpdate> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM projects WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read project status")?;
        let Some(current) = current else {
            return Ok(StatusUpdate::NotFound);
        };
        let from = parse_status(&current)?;
        if !is_valid_transition(from, to) {
            return Ok(StatusUpdate::Invalid { from });
        }
        tx.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![to.as_str(), now_timestamp(), id],
        )
        .context("Failed to update project status")?;
        tx.commit().context("Failed to commit status update")?;
        Ok(StatusUpdate::Applied { from })
    }

    pub fn update_project_metadata(&self, id: i64, meta: &ProjectMetadata) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects SET total_files = ?1, total_lines = ?2, language = ?3, framework = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    meta.total_files,
                    meta.total_lines,
                    meta.language,
                    meta.framework,
                    now_timestamp(),
                    id
                ],
            )
            .context("Failed to update project metadata")?;
        Ok(())
    }

    /// Mark projects stuck in an in-flight state as failed, recording a
    /// failed run for each. Returns the affected project ids.
    pub fn recover_interrupted(&self, reason: &str) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, updated_at FROM projects
                 WHERE status IN ('cloning', 'extracting', 'analyzing', 'deciding')",
            )
            .context("Failed to prepare recover_interrupted")?;
        let stuck: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to query in-flight projects")?
            .collect::<rusqlite::Result<_>>()
            .context("Failed to read in-flight project row")?;
        drop(stmt);

        let mut recovered = Vec::with_capacity(stuck.len());
        for (id, updated_at) in stuck {
            let run = AnalysisRun::failed(uuid::Uuid::new_v4().to_string(), id, updated_at, reason, 0.0);
            if self.finalize_run(&run)? == FinalizeOutcome::Written {
                recovered.push(id);
            }
        }
        Ok(recovered)
    }

    // ── Analysis runs ─────────────────────────────────────────────────

    /// Insert a terminal run and set the project's status to match, in one
    /// transaction. A run id is written at most once.
    pub fn finalize_run(&self, run: &AnalysisRun) -> Result<FinalizeOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1)",
                params![run.project_id],
                |row| row.get(0),
            )
            .context("Failed to check project")?;
        if !exists {
            return Ok(FinalizeOutcome::ProjectMissing);
        }

        let scores = run
            .scores
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize scores")?;
        let findings = serde_json::to_string(&run.findings).context("Failed to serialize findings")?;
        let recommendations = serde_json::to_string(&run.recommendations)
            .context("Failed to serialize recommendations")?;
        let agent_results = serde_json::to_string(&run.agent_results)
            .context("Failed to serialize agent results")?;

        let inserted = tx
            .execute(
                "INSERT INTO analysis_runs (id, project_id, status, started_at, completed_at, scores, aggregate_score,
                     findings, recommendations, agent_results, decision, decision_rationale, decision_confidence,
                     error_message, processing_time_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    run.id,
                    run.project_id,
                    run.status.as_str(),
                    run.started_at,
                    run.completed_at,
                    scores,
                    run.aggregate_score,
                    findings,
                    recommendations,
                    agent_results,
                    run.decision.map(|d| d.as_str()),
                    run.decision_rationale,
                    run.decision_confidence,
                    run.error_message,
                    run.processing_time_seconds,
                ],
            )
            .context("Failed to insert analysis run")?;
        if inserted == 0 {
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        tx.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                run.status.project_status().as_str(),
                run.completed_at,
                run.project_id
            ],
        )
        .context("Failed to set terminal project status")?;
        tx.commit().context("Failed to commit run")?;
        Ok(FinalizeOutcome::Written)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<AnalysisRun>> {
        let sql = format!("SELECT {} FROM analysis_runs WHERE id = ?1", RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query analysis run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// All runs of a project, newest first.
    pub fn list_runs(&self, project_id: i64) -> Result<Vec<AnalysisRun>> {
        let sql = format!(
            "SELECT {} FROM analysis_runs WHERE project_id = ?1 ORDER BY completed_at DESC, rowid DESC",
            RUN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![project_id], RunRow::from_row)
            .context("Failed to query analysis runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read analysis run row")?.into_run()?);
        }
        Ok(runs)
    }

    pub fn latest_run(&self, project_id: i64) -> Result<Option<AnalysisRun>> {
        let sql = format!(
            "SELECT {} FROM analysis_runs WHERE project_id = ?1 ORDER BY completed_at DESC, rowid DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![project_id], RunRow::from_row)
            .optional()
            .context("Failed to query latest run")?;
        row.map(RunRow::into_run).transpose()
    }

    // ── Dashboard ─────────────────────────────────────────────────────

    pub fn dashboard_stats(&self) -> Result<DashboardStats> {
        let mut stats = DashboardStats::default();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM projects GROUP BY status")
            .context("Failed to prepare dashboard_stats")?;
        let counts: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to count projects by status")?
            .collect::<rusqlite::Result<_>>()
            .context("Failed to read project count row")?;
        drop(stmt);
        for (status, count) in counts {
            stats.total_projects += count;
            match parse_status(&status)? {
                ProjectStatus::Pending => stats.pending_projects += count,
                ProjectStatus::Completed => stats.completed_projects += count,
                ProjectStatus::Failed => stats.failed_projects += count,
                _ => stats.active_projects += count,
            }
        }

        let (total_analyses, average): (i64, Option<f64>) = self
            .conn
            .query_row(
                "SELECT COUNT(*), AVG(CASE WHEN status = 'completed' THEN aggregate_score END)
                 FROM analysis_runs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to summarize analysis runs")?;
        stats.total_analyses = total_analyses;
        stats.average_score = average.map_or(0.0, |avg| (avg * 100.0).round() / 100.0);
        Ok(stats)
    }

    /// The most recently created projects, newest first.
    pub fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityItem>> {
        let sql = format!(
            "SELECT {} FROM projects ORDER BY created_at DESC, id DESC LIMIT ?1",
            PROJECT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare recent_activity")?;
        let rows = stmt
            .query_map(params![limit], ProjectRow::from_row)
            .context("Failed to query recent projects")?;
        let mut items = Vec::new();
        for row in rows {
            let project = row.context("Failed to read project row")?.into_project()?;
            items.push(ActivityItem {
                id: project.id,
                kind: "project_created".to_string(),
                project_id: project.id,
                message: format!("Project '{}' created", project.name),
                project_name: project.name,
                timestamp: project.created_at,
                status: project.status,
            });
        }
        Ok(items)
    }
}

fn parse_status(s: &str) -> Result<ProjectStatus> {
    ProjectStatus::from_str(s)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to parse project status")
}

/// Intermediate row struct for projects.
struct ProjectRow {
    id: i64,
    name: String,
    description: Option<String>,
    repo_url: String,
    status: String,
    total_files: Option<i64>,
    total_lines: Option<i64>,
    language: Option<String>,
    framework: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            repo_url: row.get(3)?,
            status: row.get(4)?,
            total_files: row.get(5)?,
            total_lines: row.get(6)?,
            language: row.get(7)?,
            framework: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        Ok(Project {
            id: self.id,
            name: self.name,
            description: self.description,
            repo_url: self.repo_url,
            status: parse_status(&self.status)?,
            total_files: self.total_files,
            total_lines: self.total_lines,
            language: self.language,
            framework: self.framework,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for analysis_runs; JSON columns stay as text.
struct RunRow {
    id: String,
    project_id: i64,
    status: String,
    started_at: String,
    completed_at: String,
    scores: Option<String>,
    aggregate_score: Option<f64>,
    findings: String,
    recommendations: String,
    agent_results: String,
    decision: Option<String>,
    decision_rationale: Option<String>,
    decision_confidence: Option<f64>,
    error_message: Option<String>,
    processing_time_seconds: f64,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            scores: row.get(5)?,
            aggregate_score: row.get(6)?,
            findings: row.get(7)?,
            recommendations: row.get(8)?,
            agent_results: row.get(9)?,
            decision: row.get(10)?,
            decision_rationale: row.get(11)?,
            decision_confidence: row.get(12)?,
            error_message: row.get(13)?,
            processing_time_seconds: row.get(14)?,
        })
    }

    fn into_run(self) -> Result<AnalysisRun> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run status")?;
        let decision = self
            .decision
            .as_deref()
            .map(DecisionLabel::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse decision")?;
        let scores = self
            .scores
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse scores")?;
        Ok(AnalysisRun {
            id: self.id,
            project_id: self.project_id,
            status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            scores,
            aggregate_score: self.aggregate_score,
            findings: serde_json::from_str(&self.findings).context("Failed to parse findings")?,
            recommendations: serde_json::from_str(&self.recommendations)
                .context("Failed to parse recommendations")?,
            agent_results: serde_json::from_str(&self.agent_results)
                .context("Failed to parse agent results")?,
            decision,
            decision_rationale: self.decision_rationale,
            decision_confidence: self.decision_confidence,
            error_message: self.error_message,
            processing_time_seconds: self.processing_time_seconds,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
