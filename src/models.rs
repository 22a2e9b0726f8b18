use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::agents::{AgentResult, CategoryScores, Finding, Recommendation};
use crate::decision::DecisionLabel;

/// Lifecycle of a project's analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Cloning,
    Extracting,
    Analyzing,
    Deciding,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Extracting => "extracting",
            Self::Analyzing => "analyzing",
            Self::Deciding => "deciding",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// A run is in flight in one of these states.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Cloning | Self::Extracting | Self::Analyzing | Self::Deciding
        )
    }

    /// Progress checkpoint broadcast on entering this state.
    pub fn percent(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Cloning => 10,
            Self::Extracting => 30,
            Self::Analyzing => 50,
            Self::Deciding => 80,
            Self::Completed => 100,
            Self::Failed => 100,
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "cloning" => Ok(Self::Cloning),
            "extracting" => Ok(Self::Extracting),
            "analyzing" => Ok(Self::Analyzing),
            "deciding" => Ok(Self::Deciding),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// Whether the orchestrator may move a project from `from` to `to`.
///
/// Forward one step at a time; `failed` from any non-terminal state. A new
/// run resets a terminal project to `pending`.
pub fn is_valid_transition(from: ProjectStatus, to: ProjectStatus) -> bool {
    use ProjectStatus::*;
    matches!(
        (from, to),
        (Completed | Failed, Pending)
            | (Pending, Cloning)
            | (Cloning, Extracting)
            | (Extracting, Analyzing)
            | (Analyzing, Deciding)
            | (Deciding, Completed)
            | (Pending | Cloning | Extracting | Analyzing | Deciding, Failed)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub repo_url: String,
    pub status: ProjectStatus,
    pub total_files: Option<i64>,
    pub total_lines: Option<i64>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields accepted when creating a project.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One page of projects, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectPage {
    pub projects: Vec<Project>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// Terminal status of an analysis run. Runs are only ever stored terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn project_status(&self) -> ProjectStatus {
        match self {
            Self::Completed => ProjectStatus::Completed,
            Self::Failed => ProjectStatus::Failed,
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// The single immutable record of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub id: String,
    pub project_id: i64,
    pub status: RunStatus,
    pub started_at: String,
    pub completed_at: String,
    pub scores: Option<CategoryScores>,
    pub aggregate_score: Option<f64>,
    pub findings: Vec<Finding>,
    pub recommendations: Vec<Recommendation>,
    pub agent_results: Vec<AgentResult>,
    pub decision: Option<DecisionLabel>,
    pub decision_rationale: Option<String>,
    pub decision_confidence: Option<f64>,
    pub error_message: Option<String>,
    pub processing_time_seconds: f64,
}

impl AnalysisRun {
    /// A failed run carrying only the error.
    pub fn failed(
        id: impl Into<String>,
        project_id: i64,
        started_at: impl Into<String>,
        error: impl Into<String>,
        processing_time_seconds: f64,
    ) -> Self {
        Self {
            id: id.into(),
            project_id,
            status: RunStatus::Failed,
            started_at: started_at.into(),
            completed_at: now_timestamp(),
            scores: None,
            aggregate_score: None,
            findings: Vec::new(),
            recommendations: Vec::new(),
            agent_results: Vec::new(),
            decision: None,
            decision_rationale: None,
            decision_confidence: None,
            error_message: Some(error.into()),
            processing_time_seconds,
        }
    }
}

/// Extraction metadata the run writes back onto its project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectMetadata {
    pub total_files: i64,
    pub total_lines: i64,
    pub language: Option<String>,
    pub framework: Option<String>,
}

/// Project and run counts for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardStats {
    pub total_projects: i64,
    pub pending_projects: i64,
    /// Projects somewhere between `cloning` and `deciding`.
    pub active_projects: i64,
    pub completed_projects: i64,
    pub failed_projects: i64,
    pub total_analyses: i64,
    /// Mean aggregate score of completed runs, 0 when there are none.
    pub average_score: f64,
}

/// One entry in the dashboard activity feed.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityItem {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub project_id: i64,
    pub project_name: String,
    pub message: String,
    pub timestamp: String,
    pub status: ProjectStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentActivity {
    pub activities: Vec<ActivityItem>,
    pub total: usize,
}

/// RFC 3339 UTC timestamp with second precision.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
