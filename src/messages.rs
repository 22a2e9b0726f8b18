//! Messages exchanged over a project's WebSocket.

use serde::{Deserialize, Serialize};

use crate::agents::CategoryScores;
use crate::decision::DecisionLabel;
use crate::models::ProjectStatus;

/// Server → client events. Every variant names its project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        project_id: i64,
        project_name: String,
        message: String,
    },
    Progress {
        project_id: i64,
        percent: u8,
        message: String,
        status: ProjectStatus,
    },
    AgentUpdate {
        project_id: i64,
        agent: String,
        status: String,
        score: u32,
    },
    AnalysisComplete {
        project_id: i64,
        run_id: String,
        scores: CategoryScores,
        aggregate_score: f64,
        decision: DecisionLabel,
        confidence: f64,
    },
    Error {
        project_id: i64,
        error: String,
    },
    Pong {
        project_id: i64,
    },
    Status {
        project_id: i64,
        status: ProjectStatus,
        updated_at: String,
    },
}

impl ServerMessage {
    pub fn project_id(&self) -> i64 {
        match self {
            Self::Connected { project_id, .. }
            | Self::Progress { project_id, .. }
            | Self::AgentUpdate { project_id, .. }
            | Self::AnalysisComplete { project_id, .. }
            | Self::Error { project_id, .. }
            | Self::Pong { project_id }
            | Self::Status { project_id, .. } => *project_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The only client → server inputs; anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    Ping,
    Status,
}

impl ClientCommand {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "ping" => Some(Self::Ping),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}
