//! Analysis agents and the runner that executes them.
//!
//! The worker set is closed: one agent per scoring [`Category`], all behind
//! the [`AnalysisAgent`] trait and run in the order given by
//! [`default_agents`]. Agents only report findings and recommendations; the
//! runner applies the shared scoring rule so no agent can score itself.

pub mod findings;
pub mod runner;

mod architecture;
mod code_quality;
mod maintainability;
mod performance;
mod security;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::repo::CodeSnapshot;

pub use architecture::ArchitectureAgent;
pub use code_quality::CodeQualityAgent;
pub use findings::{AgentResult, Finding, Priority, Recommendation, Severity};
pub use maintainability::MaintainabilityAgent;
pub use performance::PerformanceAgent;
pub use runner::{AgentRunner, CategoryScores, RunnerConfig, aggregate_score};
pub use security::SecurityAgent;

/// Scoring category. Each category has a fixed weight in the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Security,
    Performance,
    Architecture,
    CodeQuality,
    Maintainability,
}

impl Category {
    /// All categories in canonical order.
    pub const ALL: [Category; 5] = [
        Category::Security,
        Category::Performance,
        Category::Architecture,
        Category::CodeQuality,
        Category::Maintainability,
    ];

    /// Weight in the aggregate score. Weights over [`Category::ALL`] sum to 1.0.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Security => 0.25,
            Self::Performance => 0.20,
            Self::Architecture => 0.20,
            Self::CodeQuality => 0.20,
            Self::Maintainability => 0.15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Architecture => "architecture",
            Self::CodeQuality => "code_quality",
            Self::Maintainability => "maintainability",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an agent reports for one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    pub findings: Vec<Finding>,
    pub recommendations: Vec<Recommendation>,
}

/// One independent analysis worker.
///
/// Implementations must not assume anything about sibling agents and must
/// treat the snapshot as read-only.
#[async_trait]
pub trait AnalysisAgent: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> Category;

    async fn analyze(&self, snapshot: &CodeSnapshot) -> Result<AgentOutput, AgentError>;
}

/// The production agent set, one per category, in canonical order.
///
/// Findings are capped by [`RunnerConfig::max_findings`], not by the agents.
pub fn default_agents() -> Vec<Arc<dyn AnalysisAgent>> {
    vec![
        Arc::new(SecurityAgent),
        Arc::new(PerformanceAgent::default()),
        Arc::new(ArchitectureAgent),
        Arc::new(CodeQualityAgent::default()),
        Arc::new(MaintainabilityAgent::default()),
    ]
}
