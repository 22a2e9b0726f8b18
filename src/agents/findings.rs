//! Finding and result types produced by analysis agents.
//!
//! ## Types
//!
//! - [`Severity`]: Severity classification, ordered most to least severe
//! - [`Finding`]: A single detected issue with optional location and suggestion
//! - [`Recommendation`]: A prioritized follow-up action
//! - [`AgentResult`]: Everything one agent produced for one run
//!
//! ## Example
//!
//! ```
//! use futureproof::agents::findings::{Finding, Severity, score_findings};
//!
//! let finding = Finding::new(Severity::High, "security", "Hardcoded API key")
//!     .with_file("src/config.py")
//!     .with_line(12)
//!     .with_suggestion("Load the key from the environment");
//!
//! assert_eq!(finding.location().as_deref(), Some("src/config.py:12"));
//! assert_eq!(score_findings(&[finding]), 90);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::Category;

/// Score every agent starts from before penalties.
pub const MAX_SCORE: u32 = 100;

/// Severity level for a finding.
///
/// Severities are ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Points subtracted from an agent's score for one finding of this severity.
    ///
    /// # Examples
    ///
    /// ```
    /// use futureproof::agents::findings::Severity;
    ///
    /// assert_eq!(Severity::Critical.penalty(), 25);
    /// assert_eq!(Severity::Low.penalty(), 2);
    /// ```
    pub fn penalty(&self) -> u32 {
        match self {
            Self::Critical => 25,
            Self::High => 10,
            Self::Medium => 5,
            Self::Low => 2,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{}", s)
    }
}

/// Apply the shared scoring rule: start at 100, subtract each finding's
/// penalty, floor at 0.
pub fn score_findings(findings: &[Finding]) -> u32 {
    let penalty: u32 = findings.iter().map(|f| f.severity.penalty()).sum();
    MAX_SCORE.saturating_sub(penalty)
}

/// A single issue detected by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    severity: Severity,
    /// Category or rule that produced the finding.
    category: String,
    message: String,
    /// File path relative to the repository root.
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    /// 1-based line number.
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
}

impl Finding {
    /// Create a repository-level finding with no location.
    ///
    /// # Examples
    ///
    /// ```
    /// use futureproof::agents::findings::{Finding, Severity};
    ///
    /// let finding = Finding::new(Severity::Medium, "architecture", "No configuration files found");
    /// assert!(finding.file().is_none());
    /// assert_eq!(finding.location(), None);
    /// ```
    pub fn new(severity: Severity, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            category: category.into(),
            message: message.into(),
            file: None,
            line: None,
            suggestion: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// `file:line`, `file`, or `None` for repository-level findings.
    pub fn location(&self) -> Option<String> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{}:{}", file, line)),
            (Some(file), None) => Some(file.clone()),
            _ => None,
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }
}

/// Priority of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// A follow-up action suggested by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub category: String,
    pub text: String,
    pub priority: Priority,
}

impl Recommendation {
    pub fn new(category: impl Into<String>, text: impl Into<String>, priority: Priority) -> Self {
        Self {
            category: category.into(),
            text: text.into(),
            priority,
        }
    }
}

/// Everything one agent produced for one run.
///
/// A failed result always has score 0 and no findings or recommendations;
/// `error` explains what went wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub category: Category,
    pub score: u32,
    pub findings: Vec<Finding>,
    pub recommendations: Vec<Recommendation>,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AgentResult {
    /// Build a successful result, scoring the findings with [`score_findings`].
    pub fn completed(
        agent: impl Into<String>,
        category: Category,
        findings: Vec<Finding>,
        recommendations: Vec<Recommendation>,
        duration_ms: u64,
    ) -> Self {
        Self {
            agent: agent.into(),
            category,
            score: score_findings(&findings),
            findings,
            recommendations,
            failed: false,
            error: None,
            duration_ms,
        }
    }

    /// Build a failed result carrying the error text.
    pub fn failed(
        agent: impl Into<String>,
        category: Category,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            agent: agent.into(),
            category,
            score: 0,
            findings: Vec::new(),
            recommendations: Vec::new(),
            failed: true,
            error: Some(error.into()),
            duration_ms,
        }
    }

    /// Count findings of the given severity.
    pub fn count_severity(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity() == severity)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::High < Severity::Medium);
        assert!(Severity::Medium < Severity::Low);
    }

    #[test]
    fn test_severity_serialization() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let parsed: Severity = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(parsed, Severity::Medium);
    }

    #[test]
    fn test_score_with_no_findings_is_max() {
        assert_eq!(score_findings(&[]), 100);
    }

    #[test]
    fn test_score_subtracts_each_penalty() {
        let findings = vec![
            Finding::new(Severity::Critical, "security", "a"),
            Finding::new(Severity::High, "security", "b"),
            Finding::new(Severity::Medium, "security", "c"),
            Finding::new(Severity::Low, "security", "d"),
        ];
        assert_eq!(score_findings(&findings), 100 - 25 - 10 - 5 - 2);
    }

    #[test]
    fn test_score_floors_at_zero() {
        let findings: Vec<Finding> = (0..5)
            .map(|i| Finding::new(Severity::Critical, "security", format!("leak {}", i)))
            .collect();
        assert_eq!(score_findings(&findings), 0);
    }

    #[test]
    fn test_finding_location_variants() {
        let repo_level = Finding::new(Severity::Low, "dependencies", "none declared");
        assert_eq!(repo_level.location(), None);

        let file_level = repo_level.clone().with_file("package.json");
        assert_eq!(file_level.location().as_deref(), Some("package.json"));

        let line_level = file_level.with_line(3);
        assert_eq!(line_level.location().as_deref(), Some("package.json:3"));
    }

    #[test]
    fn test_finding_serialization_skips_empty_location() {
        let finding = Finding::new(Severity::High, "architecture", "No tests found");
        let json = serde_json::to_string(&finding).unwrap();
        assert!(json.contains("\"severity\":\"high\""));
        assert!(!json.contains("\"file\""));
        assert!(!json.contains("\"line\""));
    }

    #[test]
    fn test_failed_result_is_empty_and_zero() {
        let result = AgentResult::failed("performance", Category::Performance, "boom", 3);
        assert!(result.failed);
        assert_eq!(result.score, 0);
        assert!(result.findings.is_empty());
        assert!(result.recommendations.is_empty());
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_completed_result_scores_findings() {
        let result = AgentResult::completed(
            "security",
            Category::Security,
            vec![Finding::new(Severity::Critical, "secrets", ".env committed")],
            vec![],
            10,
        );
        assert!(!result.failed);
        assert_eq!(result.score, 75);
        assert_eq!(result.count_severity(Severity::Critical), 1);
        assert_eq!(result.count_severity(Severity::Low), 0);
    }
}
