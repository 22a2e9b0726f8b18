use async_trait::async_trait;

use super::{AgentOutput, AnalysisAgent, Category, Finding, Priority, Recommendation, Severity};
use crate::errors::AgentError;
use crate::repo::CodeSnapshot;

/// Flags oversized source files.
#[derive(Debug, Clone)]
pub struct PerformanceAgent {
    pub large_file_lines: usize,
    pub huge_file_lines: usize,
    /// Past this many oversized files, add a profiling recommendation.
    pub many_large_files: usize,
}

impl Default for PerformanceAgent {
    fn default() -> Self {
        Self {
            large_file_lines: 500,
            huge_file_lines: 1000,
            many_large_files: 10,
        }
    }
}

#[async_trait]
impl AnalysisAgent for PerformanceAgent {
    fn name(&self) -> &str {
        "performance"
    }

    fn category(&self) -> Category {
        Category::Performance
    }

    async fn analyze(&self, snapshot: &CodeSnapshot) -> Result<AgentOutput, AgentError> {
        let mut output = AgentOutput::default();

        let mut large: Vec<_> = snapshot
            .files
            .iter()
            .filter(|f| f.lines > self.large_file_lines)
            .collect();
        large.sort_by(|a, b| b.lines.cmp(&a.lines).then_with(|| a.path.cmp(&b.path)));

        for file in &large {
            let severity = if file.lines > self.huge_file_lines {
                Severity::High
            } else {
                Severity::Medium
            };
            output.findings.push(
                Finding::new(
                    severity,
                    "large_file",
                    format!("{} has {} lines", file.path, file.lines),
                )
                .with_file(file.path.clone())
                .with_suggestion("Split the file into smaller modules"),
            );
        }

        if large.len() > self.many_large_files {
            output.recommendations.push(Recommendation::new(
                "performance",
                format!(
                    "{} files exceed {} lines; profile the hot paths before refactoring",
                    large.len(),
                    self.large_file_lines
                ),
                Priority::High,
            ));
        }
        output.recommendations.extend([
            Recommendation::new("performance", "Implement a caching strategy for expensive reads", Priority::High),
            Recommendation::new("performance", "Add database query optimization and indexing", Priority::High),
            Recommendation::new("performance", "Use asynchronous I/O for network and disk access", Priority::Medium),
        ]);

        Ok(output)
    }
}
