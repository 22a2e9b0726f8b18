use async_trait::async_trait;

use super::{AgentOutput, AnalysisAgent, Category, Finding, Priority, Recommendation, Severity};
use crate::errors::AgentError;
use crate::repo::CodeSnapshot;

/// Linter and formatter configuration files.
const LINT_CONFIG_PREFIXES: &[&str] = &[
    ".eslintrc",
    "eslint.config.",
    ".prettierrc",
    "prettier.config.",
    "biome.json",
    ".flake8",
    ".pylintrc",
    "ruff.toml",
    ".ruff.toml",
    "pyproject.toml",
    "setup.cfg",
    "rustfmt.toml",
    ".rustfmt.toml",
    "clippy.toml",
    ".golangci.",
    ".rubocop.yml",
    ".editorconfig",
];

/// Checks documentation, lint tooling, and file granularity.
#[derive(Debug, Clone)]
pub struct CodeQualityAgent {
    /// Average lines per source file above which the codebase is flagged.
    pub max_average_lines: usize,
}

impl Default for CodeQualityAgent {
    fn default() -> Self {
        Self {
            max_average_lines: 300,
        }
    }
}

#[async_trait]
impl AnalysisAgent for CodeQualityAgent {
    fn name(&self) -> &str {
        "code_quality"
    }

    fn category(&self) -> Category {
        Category::CodeQuality
    }

    async fn analyze(&self, snapshot: &CodeSnapshot) -> Result<AgentOutput, AgentError> {
        let mut output = AgentOutput::default();

        let has_readme = snapshot
            .file_names()
            .any(|n| n.to_lowercase().starts_with("readme"));
        if !has_readme {
            output.findings.push(
                Finding::new(Severity::Medium, "missing_readme", "No README found")
                    .with_suggestion("Document setup, usage, and architecture in a README"),
            );
        }

        let has_lint_config = snapshot.file_names().any(|n| {
            let n = n.to_lowercase();
            LINT_CONFIG_PREFIXES.iter().any(|prefix| n.starts_with(prefix))
        });
        if !has_lint_config {
            output.findings.push(
                Finding::new(
                    Severity::Low,
                    "missing_lint_config",
                    "No linter or formatter configuration found",
                )
                .with_suggestion("Add a linter and formatter and run them in CI"),
            );
        }

        if snapshot.total_files > 0 {
            let average = snapshot.total_lines / snapshot.total_files;
            if average > self.max_average_lines {
                output.findings.push(
                    Finding::new(
                        Severity::Medium,
                        "coarse_modules",
                        format!(
                            "Source files average {} lines (threshold {})",
                            average, self.max_average_lines
                        ),
                    )
                    .with_suggestion("Break large modules into focused units"),
                );
            }
        }

        output.recommendations.extend([
            Recommendation::new("code_quality", "Enforce formatting and linting in CI", Priority::Medium),
            Recommendation::new("code_quality", "Adopt code review for every change", Priority::Low),
        ]);

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_documented_linted_project_is_clean() {
        let snap = CodeSnapshot {
            paths: vec!["README.md".into(), ".eslintrc.json".into(), "src/a.js".into()],
            total_files: 1,
            total_lines: 40,
            ..Default::default()
        };
        let output = CodeQualityAgent::default().analyze(&snap).await.unwrap();
        assert!(output.findings.is_empty());
    }

    #[tokio::test]
    async fn test_bare_project_findings() {
        let snap = CodeSnapshot {
            paths: vec!["src/a.js".into()],
            total_files: 2,
            total_lines: 1000,
            ..Default::default()
        };
        let output = CodeQualityAgent::default().analyze(&snap).await.unwrap();
        let categories: Vec<&str> = output.findings.iter().map(|f| f.category()).collect();
        assert_eq!(
            categories,
            vec!["missing_readme", "missing_lint_config", "coarse_modules"]
        );
    }
}
