use async_trait::async_trait;

use super::{AgentOutput, AnalysisAgent, Category, Finding, Priority, Recommendation, Severity};
use crate::errors::AgentError;
use crate::repo::CodeSnapshot;

const CONFIG_FILE_NAMES: &[&str] = &[
    "config.py",
    "settings.py",
    "config.json",
    "config.js",
    "config.ts",
    "config.yaml",
    "config.yml",
    "config.toml",
    ".env.example",
    "application.properties",
    "application.yml",
    "appsettings.json",
];

fn has_tests(snapshot: &CodeSnapshot) -> bool {
    snapshot.any_path(|p| {
        p.split('/')
            .any(|segment| segment.contains("test") || segment.contains(".spec."))
    })
}

fn has_config(snapshot: &CodeSnapshot) -> bool {
    snapshot
        .file_names()
        .any(|n| CONFIG_FILE_NAMES.contains(&n.to_lowercase().as_str()))
        || snapshot.any_path(|p| p.starts_with("config/") || p.contains("/config/"))
}

/// Checks project structure: tests and configuration management.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchitectureAgent;

#[async_trait]
impl AnalysisAgent for ArchitectureAgent {
    fn name(&self) -> &str {
        "architecture"
    }

    fn category(&self) -> Category {
        Category::Architecture
    }

    async fn analyze(&self, snapshot: &CodeSnapshot) -> Result<AgentOutput, AgentError> {
        let mut output = AgentOutput::default();

        let tests_present = has_tests(snapshot);
        if !tests_present {
            output.findings.push(
                Finding::new(
                    Severity::High,
                    "missing_tests",
                    "Project lacks a dedicated test directory",
                )
                .with_suggestion("Create a tests/ directory and add unit tests"),
            );
        }

        if !has_config(snapshot) {
            output.findings.push(
                Finding::new(
                    Severity::Medium,
                    "missing_config",
                    "No centralized configuration found",
                )
                .with_suggestion("Create a config file or read settings from environment variables"),
            );
        }

        if !tests_present {
            output.recommendations.push(Recommendation::new(
                "architecture",
                "Implement comprehensive test coverage (aim for >80%)",
                Priority::High,
            ));
        }
        output.recommendations.extend([
            Recommendation::new("architecture", "Implement API versioning for backward compatibility", Priority::Medium),
            Recommendation::new("architecture", "Add health check endpoints for monitoring", Priority::Medium),
        ]);

        Ok(output)
    }
}
