use async_trait::async_trait;

use super::{AgentOutput, AnalysisAgent, Category, Finding, Priority, Recommendation, Severity};
use crate::errors::AgentError;
use crate::repo::CodeSnapshot;

/// Manifest → lock files that pin it (any one suffices).
const LOCK_FILES: &[(&str, &[&str])] = &[
    (
        "package.json",
        &["package-lock.json", "yarn.lock", "pnpm-lock.yaml", "bun.lockb"],
    ),
    ("Cargo.toml", &["Cargo.lock"]),
    ("go.mod", &["go.sum"]),
    ("pyproject.toml", &["poetry.lock", "uv.lock", "pdm.lock"]),
    ("Gemfile", &["Gemfile.lock"]),
    ("composer.json", &["composer.lock"]),
];

/// Checks dependency hygiene and project upkeep.
#[derive(Debug, Clone)]
pub struct MaintainabilityAgent {
    /// Declared dependency count above which the project is flagged.
    pub max_dependencies: usize,
}

impl Default for MaintainabilityAgent {
    fn default() -> Self {
        Self {
            max_dependencies: 100,
        }
    }
}

fn has_ci(snapshot: &CodeSnapshot) -> bool {
    snapshot.any_path(|p| {
        p.starts_with(".github/workflows/")
            || p == ".gitlab-ci.yml"
            || p.starts_with(".circleci/")
            || p == "jenkinsfile"
            || p == "azure-pipelines.yml"
    })
}

#[async_trait]
impl AnalysisAgent for MaintainabilityAgent {
    fn name(&self) -> &str {
        "maintainability"
    }

    fn category(&self) -> Category {
        Category::Maintainability
    }

    async fn analyze(&self, snapshot: &CodeSnapshot) -> Result<AgentOutput, AgentError> {
        let mut output = AgentOutput::default();
        let root_files: Vec<&str> = snapshot
            .paths
            .iter()
            .filter(|p| !p.contains('/'))
            .map(String::as_str)
            .collect();

        if snapshot.dependencies.is_empty() {
            output.findings.push(
                Finding::new(
                    Severity::Low,
                    "no_dependencies",
                    "Could not find declared package dependencies",
                )
                .with_suggestion("Declare dependencies in requirements.txt, package.json, Cargo.toml, or go.mod"),
            );
        }

        for (manifest, locks) in LOCK_FILES {
            if root_files.contains(manifest) && !locks.iter().any(|l| root_files.contains(l)) {
                output.findings.push(
                    Finding::new(
                        Severity::Medium,
                        "missing_lock_file",
                        format!("{} has no accompanying lock file", manifest),
                    )
                    .with_file(*manifest)
                    .with_suggestion(format!("Commit one of: {}", locks.join(", "))),
                );
            }
        }

        let dependency_count = snapshot.dependency_count();
        if dependency_count > self.max_dependencies {
            output.findings.push(Finding::new(
                Severity::Medium,
                "dependency_sprawl",
                format!("{} declared dependencies", dependency_count),
            ));
        }

        if !has_ci(snapshot) {
            output.findings.push(
                Finding::new(Severity::Low, "missing_ci", "No CI configuration found")
                    .with_suggestion("Run tests automatically on every push"),
            );
        }

        output.recommendations.extend([
            Recommendation::new("maintainability", "Regularly update dependencies to latest stable versions", Priority::High),
            Recommendation::new("maintainability", "Use dependency scanning tools (Dependabot, Snyk)", Priority::High),
            Recommendation::new("maintainability", "Pin dependency versions for reproducible builds", Priority::Medium),
        ]);

        Ok(output)
    }
}
