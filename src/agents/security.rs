use async_trait::async_trait;

use super::{AgentOutput, AnalysisAgent, Category, Finding, Priority, Recommendation, Severity};
use crate::errors::AgentError;
use crate::repo::CodeSnapshot;

/// File names that should never be committed.
const SECRET_FILE_NAMES: &[&str] = &[
    ".env",
    "secrets.json",
    "credentials.json",
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
];

/// Extensions of key material.
const KEY_EXTENSIONS: &[&str] = &[".pem", ".key", ".p12", ".pfx"];

/// `.env.*` variants that are safe templates.
const ENV_TEMPLATES: &[&str] = &[".env.example", ".env.sample", ".env.template"];

fn is_secret_file(name: &str) -> bool {
    let name = name.to_lowercase();
    if ENV_TEMPLATES.contains(&name.as_str()) {
        return false;
    }
    SECRET_FILE_NAMES.contains(&name.as_str())
        || name.starts_with(".env.")
        || KEY_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Flags committed secrets and key material.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityAgent;

#[async_trait]
impl AnalysisAgent for SecurityAgent {
    fn name(&self) -> &str {
        "security"
    }

    fn category(&self) -> Category {
        Category::Security
    }

    async fn analyze(&self, snapshot: &CodeSnapshot) -> Result<AgentOutput, AgentError> {
        let mut output = AgentOutput::default();

        for path in &snapshot.paths {
            let name = path.rsplit('/').next().unwrap_or(path.as_str());
            if is_secret_file(name) {
                output.findings.push(
                    Finding::new(
                        Severity::Critical,
                        "exposed_secrets",
                        format!("Potential secret file committed: {}", path),
                    )
                    .with_file(path.clone())
                    .with_suggestion("Remove it from the repository, add it to .gitignore, and load secrets from the environment"),
                );
            }
        }

        if !snapshot.file_names().any(|n| n == ".gitignore") && !snapshot.paths.is_empty() {
            output.findings.push(
                Finding::new(Severity::Low, "missing_gitignore", "No .gitignore found")
                    .with_suggestion("Add a .gitignore so local secrets and build output stay out of git"),
            );
        }

        if output.findings.iter().any(|f| f.severity().is_critical()) {
            output.recommendations.push(Recommendation::new(
                "security",
                "Rotate every credential that was committed to the repository",
                Priority::High,
            ));
        }
        output.recommendations.extend([
            Recommendation::new("security", "Implement rate limiting on API endpoints", Priority::High),
            Recommendation::new("security", "Add input validation and sanitization", Priority::High),
            Recommendation::new("security", "Enable HTTPS and secure headers (HSTS, CSP)", Priority::High),
        ]);

        Ok(output)
    }
}
