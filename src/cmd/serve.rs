//! Server command: `futureproof serve`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use futureproof::agents::{AgentRunner, RunnerConfig, default_agents};
use futureproof::config::{AppConfig, LlmConfig};
use futureproof::db::{AnalysisDb, DbHandle};
use futureproof::decision::{DecisionClient, LlmDecisionClient, RuleBasedDecisionClient};
use futureproof::pipeline::{PipelineDeps, PipelineRunner};
use futureproof::registry::ConnectionRegistry;
use futureproof::repo::{CloneOptions, FsExtractor, GitRepositorySource};
use futureproof::web::{self, AppState, ServeOptions};

pub async fn cmd_serve(config: AppConfig) -> Result<()> {
    config.validate()?;
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let db_path = &config.server.db_path;
    let db = AnalysisDb::new(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    info!(path = %db_path.display(), "database ready");

    let runner = Arc::new(PipelineRunner::new(PipelineDeps {
        db: DbHandle::new(db),
        registry: Arc::new(ConnectionRegistry::new(Duration::from_secs(
            config.server.ws_delivery_timeout_secs,
        ))),
        source: Arc::new(GitRepositorySource::new(CloneOptions {
            timeout: config.analysis.clone_timeout(),
            github_token: config.analysis.github_token.clone(),
            ..Default::default()
        })),
        extractor: Arc::new(FsExtractor),
        agents: AgentRunner::new(
            default_agents(),
            RunnerConfig::default()
                .with_agent_timeout(config.analysis.agent_timeout())
                .with_max_findings(config.analysis.max_findings_per_agent),
        ),
        decider: decision_client(&config.llm),
    }));
    runner.recover_interrupted().await?;

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    web::serve(
        listener,
        Arc::new(AppState { runner }),
        ServeOptions {
            dev_mode: config.server.dev_mode,
            shutdown_grace: config.analysis.shutdown_grace(),
        },
        web::shutdown_signal(),
    )
    .await
}

fn decision_client(llm: &LlmConfig) -> Arc<dyn DecisionClient> {
    match &llm.api_key {
        Some(key) => {
            info!(model = %llm.model, base_url = %llm.base_url, "using LLM decision client");
            Arc::new(LlmDecisionClient::new(llm.clone(), key.clone()))
        }
        None => Arc::new(RuleBasedDecisionClient),
    }
}
