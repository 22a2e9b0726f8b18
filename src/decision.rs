//! Decision step: reduce agent output to a categorical verdict.
//!
//! [`DecisionClient::decide`] never fails. [`LlmDecisionClient`] asks an
//! OpenAI-compatible chat-completions endpoint (Groq by default) and turns
//! any transport, status, timeout, or parse failure into
//! [`Decision::fallback`]: `NEEDS_REVIEW` with confidence 0.0.
//! [`RuleBasedDecisionClient`] applies fixed thresholds and is used when no
//! API key is configured.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agents::{AgentResult, Severity};
use crate::config::LlmConfig;
use crate::errors::DecisionError;

/// Confidence assumed when the model omits one.
const DEFAULT_CONFIDENCE: f64 = 0.8;

/// Confidence reported by the rule-based client.
const RULE_BASED_CONFIDENCE: f64 = 0.6;

const SYSTEM_PROMPT: &str =
    "You are an expert code analysis AI that makes decisions about code modernization projects.";

static DECISION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)decision\W*:\W*(APPROVE|NEEDS[_ ]WORK|NEEDS[_ ]REVIEW|REJECT)\b").unwrap()
});
static CONFIDENCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)confidence\W*:\W*([0-9]*\.?[0-9]+)").unwrap());
static REASONING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)reasoning\W*:\s*(.+?)(?:\n[^\n]*confidence\W*:|\z)").unwrap()
});

/// The fixed set of verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionLabel {
    Approve,
    NeedsWork,
    NeedsReview,
    Reject,
}

impl DecisionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::NeedsWork => "NEEDS_WORK",
            Self::NeedsReview => "NEEDS_REVIEW",
            Self::Reject => "REJECT",
        }
    }
}

impl fmt::Display for DecisionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionLabel {
    type Err = String;

    /// Accepts `NEEDS_WORK`, `needs work`, and similar spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(' ', "_").as_str() {
            "APPROVE" => Ok(Self::Approve),
            "NEEDS_WORK" => Ok(Self::NeedsWork),
            "NEEDS_REVIEW" => Ok(Self::NeedsReview),
            "REJECT" => Ok(Self::Reject),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Llm,
    RuleBased,
    /// The decision service failed; this is the safe default.
    Fallback,
}

/// A verdict with its rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub label: DecisionLabel,
    pub rationale: String,
    /// In [0.0, 1.0].
    pub confidence: f64,
    pub source: DecisionSource,
}

impl Decision {
    pub fn new(label: DecisionLabel, rationale: impl Into<String>, confidence: f64, source: DecisionSource) -> Self {
        Self {
            label,
            rationale: rationale.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source,
        }
    }

    /// The non-fatal default used whenever the decision service fails.
    pub fn fallback(error: &str) -> Self {
        Self::new(
            DecisionLabel::NeedsReview,
            format!("Error in AI analysis: {}", error),
            0.0,
            DecisionSource::Fallback,
        )
    }
}

/// Everything the decision step sees.
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub project_name: &'a str,
    pub language: Option<&'a str>,
    pub framework: Option<&'a str>,
    pub total_files: usize,
    pub total_lines: usize,
    pub aggregate_score: f64,
    pub results: &'a [AgentResult],
}

impl DecisionRequest<'_> {
    pub fn critical_findings(&self) -> usize {
        self.results
            .iter()
            .map(|r| r.count_severity(Severity::Critical))
            .sum()
    }
}

/// Turns agent output into a decision. Must not fail.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    async fn decide(&self, request: &DecisionRequest<'_>) -> Decision;
}

/// Deterministic thresholds over aggregate score and critical findings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedDecisionClient;

impl RuleBasedDecisionClient {
    pub fn evaluate(request: &DecisionRequest<'_>) -> Decision {
        let critical = request.critical_findings();
        let score = request.aggregate_score;
        let (label, why) = if critical >= 3 || score < 40.0 {
            (DecisionLabel::Reject, "too many critical issues or a very low score")
        } else if score >= 80.0 && critical == 0 {
            (DecisionLabel::Approve, "high score with no critical issues")
        } else if score >= 60.0 {
            (DecisionLabel::NeedsWork, "moderate score with issues to address")
        } else {
            (DecisionLabel::NeedsReview, "borderline score requiring human review")
        };
        Decision::new(
            label,
            format!(
                "Aggregate score {:.2}/100 with {} critical finding(s): {}",
                score, critical, why
            ),
            RULE_BASED_CONFIDENCE,
            DecisionSource::RuleBased,
        )
    }
}

#[async_trait]
impl DecisionClient for RuleBasedDecisionClient {
    async fn decide(&self, request: &DecisionRequest<'_>) -> Decision {
        Self::evaluate(request)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct LlmDecisionClient {
    http: reqwest::Client,
    config: LlmConfig,
    api_key: String,
}

impl LlmDecisionClient {
    pub fn new(config: LlmConfig, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn request(&self, request: &DecisionRequest<'_>) -> Result<Decision, DecisionError> {
        let prompt = build_decision_prompt(request);
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let call = async {
            let resp = self
                .http
                .post(self.endpoint())
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(DecisionError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(500).collect(),
                });
            }
            Ok(resp.json::<ChatResponse>().await?)
        };

        let parsed = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| DecisionError::Timeout {
                secs: self.config.timeout_secs,
            })??;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| DecisionError::Parse("response contained no message content".into()))?;

        parse_decision_response(&content)
    }
}

#[async_trait]
impl DecisionClient for LlmDecisionClient {
    async fn decide(&self, request: &DecisionRequest<'_>) -> Decision {
        let start = Instant::now();
        match self.request(request).await {
            Ok(decision) => {
                info!(
                    decision = %decision.label,
                    confidence = decision.confidence,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "decision received"
                );
                decision
            }
            Err(e) => {
                warn!(error = %e, "decision service failed, falling back to NEEDS_REVIEW");
                Decision::fallback(&e.to_string())
            }
        }
    }
}

/// Build the user prompt for the decision model.
pub fn build_decision_prompt(request: &DecisionRequest<'_>) -> String {
    let summaries: Vec<serde_json::Value> = request
        .results
        .iter()
        .map(|r| {
            serde_json::json!({
                "agent": r.agent,
                "score": r.score,
                "failed": r.failed,
                "error": r.error,
                "findings": r.findings,
            })
        })
        .collect();
    let findings_json =
        serde_json::to_string_pretty(&summaries).unwrap_or_else(|_| "[]".to_string());

    format!(
        r#"Analyze this codebase and make a modernization decision:

Project: {name}
Language: {language}
Framework: {framework}
Files: {files}
Lines of Code: {lines}

Analysis Results:
- Aggregate Score: {score:.2}/100
- Critical Issues: {critical}

Agent Findings:
{findings}

Based on this analysis, make one of these decisions:
1. APPROVE - Code is production-ready with minor improvements
2. NEEDS_WORK - Significant issues that need addressing
3. NEEDS_REVIEW - Borderline case requiring human review
4. REJECT - Too many critical issues, major refactoring needed

Respond with a JSON object:
{{"decision": "APPROVE|NEEDS_WORK|NEEDS_REVIEW|REJECT", "reasoning": "...", "confidence": 0.0-1.0}}
"#,
        name = request.project_name,
        language = request.language.unwrap_or("Unknown"),
        framework = request.framework.unwrap_or("Unknown"),
        files = request.total_files,
        lines = request.total_lines,
        score = request.aggregate_score,
        critical = request.critical_findings(),
        findings = findings_json,
    )
}

/// Parse a model response: a JSON object (fenced or bare) or
/// `Decision: / Reasoning: / Confidence:` lines.
pub fn parse_decision_response(response: &str) -> Result<Decision, DecisionError> {
    if let Some(json_str) = extract_json(response)
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&json_str)
        && let Some(label) = value.get("decision").and_then(|v| v.as_str())
    {
        let label = DecisionLabel::from_str(label).map_err(DecisionError::Parse)?;
        let reasoning = value
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or("No reasoning provided");
        let confidence = value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_CONFIDENCE);
        return Ok(Decision::new(label, reasoning, confidence, DecisionSource::Llm));
    }

    let caps = DECISION_LINE
        .captures(response)
        .ok_or_else(|| DecisionError::Parse("no decision label in response".into()))?;
    let label = DecisionLabel::from_str(&caps[1]).map_err(DecisionError::Parse)?;
    let confidence = CONFIDENCE_LINE
        .captures(response)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(DEFAULT_CONFIDENCE);
    let reasoning = REASONING_BLOCK
        .captures(response)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| response.trim().to_string());
    debug!(%label, confidence, "parsed text-format decision");
    Ok(Decision::new(label, reasoning, confidence, DecisionSource::Llm))
}

/// Extract a JSON object from a fenced block or the first balanced braces.
fn extract_json(response: &str) -> Option<String> {
    if let Some(start) = response.find("```json") {
        let after_marker = &response[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    if let Some(start) = response.find("```") {
        let after_marker = &response[start + 3..];
        if let Some(end) = after_marker.find("```")
            && let Some(json_start) = after_marker[..end].find('{')
        {
            return Some(after_marker[json_start..end].trim().to_string());
        }
    }

    let start = response.find('{')?;
    let mut depth = 0;
    for (i, c) in response[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(response[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Category, Finding};
    use axum::{Json, Router, http::StatusCode, routing::post};

    fn request<'a>(score: f64, results: &'a [AgentResult]) -> DecisionRequest<'a> {
        DecisionRequest {
            project_name: "demo",
            language: Some("Python"),
            framework: None,
            total_files: 10,
            total_lines: 500,
            aggregate_score: score,
            results,
        }
    }

    fn critical_result(n: usize) -> AgentResult {
        let findings = (0..n)
            .map(|i| Finding::new(Severity::Critical, "exposed_secrets", format!("secret {}", i)))
            .collect();
        AgentResult::completed("security", Category::Security, findings, vec![], 0)
    }

    /// Serve `router` on an ephemeral port and return its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn llm_config(base_url: String, timeout_secs: u64) -> LlmConfig {
        LlmConfig {
            base_url,
            timeout_secs,
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_label_from_str_variants() {
        assert_eq!(DecisionLabel::from_str("approve").unwrap(), DecisionLabel::Approve);
        assert_eq!(DecisionLabel::from_str("Needs Work").unwrap(), DecisionLabel::NeedsWork);
        assert_eq!(DecisionLabel::from_str("NEEDS_REVIEW").unwrap(), DecisionLabel::NeedsReview);
        assert!(DecisionLabel::from_str("MAYBE").is_err());
    }

    #[test]
    fn test_label_serialization() {
        let json = serde_json::to_string(&DecisionLabel::NeedsWork).unwrap();
        assert_eq!(json, "\"NEEDS_WORK\"");
    }

    #[test]
    fn test_fallback_is_needs_review_with_zero_confidence() {
        let d = Decision::fallback("connection refused");
        assert_eq!(d.label, DecisionLabel::NeedsReview);
        assert_eq!(d.confidence, 0.0);
        assert_eq!(d.source, DecisionSource::Fallback);
        assert!(d.rationale.contains("connection refused"));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let d = Decision::new(DecisionLabel::Approve, "x", 3.5, DecisionSource::Llm);
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn test_parse_json_response() {
        let d = parse_decision_response(
            r#"{"decision": "NEEDS_WORK", "reasoning": "Tests missing", "confidence": 0.72}"#,
        )
        .unwrap();
        assert_eq!(d.label, DecisionLabel::NeedsWork);
        assert_eq!(d.rationale, "Tests missing");
        assert_eq!(d.confidence, 0.72);
    }

    #[test]
    fn test_parse_fenced_json_response() {
        let response = "Here you go:\n```json\n{\"decision\": \"approve\", \"reasoning\": \"Clean\"}\n```";
        let d = parse_decision_response(response).unwrap();
        assert_eq!(d.label, DecisionLabel::Approve);
        assert_eq!(d.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_parse_text_response() {
        let response = "Decision: **REJECT**\nReasoning: Secrets are committed\nand nothing is tested.\nConfidence: 0.9\n";
        let d = parse_decision_response(response).unwrap();
        assert_eq!(d.label, DecisionLabel::Reject);
        assert_eq!(d.confidence, 0.9);
        assert_eq!(d.rationale, "Secrets are committed\nand nothing is tested.");
    }

    #[test]
    fn test_parse_garbage_is_an_error() {
        assert!(parse_decision_response("I cannot help with that.").is_err());
        assert!(parse_decision_response(r#"{"decision": "MAYBE"}"#).is_err());
    }

    #[test]
    fn test_extract_json_balanced_braces() {
        let text = r#"prefix {"a": {"b": 1}} suffix"#;
        assert_eq!(extract_json(text).unwrap(), r#"{"a": {"b": 1}}"#);
        assert_eq!(extract_json("no braces"), None);
        assert_eq!(extract_json("{ unbalanced"), None);
    }

    #[test]
    fn test_rule_based_thresholds() {
        let none: Vec<AgentResult> = vec![];
        assert_eq!(RuleBasedDecisionClient::evaluate(&request(92.0, &none)).label, DecisionLabel::Approve);
        assert_eq!(RuleBasedDecisionClient::evaluate(&request(70.0, &none)).label, DecisionLabel::NeedsWork);
        assert_eq!(RuleBasedDecisionClient::evaluate(&request(50.0, &none)).label, DecisionLabel::NeedsReview);
        assert_eq!(RuleBasedDecisionClient::evaluate(&request(20.0, &none)).label, DecisionLabel::Reject);

        let one_critical = vec![critical_result(1)];
        assert_eq!(
            RuleBasedDecisionClient::evaluate(&request(92.0, &one_critical)).label,
            DecisionLabel::NeedsWork
        );
        let many_critical = vec![critical_result(3)];
        assert_eq!(
            RuleBasedDecisionClient::evaluate(&request(92.0, &many_critical)).label,
            DecisionLabel::Reject
        );
    }

    #[test]
    fn test_prompt_mentions_metadata_and_findings() {
        let results = vec![critical_result(1)];
        let prompt = build_decision_prompt(&request(55.5, &results));
        assert!(prompt.contains("Project: demo"));
        assert!(prompt.contains("55.50/100"));
        assert!(prompt.contains("Critical Issues: 1"));
        assert!(prompt.contains("secret 0"));
    }

    #[tokio::test]
    async fn test_llm_client_parses_successful_completion() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                Json(serde_json::json!({
                    "choices": [{"message": {"content": "{\"decision\": \"APPROVE\", \"reasoning\": \"ok\", \"confidence\": 0.95}"}}]
                }))
            }),
        );
        let base = serve(router).await;
        let client = LlmDecisionClient::new(llm_config(base, 5), "test-key");
        let d = client.decide(&request(90.0, &[])).await;
        assert_eq!(d.label, DecisionLabel::Approve);
        assert_eq!(d.source, DecisionSource::Llm);
        assert_eq!(d.confidence, 0.95);
    }

    #[tokio::test]
    async fn test_llm_client_falls_back_on_error_status() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base = serve(router).await;
        let client = LlmDecisionClient::new(llm_config(base, 5), "test-key");
        let d = client.decide(&request(90.0, &[])).await;
        assert_eq!(d.label, DecisionLabel::NeedsReview);
        assert_eq!(d.confidence, 0.0);
        assert!(d.rationale.contains("429"));
    }

    #[tokio::test]
    async fn test_llm_client_falls_back_on_malformed_body() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { Json(serde_json::json!({"choices": []})) }),
        );
        let base = serve(router).await;
        let client = LlmDecisionClient::new(llm_config(base, 5), "test-key");
        let d = client.decide(&request(90.0, &[])).await;
        assert_eq!(d.source, DecisionSource::Fallback);
        assert_eq!(d.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_llm_client_falls_back_on_timeout() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(serde_json::json!({"choices": []}))
            }),
        );
        let base = serve(router).await;
        let mut config = llm_config(base, 1);
        config.timeout_secs = 1;
        let client = LlmDecisionClient::new(config, "test-key");
        let d = client.decide(&request(90.0, &[])).await;
        assert_eq!(d.label, DecisionLabel::NeedsReview);
        assert!(d.rationale.contains("timed out"));
    }

    #[tokio::test]
    async fn test_llm_client_falls_back_when_unreachable() {
        let client = LlmDecisionClient::new(llm_config("http://127.0.0.1:1".to_string(), 2), "k");
        let d = client.decide(&request(90.0, &[])).await;
        assert_eq!(d.label, DecisionLabel::NeedsReview);
        assert_eq!(d.confidence, 0.0);
    }
}
