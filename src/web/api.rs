use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::ws;
use crate::errors::AdmissionError;
use crate::models::{AnalysisRun, NewProject, ProjectStatus, RecentActivity};
use crate::pipeline::PipelineRunner;
use crate::repo::validate_repo_url;

const MAX_NAME_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 1000;
const DEFAULT_PAGE_SIZE: u32 = 10;
const MAX_PAGE_SIZE: u32 = 100;
const ACTIVITY_LIMIT: u32 = 10;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub runner: Arc<PipelineRunner>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ─────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ProjectStatusResponse {
    pub project_id: i64,
    pub status: ProjectStatus,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_run_id: Option<String>,
    /// Last finished run. Omitted while a run is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_run: Option<AnalysisRun>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match &err {
            AdmissionError::ProjectNotFound { .. } => ApiError::NotFound(err.to_string()),
            AdmissionError::AlreadyRunning { .. } => ApiError::Conflict(err.to_string()),
            AdmissionError::ShuttingDown => ApiError::Unavailable(err.to_string()),
            AdmissionError::Database(e) => {
                error!(error = %e, "database error during admission");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %err, "request failed");
    ApiError::Internal(err.to_string())
}

fn project_not_found(id: i64) -> ApiError {
    ApiError::NotFound(format!("Project {} not found", id))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{id}",
            get(get_project).delete(delete_project),
        )
        .route("/api/projects/{id}/analyze", post(analyze_project))
        .route("/api/projects/{id}/status", get(project_status))
        .route("/api/projects/{id}/runs", get(list_runs))
        .route("/api/runs/{run_id}", get(get_run))
        .route("/api/dashboard/stats", get(dashboard_stats))
        .route("/api/dashboard/activity", get(dashboard_activity))
        .route("/ws/stats", get(ws::ws_stats))
        .route("/ws/{project_id}", get(ws::ws_handler))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Trim and check a create request.
fn validate_new_project(req: NewProject) -> Result<NewProject, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "Project name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    let repo_url = req.repo_url.trim().to_string();
    validate_repo_url(&repo_url).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let description = req
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());
    if description
        .as_ref()
        .is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LEN)
    {
        return Err(ApiError::BadRequest(format!(
            "Project description must be at most {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }

    Ok(NewProject {
        name,
        repo_url,
        description,
    })
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let page = params.page.unwrap_or(1);
    let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page == 0 {
        return Err(ApiError::BadRequest("page must be at least 1".into()));
    }
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(ApiError::BadRequest(format!(
            "page_size must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    let listing = state
        .runner
        .db()
        .call(move |db| db.list_projects(page, page_size))
        .await
        .map_err(internal)?;
    Ok(Json(listing))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<NewProject>,
) -> Result<impl IntoResponse, ApiError> {
    let new = validate_new_project(req)?;
    let project = state
        .runner
        .db()
        .call(move |db| db.create_project(&new))
        .await
        .map_err(internal)?;
    info!(project_id = project.id, name = %project.name, "project created");
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .runner
        .db()
        .call(move |db| db.get_project(id))
        .await
        .map_err(internal)?;
    match project {
        Some(project) => Ok(Json(project)),
        None => Err(project_not_found(id)),
    }
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.runner.delete_project(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(project_not_found(id))
    }
}

async fn analyze_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state.runner.start(id).await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

async fn project_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    // Active first: a run that ends in between shows up in `latest_run`.
    let active_run_id = state.runner.active_run(id).await;
    let (project, latest_run) = state
        .runner
        .db()
        .call(move |db| Ok((db.get_project(id)?, db.latest_run(id)?)))
        .await
        .map_err(internal)?;
    let project = project.ok_or_else(|| project_not_found(id))?;
    let latest_run = latest_run.filter(|_| active_run_id.is_none());

    Ok(Json(ProjectStatusResponse {
        project_id: project.id,
        status: project.status,
        updated_at: project.updated_at,
        active_run_id,
        latest_run,
    }))
}

async fn list_runs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (project, runs) = state
        .runner
        .db()
        .call(move |db| Ok((db.get_project(id)?, db.list_runs(id)?)))
        .await
        .map_err(internal)?;
    if project.is_none() {
        return Err(project_not_found(id));
    }
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    // A run leaves the active table only after its row is written.
    if let Some(project_id) = state.runner.project_for_active_run(&run_id).await {
        return Ok(Json(serde_json::json!({
            "run_id": run_id,
            "project_id": project_id,
            "status": "running",
        }))
        .into_response());
    }
    let lookup = run_id.clone();
    let run = state
        .runner
        .db()
        .call(move |db| db.get_run(&lookup))
        .await
        .map_err(internal)?;
    match run {
        Some(run) => Ok(Json(run).into_response()),
        None => Err(ApiError::NotFound(format!("Run {} not found", run_id))),
    }
}

async fn dashboard_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .runner
        .db()
        .call(|db| db.dashboard_stats())
        .await
        .map_err(internal)?;
    Ok(Json(stats))
}

async fn dashboard_activity(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let activities = state
        .runner
        .db()
        .call(|db| db.recent_activity(ACTIVITY_LIMIT))
        .await
        .map_err(internal)?;
    Ok(Json(RecentActivity {
        total: activities.len(),
        activities,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::test_support::{test_state, test_state_with_gate};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn create(state: &SharedState, name: &str) -> i64 {
        let resp = app(state.clone())
            .oneshot(post_json(
                "/api/projects",
                serde_json::json!({"name": name, "repo_url": "https://github.com/acme/widget"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let resp = app(test_state()).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_and_get_project() {
        let state = test_state();
        let id = create(&state, "widget").await;

        let resp = app(state).oneshot(get(&format!("/api/projects/{}", id))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["name"], "widget");
        assert_eq!(json["status"], "pending");
    }

    #[tokio::test]
    async fn test_create_project_rejects_bad_input() {
        let state = test_state();
        let cases = [
            serde_json::json!({"name": "  ", "repo_url": "https://github.com/a/b"}),
            serde_json::json!({"name": "x".repeat(256), "repo_url": "https://github.com/a/b"}),
            serde_json::json!({"name": "ok", "repo_url": "not a url"}),
            serde_json::json!({"name": "ok", "repo_url": "https://github.com/"}),
        ];
        for body in cases {
            let resp = app(state.clone())
                .oneshot(post_json("/api/projects", body.clone()))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", body);
            assert!(body_json(resp).await["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_get_missing_project_is_404_json() {
        let resp = app(test_state()).oneshot(get("/api/projects/999")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "Project 999 not found");
    }

    #[tokio::test]
    async fn test_list_projects_paginates_newest_first() {
        let state = test_state();
        for name in ["a", "b", "c"] {
            create(&state, name).await;
        }
        let resp = app(state)
            .oneshot(get("/api/projects?page=1&page_size=2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total"], 3);
        assert_eq!(json["page_size"], 2);
        let names: Vec<&str> = json["projects"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_list_projects_rejects_out_of_range_paging() {
        let state = test_state();
        for uri in ["/api/projects?page=0", "/api/projects?page_size=0", "/api/projects?page_size=101"] {
            let resp = app(state.clone()).oneshot(get(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_delete_project() {
        let state = test_state();
        let id = create(&state, "doomed").await;
        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/projects/{}", id))
                .body(Body::empty())
                .unwrap()
        };
        let resp = app(state.clone()).oneshot(delete()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app(state).oneshot(delete()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_analyze_missing_project_is_404() {
        let resp = app(test_state())
            .oneshot(post_json("/api/projects/42/analyze", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_analyze_conflicts_while_running_and_blocks_delete() {
        let (state, release) = test_state_with_gate();
        let id = create(&state, "busy").await;

        let resp = app(state.clone())
            .oneshot(post_json(&format!("/api/projects/{}/analyze", id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let ticket = body_json(resp).await;
        let run_id = ticket["run_id"].as_str().unwrap().to_string();
        assert_eq!(ticket["project_id"], id);

        let resp = app(state.clone())
            .oneshot(post_json(&format!("/api/projects/{}/analyze", id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app(state.clone())
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/projects/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app(state.clone()).oneshot(get(&format!("/api/runs/{}", run_id))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "running");

        let resp = app(state.clone())
            .oneshot(get(&format!("/api/projects/{}/status", id)))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["active_run_id"], run_id.as_str());

        release.notify_one();
        for _ in 0..200 {
            if state.runner.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let resp = app(state.clone()).oneshot(get(&format!("/api/runs/{}", run_id))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let run = body_json(resp).await;
        assert_eq!(run["status"], "completed");
        assert_eq!(run["project_id"], id);

        let resp = app(state.clone())
            .oneshot(get(&format!("/api/projects/{}/runs", id)))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

        let resp = app(state)
            .oneshot(get(&format!("/api/projects/{}/status", id)))
            .await
            .unwrap();
        let status = body_json(resp).await;
        assert_eq!(status["status"], "completed");
        assert!(status.get("active_run_id").is_none());
        assert_eq!(status["latest_run"]["id"], run_id.as_str());
    }

    #[tokio::test]
    async fn test_status_hides_previous_run_while_a_new_one_is_active() {
        let (state, release) = test_state_with_gate();
        let id = create(&state, "again").await;

        let first = state.runner.start(id).await.unwrap();
        release.notify_one();
        for _ in 0..200 {
            if state.runner.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let resp = app(state.clone())
            .oneshot(get(&format!("/api/projects/{}/status", id)))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["latest_run"]["id"], first.run_id.as_str());

        let second = state.runner.start(id).await.unwrap();
        let resp = app(state.clone())
            .oneshot(get(&format!("/api/projects/{}/status", id)))
            .await
            .unwrap();
        let status = body_json(resp).await;
        assert_eq!(status["active_run_id"], second.run_id.as_str());
        assert!(status.get("latest_run").is_none());

        release.notify_one();
        state.runner.shutdown(std::time::Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_dashboard_stats() {
        let state = test_state();
        let resp = app(state.clone()).oneshot(get("/api/dashboard/stats")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let empty = body_json(resp).await;
        assert_eq!(empty["total_projects"], 0);
        assert_eq!(empty["average_score"], 0.0);

        let id = create(&state, "scored").await;
        create(&state, "waiting").await;
        state.runner.start(id).await.unwrap();
        for _ in 0..200 {
            if state.runner.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let resp = app(state).oneshot(get("/api/dashboard/stats")).await.unwrap();
        let stats = body_json(resp).await;
        assert_eq!(stats["total_projects"], 2);
        assert_eq!(stats["pending_projects"], 1);
        assert_eq!(stats["completed_projects"], 1);
        assert_eq!(stats["active_projects"], 0);
        assert_eq!(stats["failed_projects"], 0);
        assert_eq!(stats["total_analyses"], 1);
        let average = stats["average_score"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&average));
    }

    #[tokio::test]
    async fn test_dashboard_activity_lists_newest_ten() {
        let state = test_state();
        for i in 0..12 {
            create(&state, &format!("p{}", i)).await;
        }
        let resp = app(state).oneshot(get("/api/dashboard/activity")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total"], 10);
        let activities = json["activities"].as_array().unwrap();
        assert_eq!(activities.len(), 10);
        assert_eq!(activities[0]["project_name"], "p11");
        assert_eq!(activities[0]["type"], "project_created");
        assert_eq!(activities[0]["status"], "pending");
        assert_eq!(activities[9]["project_name"], "p2");
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let resp = app(test_state()).oneshot(get("/api/runs/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_runs_of_missing_project_is_404() {
        let resp = app(test_state()).oneshot(get("/api/projects/5/runs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_analyze_after_shutdown_is_503() {
        let state = test_state();
        let id = create(&state, "late").await;
        state.runner.shutdown(std::time::Duration::ZERO).await;
        let resp = app(state)
            .oneshot(post_json(&format!("/api/projects/{}/analyze", id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
