use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::VibeConfig;
use crate::errors::{GitHubError, ReviewError};
use crate::github::GitHubClient;
use crate::review::{ReviewInputFile, Reviewer};
use crate::store::{DbHandle, Message, MessageRole, MessageType, Project};
use crate::workflow::{Dispatcher, RunEvent};

/// Upper bound on a prompt, in characters.
pub const MAX_PROMPT_CHARS: usize = 10_000;

/// Reviews stuck IN_PROGRESS longer than this are failed by cleanup.
pub const STALE_REVIEW_MINUTES: i64 = 5;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub dispatcher: Dispatcher,
    pub reviewer: Reviewer,
    pub config: Arc<VibeConfig>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub user_id: String,
    pub name: String,
    /// First prompt; when present the agent starts right away.
    pub value: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub user_id: String,
    pub value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGitHubRequest {
    pub user_id: String,
    pub enabled: bool,
    pub repo_name: Option<String>,
    pub repo_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub user_id: String,
    pub github_token: Option<String>,
    pub commit_message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub user_id: String,
    pub files: Option<Vec<ReviewInputFile>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreated {
    pub message: Message,
    pub run_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCreated {
    pub project: Project,
    pub run_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    pub commit_sha: String,
    pub repo_url: String,
    pub files_count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub message: String,
    pub updated_count: usize,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Internal(String),
    ReviewFailed { review_id: String, detail: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({"error": msg})),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({"error": msg})),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, serde_json::json!({"error": msg})),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, serde_json::json!({"error": msg})),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": msg}),
            ),
            ApiError::ReviewFailed { review_id, detail } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "error": "Failed to generate review",
                    "detail": detail,
                    "reviewId": review_id,
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Body of every 500 caused by an unexpected error; the cause is only logged.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        let chain = format!("{:#}", e);
        error!(error = %chain, "Request failed");
        ApiError::Internal(INTERNAL_ERROR_MESSAGE.to_string())
    }
}

impl From<GitHubError> for ApiError {
    fn from(e: GitHubError) -> Self {
        match e {
            GitHubError::InvalidToken => ApiError::Unauthorized(e.to_string()),
            GitHubError::RepoNotFound { .. } => ApiError::NotFound(e.diagnostic()),
            other => ApiError::Internal(other.diagnostic()),
        }
    }
}

impl From<ReviewError> for ApiError {
    fn from(e: ReviewError) -> Self {
        match e {
            ReviewError::NoFiles => ApiError::BadRequest(e.to_string()),
            ReviewError::Failed { review_id, reason } => ApiError::ReviewFailed {
                review_id,
                detail: reason,
            },
            ReviewError::Database(e) => e.into(),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route(
            "/api/projects/{id}/messages",
            get(list_messages).post(create_message),
        )
        .route("/api/projects/{id}/github", patch(update_github))
        .route("/api/projects/{id}/github/push", post(push_to_github))
        .route("/api/projects/{id}/review", post(generate_review))
        .route("/api/projects/{id}/reviews", get(list_reviews))
        .route("/api/projects/{id}/reviews/cleanup", post(cleanup_reviews))
        .route("/api/reviews/{id}", get(get_review))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// The project, or 404 when it does not exist or belongs to someone else.
async fn owned_project(state: &SharedState, id: &str, user_id: &str) -> Result<Project, ApiError> {
    let (id, user_id) = (id.to_string(), user_id.to_string());
    state
        .db
        .call(move |db| db.get_project_for_user(&id, &user_id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Project not found".into()))
}

fn validate_prompt(value: &str) -> Result<(), ApiError> {
    let chars = value.chars().count();
    if chars == 0 {
        return Err(ApiError::BadRequest("Value is required".into()));
    }
    if chars > MAX_PROMPT_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Value is too long (max {} characters)",
            MAX_PROMPT_CHARS
        )));
    }
    Ok(())
}

/// Store the user's prompt and hand it to the agent.
async fn submit_prompt(
    state: &SharedState,
    project_id: &str,
    value: String,
) -> Result<(Message, String), ApiError> {
    let pid = project_id.to_string();
    let content = value.clone();
    let message = state
        .db
        .call(move |db| db.create_message(&pid, &content, MessageRole::User, MessageType::Result))
        .await?;
    let run_id = state
        .dispatcher
        .send(RunEvent {
            project_id: project_id.to_string(),
            value,
        })
        .await?;
    Ok((message, run_id))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Name is required".into()));
    }
    if let Some(value) = &req.value {
        validate_prompt(value)?;
    }
    let user_id = req.user_id;
    let project = state
        .db
        .call(move |db| db.create_project(&user_id, &name))
        .await?;
    info!(project_id = %project.id, "Created project");

    let run_id = match req.value {
        Some(value) => Some(submit_prompt(&state, &project.id, value).await?.1),
        None => None,
    };
    Ok((StatusCode::CREATED, Json(ProjectCreated { project, run_id })))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(owned_project(&state, &id, &query.user_id).await?))
}

async fn list_messages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project = owned_project(&state, &id, &query.user_id).await?;
    let messages = state
        .db
        .call(move |db| db.list_messages(&project.id))
        .await?;
    Ok(Json(messages))
}

async fn create_message(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_prompt(&req.value)?;
    let project = owned_project(&state, &id, &req.user_id).await?;
    let (message, run_id) = submit_prompt(&state, &project.id, req.value).await?;
    Ok((StatusCode::CREATED, Json(MessageCreated { message, run_id })))
}

async fn update_github(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateGitHubRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = owned_project(&state, &id, &req.user_id).await?;
    let project = state
        .db
        .call(move |db| {
            db.update_project_github(
                &project.id,
                req.enabled,
                req.repo_name.as_deref(),
                req.repo_url.as_deref(),
            )
        })
        .await?;
    Ok(Json(project))
}

async fn push_to_github(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PushRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = req
        .github_token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| state.config.github.token.clone())
        .ok_or_else(|| ApiError::BadRequest("GitHub token is required".into()))?;

    let pid = id.clone();
    let project = state
        .db
        .call(move |db| db.get_project(&pid))
        .await?
        .ok_or_else(|| ApiError::NotFound("Project not found".into()))?;
    if project.user_id != req.user_id {
        return Err(ApiError::Forbidden("You do not have access to this project".into()));
    }
    let repo = match (&project.github_repo_name, project.github_enabled) {
        (Some(repo), true) => repo.clone(),
        _ => {
            return Err(ApiError::BadRequest(
                "GitHub sync is not enabled for this project".into(),
            ));
        }
    };

    let pid = project.id.clone();
    let fragment = state
        .db
        .call(move |db| db.latest_fragment(&pid))
        .await?
        .ok_or_else(|| ApiError::NotFound("No code found to push".into()))?;

    let commit_message = req
        .commit_message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.github.commit_message.clone());
    let client = GitHubClient::new(&state.config.github.api_base, &token)?;
    let result = client
        .push_files(&repo, &fragment.files, &commit_message)
        .await
        .inspect_err(|e| warn!(project_id = %project.id, error = %e, "Manual GitHub push failed"))?;
    info!(project_id = %project.id, commit = %result.commit_sha, files = result.files_count, "Pushed to GitHub");

    let repo_url = project
        .github_repo_url
        .unwrap_or_else(|| format!("https://github.com/{}/{}", result.owner, result.repo));
    Ok(Json(PushResponse {
        success: true,
        commit_sha: result.commit_sha,
        repo_url,
        files_count: result.files_count,
    }))
}

async fn generate_review(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = owned_project(&state, &id, &req.user_id).await?;
    let files = state.reviewer.collect_files(&project.id, req.files).await?;
    let detail = state.reviewer.generate(&project.id, files).await?;
    Ok(Json(serde_json::json!({ "review": detail })))
}

async fn list_reviews(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project = owned_project(&state, &id, &query.user_id).await?;
    let reviews = state
        .db
        .call(move |db| db.list_reviews(&project.id))
        .await?;
    Ok(Json(reviews))
}

async fn cleanup_reviews(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UserQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project = owned_project(&state, &id, &req.user_id).await?;
    let updated_count = state
        .db
        .call(move |db| db.fail_stale_reviews(&project.id, STALE_REVIEW_MINUTES))
        .await?;
    Ok(Json(CleanupResponse {
        message: "Cleanup complete".into(),
        updated_count,
    }))
}

async fn get_review(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| db.get_review_detail(&id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Review not found".into()))?;
    Ok(Json(detail))
}
