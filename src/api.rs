use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::{
    coordinator::FallbackPolicy,
    error::StoreError,
    models::{
        now, History, NewHistory, NewProposal, NewSession, Proposal, Session, SuggestionRequest,
        SuggestionResponse,
    },
    schema_mapper::session_patch,
    store::RecordStore,
    AppState,
};

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn session_not_found(session_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "SESSION_NOT_FOUND",
            format!("Session `{session_id}` not found."),
        )
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.code,
                    "message": self.message
                }
            })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::Validation(_) => StatusCode::BAD_REQUEST,
            StoreError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Decode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(code = err.code(), error = %err, "Store operation failed");
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "backend": state.store.primary_backend(),
        "fallback": state.store.secondary_backend(),
        "fallbackEnabled": state.store.policy() == FallbackPolicy::Enabled,
    }))
}

pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.store.list_sessions().await?))
}

pub async fn create_session(
    State(state): State<AppState>,
    payload: Option<Json<NewSession>>,
) -> ApiResult<impl IntoResponse> {
    let name = payload.and_then(|Json(body)| body.name);
    let session = state.store.create_session(Session::new(name)).await?;
    info!(session_id = %session.session_id, "Session created");
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    state
        .store
        .fetch_session(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::session_not_found(&session_id))
}

pub async fn update_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Session>> {
    let Json(body) = payload?;
    let Value::Object(update) = body else {
        return Err(ApiError::validation("Session update must be a JSON object."));
    };

    state
        .store
        .update_session(&session_id, session_patch(&update))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::session_not_found(&session_id))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_session(&session_id).await?;
    state.suggestions.memory().forget(&session_id).await;
    info!(session_id = %session_id, "Session deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_histories(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<History>>> {
    Ok(Json(state.store.list_histories(&session_id).await?))
}

pub async fn create_history(
    State(state): State<AppState>,
    payload: Result<Json<NewHistory>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = payload?;
    let history = body.into_history(now())?;
    let history = state.store.create_history(history).await?;
    info!(
        history_id = %history.history_id,
        session_id = %history.session_id,
        "History created"
    );
    Ok((StatusCode::CREATED, Json(history)))
}

pub async fn list_proposals(
    State(state): State<AppState>,
    Path(history_id): Path<String>,
) -> ApiResult<Json<Vec<Proposal>>> {
    Ok(Json(state.store.list_proposals(&history_id).await?))
}

pub async fn create_proposal(
    State(state): State<AppState>,
    payload: Result<Json<NewProposal>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = payload?;
    let proposal = state.store.create_proposal(body.into_proposal()?).await?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

#[derive(Debug, Default, Deserialize)]
pub struct EngineQuery {
    engine: Option<String>,
}

/// `engine` may come from the body or the query string; the body wins.
pub async fn create_suggestions(
    State(state): State<AppState>,
    Query(query): Query<EngineQuery>,
    payload: Result<Json<SuggestionRequest>, JsonRejection>,
) -> ApiResult<Json<SuggestionResponse>> {
    let Json(mut request) = payload?;
    if request.engine.is_none() {
        request.engine = query.engine;
    }
    Ok(Json(state.suggestions.generate(request).await))
}
