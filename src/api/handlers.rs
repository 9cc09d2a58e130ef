//! REST API handlers for router registration.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator::{AllocationRequest, Allocator, AllocatorError, ConfirmedAllocation};
use crate::config::Config;
use crate::notify::{TokenDelivery, TokenNotifier};
use crate::validation::{
    check_deliverability, validate_captcha, validate_constituency, validate_email,
    validate_expert_ipv4_size, validate_hostname, validate_simple_ipv4_size, ValidationError,
};

use super::admin;
use super::error::ApiError;

/// Application state shared across handlers.
pub struct AppState {
    pub config: Config,
    pub allocator: Arc<Allocator>,
    pub notifier: Arc<dyn TokenNotifier>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct CaptchaResponse {
    pub question: String,
}

/// One address or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EmailField {
    One(String),
    Many(Vec<String>),
}

impl EmailField {
    fn into_vec(self) -> Vec<String> {
        match self {
            EmailField::One(e) => vec![e],
            EmailField::Many(v) => v,
        }
    }
}

/// Body of a prefix request.
#[derive(Debug, Deserialize)]
pub struct PrefixRequest {
    pub host: String,
    pub email: EmailField,
    pub size4: u8,
    #[serde(default)]
    pub constituency: u8,
    pub captcha: String,
}

/// Answer to an accepted prefix request. Carries no token.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResponse {
    pub session: Uuid,
    pub host: String,
    pub email: Vec<String>,
    pub constituency: u8,
    pub constituency_name: Option<&'static str>,
    pub state: String,
    pub expires_at: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub session: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub session: Uuid,
    pub host: String,
    pub mesh4: Vec<String>,
    pub prefix4: Option<String>,
    pub prefix6: Option<String>,
}

impl From<ConfirmedAllocation> for ConfirmResponse {
    fn from(a: ConfirmedAllocation) -> Self {
        Self {
            session: a.session,
            host: a.host,
            mesh4: a.mesh4.iter().map(|m| m.to_string()).collect(),
            prefix4: a.prefix4.map(|p| p.to_string()),
            prefix6: a.prefix6.map(|p| p.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RequestMode {
    Simple,
    Expert,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/captcha", get(captcha))
        .route("/api/v1/simplePrefix", post(simple_prefix))
        .route("/api/v1/expertPrefix", post(expert_prefix))
        .route("/api/v1/confirm", get(confirm_query).post(confirm_body))
        .merge(admin::router(state.clone()))
        .with_state(state)
}

/// Health check endpoint (no auth required).
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn captcha(State(state): State<Arc<AppState>>) -> Json<CaptchaResponse> {
    Json(CaptchaResponse {
        question: state.config.validation.captcha_question.clone(),
    })
}

async fn simple_prefix(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PrefixRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PendingResponse>), ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::Rejected(e.status(), e.body_text()))?;
    request_prefix(&state, req, RequestMode::Simple).await
}

async fn expert_prefix(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PrefixRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PendingResponse>), ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::Rejected(e.status(), e.body_text()))?;
    request_prefix(&state, req, RequestMode::Expert).await
}

async fn request_prefix(
    state: &AppState,
    req: PrefixRequest,
    mode: RequestMode,
) -> Result<(StatusCode, Json<PendingResponse>), ApiError> {
    let request = validate_request(state, req, mode).await?;

    let (reservation, token) = state.allocator.request_allocation(request).await?;

    let delivery = TokenDelivery::new(
        &state.config.notify.confirm_url_base,
        reservation.session,
        &reservation.host,
        &reservation.emails,
        token.expose(),
        reservation.expires_at,
    );
    if let Err(e) = state.notifier.deliver(&delivery).await {
        // The reservation lapses on its own if nobody confirms it.
        warn!(session = %reservation.session, error = %e, "Failed to deliver confirmation token");
    }

    info!(session = %reservation.session, host = %reservation.host, mode = ?mode, "Prefix request accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(PendingResponse {
            session: reservation.session,
            host: reservation.host.clone(),
            email: reservation.emails.clone(),
            constituency: reservation.constituency.code(),
            constituency_name: reservation.constituency.name(),
            state: reservation.state.to_string(),
            expires_at: reservation.expires_at.to_rfc3339(),
        }),
    ))
}

/// Run every check before anything touches the pools.
async fn validate_request(
    state: &AppState,
    req: PrefixRequest,
    mode: RequestMode,
) -> Result<AllocationRequest, ValidationError> {
    let settings = &state.config.validation;

    let host = req.host.trim().to_string();
    validate_hostname(&host)?;

    let mut emails: Vec<String> = Vec::new();
    for email in req.email.into_vec() {
        let email = email.trim().to_string();
        if !emails.iter().any(|e| e.eq_ignore_ascii_case(&email)) {
            emails.push(email);
        }
    }
    if emails.is_empty() {
        return Err(ValidationError::FormatInvalid {
            field: "email",
            reason: "at least one address is required".to_string(),
        });
    }
    if emails.len() > settings.max_emails {
        return Err(ValidationError::OutOfRange {
            field: "email",
            value: emails.len() as i64,
            reason: format!("at most {} addresses are accepted", settings.max_emails),
        });
    }
    for email in &emails {
        validate_email(email)?;
    }

    validate_captcha(req.captcha.trim(), &settings.captcha_answer)?;
    let constituency = validate_constituency(req.constituency)?;
    let ipv4_size = match mode {
        RequestMode::Simple => Some(validate_simple_ipv4_size(req.size4)?),
        RequestMode::Expert => validate_expert_ipv4_size(req.size4)?,
    };

    if settings.check_email_deliverability {
        for email in &emails {
            check_deliverability(email).await?;
        }
    }

    Ok(AllocationRequest {
        host,
        emails,
        constituency,
        ipv4_size,
    })
}

async fn confirm_query(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ConfirmRequest>, QueryRejection>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let Query(req) = params.map_err(|e| ApiError::Rejected(e.status(), e.body_text()))?;
    confirm(&state, req).await
}

async fn confirm_body(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConfirmRequest>, JsonRejection>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::Rejected(e.status(), e.body_text()))?;
    confirm(&state, req).await
}

async fn confirm(state: &AppState, req: ConfirmRequest) -> Result<Json<ConfirmResponse>, ApiError> {
    // A malformed session id cannot name a reservation.
    let session: Uuid = req
        .session
        .trim()
        .parse()
        .map_err(|_| AllocatorError::NotFound)?;

    let confirmed = state
        .allocator
        .confirm_allocation(session, req.token.trim())
        .await?;

    Ok(Json(confirmed.into()))
}
