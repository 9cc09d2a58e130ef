//! Operator endpoints, behind bearer token authentication.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::allocator::{AllocatorError, BrokerStatus};
use crate::db::{PoolUnit, Reservation, ReservationFilter, ReservationState, UnitKind};

use super::error::ApiError;
use super::handlers::AppState;

/// Reservation as shown to operators.
#[derive(Debug, Serialize)]
pub struct ReservationInfo {
    pub session: Uuid,
    pub host: String,
    pub emails: Vec<String>,
    pub constituency: u8,
    pub state: String,
    pub created_at: String,
    pub expires_at: String,
    pub confirmed_at: Option<String>,
    pub prefix4: Option<String>,
    pub prefix6: Option<String>,
    pub mesh4: Vec<String>,
}

impl From<Reservation> for ReservationInfo {
    fn from(r: Reservation) -> Self {
        Self {
            session: r.session,
            prefix4: r.prefix4().map(|p| p.to_string()),
            prefix6: r.prefix6().map(|p| p.to_string()),
            mesh4: r.mesh4().iter().map(|m| m.to_string()).collect(),
            host: r.host,
            emails: r.emails,
            constituency: r.constituency.code(),
            state: r.state.to_string(),
            created_at: r.created_at.to_rfc3339(),
            expires_at: r.expires_at.to_rfc3339(),
            confirmed_at: r.confirmed_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub email: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PoolParams {
    pub kind: Option<String>,
}

pub(super) fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/status", get(status))
        .route("/v1/reservations", get(list_reservations))
        .route(
            "/v1/reservations/{session}",
            get(get_reservation).delete(delete_reservation),
        )
        .route("/v1/pool", get(list_pool))
        .route_layer(middleware::from_fn_with_state(state, require_operator))
}

/// Extract the bearer token from the `Authorization` header.
fn extract_bearer_token(request: &Request<Body>) -> Result<&str, ApiError> {
    let header = request
        .headers()
        .get("authorization")
        .ok_or_else(|| ApiError::Unauthorized("authorization header is missing".to_string()))?;
    let value = header.to_str().map_err(|_| {
        ApiError::Unauthorized("authorization header is not valid UTF-8".to_string())
    })?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| ApiError::Unauthorized("authorization header is not a bearer token".to_string()))
}

async fn require_operator(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(&request)?.to_string();
    let operator = state
        .allocator
        .database()
        .validate_operator_token(&token)
        .await?;

    match operator {
        Some(t) => {
            debug!(token_id = t.id, path = %request.uri().path(), "Operator request");
            Ok(next.run(request).await)
        }
        None => Err(ApiError::Unauthorized("invalid operator token".to_string())),
    }
}

fn parse_session(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Allocator(AllocatorError::NotFound))
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<BrokerStatus>, ApiError> {
    Ok(Json(state.allocator.status().await?))
}

async fn list_reservations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ReservationInfo>>, ApiError> {
    let state_filter = params
        .state
        .as_deref()
        .map(str::parse::<ReservationState>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let reservations = state
        .allocator
        .list_reservations(&ReservationFilter {
            state: state_filter,
            email: params.email,
        })
        .await?;

    Ok(Json(reservations.into_iter().map(Into::into).collect()))
}

async fn get_reservation(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
) -> Result<Json<ReservationInfo>, ApiError> {
    let session = parse_session(&session)?;
    Ok(Json(state.allocator.lookup(session).await?.into()))
}

async fn delete_reservation(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = parse_session(&session)?;
    let removed = state.allocator.delete_reservation(session).await?;
    info!(session = %session, host = %removed.host, "Deleted reservation via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_pool(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PoolParams>,
) -> Result<Json<Vec<PoolUnit>>, ApiError> {
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<UnitKind>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    Ok(Json(state.allocator.pool_units(kind).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use serde_json::json;

    use super::super::handlers::tests::{send, test_app};
    use super::*;

    fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_requires_operator_token() {
        let app = test_app().await;

        let request = Request::builder().uri("/v1/status").body(Body::empty()).unwrap();
        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let (status, _) = send(&app.router, authed("GET", "/v1/status", "bogus")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (token, record) = app.db.create_operator_token(Some("test")).await.unwrap();
        let (status, body) = send(&app.router, authed("GET", "/v1/status", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending"], 0);

        app.db.revoke_operator_token(record.id).await.unwrap();
        let (status, _) = send(&app.router, authed("GET", "/v1/status", &token)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_show_delete() {
        let app = test_app().await;
        let (token, _) = app.db.create_operator_token(None).await.unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/simplePrefix")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "host": "mynode",
                    "email": ["Owner@Example.org"],
                    "size4": 27,
                    "constituency": 0,
                    "captcha": "Berlin"
                })
                .to_string(),
            ))
            .unwrap();
        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let session = body["session"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app.router,
            authed("GET", "/v1/reservations?email=owner@example.org&state=pending", &token),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["session"], session.as_str());

        let (status, _) = send(&app.router, authed("GET", "/v1/reservations?state=bogus", &token)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/v1/reservations/{}", session);
        let (status, body) = send(&app.router, authed("GET", &uri, &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["host"], "mynode");
        assert_eq!(body["prefix4"], "10.0.0.0/27");
        assert_eq!(body["emails"], json!(["Owner@Example.org"]));
        assert_eq!(body["mesh4"].as_array().unwrap().len(), 2);

        let (status, body) = send(&app.router, authed("GET", "/v1/pool?kind=mesh4", &token)).await;
        assert_eq!(status, StatusCode::OK);
        let reserved = body
            .as_array()
            .unwrap()
            .iter()
            .filter(|u| u["state"] == "reserved")
            .count();
        assert_eq!(reserved, 2);

        let (status, _) = send(&app.router, authed("DELETE", &uri, &token)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app.router, authed("GET", &uri, &token)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app.router, authed("GET", "/v1/pool", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().iter().all(|u| u["state"] == "free"));
    }
}
