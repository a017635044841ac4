//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::deploy::fsm::WebsiteStatus;
use crate::errors::ProvisionError;
use crate::models::website::{ConnectionDescriptor, NewWebsite};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps orchestrator errors onto HTTP statuses
pub struct ApiError(pub ProvisionError);

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ProvisionError::NotFound(_) => StatusCode::NOT_FOUND,
            ProvisionError::AlreadyRunning(_) | ProvisionError::AlreadyExists(_) => StatusCode::CONFLICT,
            ProvisionError::InvalidDescriptor(_)
            | ProvisionError::InvalidWebsite(_)
            | ProvisionError::JsonError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProvisionError::Ownership(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub active_runs: usize,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "pressbuild".to_string(),
        version: version.version,
        active_runs: state.orchestrator.active_runs(),
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Registered website
#[derive(Debug, Serialize, Deserialize)]
pub struct WebsiteCreated {
    pub id: String,
    pub domain: String,
    pub status: WebsiteStatus,
}

/// Register a website
pub async fn register_handler(
    State(state): State<Arc<ServerState>>,
    Json(new): Json<NewWebsite>,
) -> Result<impl IntoResponse, ApiError> {
    let website = state.orchestrator.register(new).await?;
    Ok((
        StatusCode::CREATED,
        Json(WebsiteCreated {
            id: website.id,
            domain: website.domain,
            status: website.status,
        }),
    ))
}

/// Provision request; the stored connection is used when omitted
#[derive(Debug, Default, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub connection: Option<ConnectionDescriptor>,
}

/// Accepted provisioning run
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionAccepted {
    pub website_id: String,
    pub run_id: String,
    pub status: WebsiteStatus,
}

/// Start provisioning a website
pub async fn provision_handler(
    State(state): State<Arc<ServerState>>,
    Path(website_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: ProvisionRequest = if body.is_empty() {
        ProvisionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(ProvisionError::from)?
    };

    let descriptor = match request.connection {
        Some(descriptor) => descriptor,
        None => state.orchestrator.stored_descriptor(&website_id).await?,
    };

    let handle = state.orchestrator.start(&website_id, descriptor).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ProvisionAccepted {
            website_id: handle.website_id().to_string(),
            run_id: handle.run_id().to_string(),
            status: handle.initial_status().status.clone(),
        }),
    ))
}

/// Cancellation result
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Cancel a website's active run
pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(website_id): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.orchestrator.cancel(&website_id);
    let status = if cancelled {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(CancelResponse { cancelled }))
}

/// Website status handler
pub async fn status_handler(
    State(state): State<Arc<ServerState>>,
    Path(website_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.get(&website_id).await?))
}
