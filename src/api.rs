//! REST API for the valuation and matching engine
//!
//! Exposes the orchestrator over HTTP. Every response uses the
//! `ApiResponse` envelope; engine errors map onto HTTP statuses.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MatchWeights;
use crate::embedding::DegradePolicy;
use crate::error::EngineError;
use crate::fingerprint::stable_uuid_from_string;
use crate::matching::DisclosureEvent;
use crate::models::{Comparable, EntityProfile, Party, PoolSelector, PrecedentTransaction};
use crate::orchestrator::{FinancialInput, Orchestrator, PeerSet, ValuationRequest};
use crate::Result;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ValuationBody {
    pub tenant_id: Option<String>,
    pub input: FinancialInput,
    #[serde(default)]
    pub comparables: PeerSet<Comparable>,
    #[serde(default)]
    pub precedents: PeerSet<PrecedentTransaction>,
    pub wacc_override: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingBody {
    pub tenant_id: Option<String>,
    pub entity_id: Uuid,
    pub profile: Option<EntityProfile>,
    #[serde(default)]
    pub degrade_policy: DegradePolicy,
}

#[derive(Debug, Deserialize)]
pub struct MatchBody {
    pub tenant_id: Option<String>,
    pub entity_id: Uuid,
    #[serde(default)]
    pub pool: PoolSelector,
    pub top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DisclosureBody {
    pub tenant_id: Option<String>,
    pub party: Party,
}

#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

pub fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Normalization(_) | EngineError::ValuationExhausted { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::EmbeddingProvider(_)
        | EngineError::EmbeddingRejected { .. }
        | EngineError::HttpError(_) => StatusCode::BAD_GATEWAY,
        EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidInput(_)
        | EngineError::UuidError(_)
        | EngineError::SerializationError(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T: Serialize>(operation: &str, result: Result<T>) -> Reply {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => {
            let status = status_for(&e);
            warn!(operation, status = status.as_u16(), error = %e, "Request failed");
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Tenant ids are UUIDs; any other non-empty string maps to a stable UUID.
pub fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

fn tenant_of(value: Option<&str>) -> Uuid {
    parse_or_stable_uuid(value, "default-tenant")
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "store": state.orchestrator.store().backend(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Valuation Endpoints
/// =============================

async fn run_valuation(
    State(state): State<ApiState>,
    Json(body): Json<ValuationBody>,
) -> Reply {
    let tenant = tenant_of(body.tenant_id.as_deref());
    let request = ValuationRequest {
        input: body.input,
        comparables: body.comparables,
        precedents: body.precedents,
        wacc_override: body.wacc_override,
    };

    reply("valuation", state.orchestrator.run_valuation(tenant, request).await)
}

async fn valuation_history(
    State(state): State<ApiState>,
    Path(entity_id): Path<Uuid>,
    Query(query): Query<TenantQuery>,
) -> Reply {
    let tenant = tenant_of(query.tenant_id.as_deref());
    reply(
        "valuation_history",
        state.orchestrator.valuation_history(tenant, entity_id).await,
    )
}

/// =============================
/// Embedding & Matching Endpoints
/// =============================

async fn generate_embedding(
    State(state): State<ApiState>,
    Json(body): Json<EmbeddingBody>,
) -> Reply {
    let tenant = tenant_of(body.tenant_id.as_deref());
    reply(
        "embedding",
        state
            .orchestrator
            .generate_embedding(tenant, body.entity_id, body.profile, body.degrade_policy)
            .await,
    )
}

async fn run_match(State(state): State<ApiState>, Json(body): Json<MatchBody>) -> Reply {
    let tenant = tenant_of(body.tenant_id.as_deref());
    reply(
        "match",
        state
            .orchestrator
            .run_match(tenant, body.entity_id, body.pool, body.top_k)
            .await,
    )
}

async fn disclose(state: ApiState, match_id: Uuid, tenant_id: Option<String>, event: DisclosureEvent) -> Reply {
    let tenant = tenant_of(tenant_id.as_deref());
    info!(match_id = %match_id, ?event, "Disclosure event received");
    reply(
        "disclosure",
        state.orchestrator.apply_disclosure(tenant, match_id, event).await,
    )
}

async fn express_interest(
    State(state): State<ApiState>,
    Path(match_id): Path<Uuid>,
    Json(body): Json<DisclosureBody>,
) -> Reply {
    let event = DisclosureEvent::InterestExpressed { party: body.party };
    disclose(state, match_id, body.tenant_id, event).await
}

async fn accept_nda(
    State(state): State<ApiState>,
    Path(match_id): Path<Uuid>,
    Json(body): Json<DisclosureBody>,
) -> Reply {
    let event = DisclosureEvent::NdaAccepted { party: body.party };
    disclose(state, match_id, body.tenant_id, event).await
}

async fn withdraw(
    State(state): State<ApiState>,
    Path(match_id): Path<Uuid>,
    Json(body): Json<DisclosureBody>,
) -> Reply {
    let event = DisclosureEvent::Withdrawn { party: body.party };
    disclose(state, match_id, body.tenant_id, event).await
}

/// =============================
/// Tenant & Entity Endpoints
/// =============================

async fn set_match_weights(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
    Json(weights): Json<MatchWeights>,
) -> Reply {
    let tenant = tenant_of(Some(&tenant_id));
    reply(
        "match_weights",
        state.orchestrator.set_match_weights(tenant, weights).await,
    )
}

async fn delete_entity(
    State(state): State<ApiState>,
    Path(entity_id): Path<Uuid>,
    Query(query): Query<TenantQuery>,
) -> Reply {
    let tenant = tenant_of(query.tenant_id.as_deref());
    reply(
        "delete_entity",
        state.orchestrator.delete_entity(tenant, entity_id).await,
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/valuation", post(run_valuation))
        .route("/api/valuation/:entity_id/history", get(valuation_history))
        .route("/api/embedding", post(generate_embedding))
        .route("/api/match", post(run_match))
        .route("/api/matches/:match_id/interest", post(express_interest))
        .route("/api/matches/:match_id/nda", post(accept_nda))
        .route("/api/matches/:match_id/withdraw", post(withdraw))
        .route("/api/tenants/:tenant_id/match-weights", put(set_match_weights))
        .route("/api/entities/:entity_id", delete(delete_entity))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
