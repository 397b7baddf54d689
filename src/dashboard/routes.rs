//! REST handlers.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::channels::InboundEmail;
use crate::classifier::{Classification, Intent};
use crate::leads::LeadFilter;
use crate::leads::model::HumanRequestKind;
use crate::pipeline::{AgentUpdate, MeetingRequest, OutreachChannel, Pipeline, Stage};

type ApiResult<T> = Result<T, ApiError>;

// ── Health / status ─────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lead-pilot"
    }))
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.status().await)
}

pub async fn activity(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.notifier().recent_activity().await)
}

// ── Discovery ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DiscoveryBody {
    pub city: String,
    #[serde(default)]
    pub business_type: Option<String>,
}

pub async fn start_discovery(
    State(state): State<AppState>,
    Json(body): Json<DiscoveryBody>,
) -> ApiResult<impl IntoResponse> {
    state
        .pipeline
        .start_discovery(&body.city, body.business_type)?;
    info!(city = %body.city.trim(), "Discovery accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "started", "city": body.city.trim() })),
    ))
}

// ── Leads ───────────────────────────────────────────────────────────────

pub async fn list_leads(
    State(state): State<AppState>,
    Query(filter): Query<LeadFilter>,
) -> impl IntoResponse {
    Json(state.pipeline.leads().list(&filter).await)
}

pub async fn get_lead(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pipeline.get_lead(id).await?))
}

pub async fn research(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    spawn_stage(&state.pipeline, id, Stage::Research, |p| async move {
        p.research(id).await.map(|_| ())
    })
    .await
}

pub async fn proposal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    spawn_stage(&state.pipeline, id, Stage::Proposal, |p| async move {
        p.proposal(id).await.map(|_| ())
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct OutreachBody {
    pub channel: OutreachChannel,
    #[serde(default)]
    pub email: Option<String>,
}

pub async fn outreach(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<OutreachBody>,
) -> ApiResult<impl IntoResponse> {
    let OutreachBody { channel, email } = body;
    spawn_stage(&state.pipeline, id, channel.stage(), move |p| async move {
        p.outreach(id, channel, email).await.map(|_| ())
    })
    .await
}

/// Check the lead exists, then run the stage in the background. Outcomes
/// reach the dashboard as events.
async fn spawn_stage<F, Fut>(
    pipeline: &Arc<Pipeline>,
    id: Uuid,
    stage: Stage,
    run: F,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)>
where
    F: FnOnce(Arc<Pipeline>) -> Fut,
    Fut: Future<Output = Result<(), crate::error::PipelineError>> + Send + 'static,
{
    pipeline.get_lead(id).await?;
    let task = run(Arc::clone(pipeline));
    tokio::spawn(async move {
        // Already recorded and published by the runner.
        if let Err(e) = task.await {
            warn!(lead_id = %id, stage = %stage, error = %e, "Background stage failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "started", "lead_id": id, "stage": stage })),
    ))
}

pub async fn mark_converting(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pipeline.mark_converting(id).await?))
}

pub async fn confirm(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pipeline.confirm(id).await?))
}

pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pipeline.reject(id).await?))
}

pub async fn mark_no_response(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pipeline.mark_no_response(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct NoteBody {
    pub text: String,
}

pub async fn add_note(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<NoteBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pipeline.add_note(id, &body.text).await?))
}

#[derive(Debug, Deserialize)]
pub struct ClassificationBody {
    pub intent: Intent,
    #[serde(default = "default_manual_confidence")]
    pub confidence: f32,
}

fn default_manual_confidence() -> f32 {
    1.0
}

pub async fn submit_classification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ClassificationBody>,
) -> ApiResult<impl IntoResponse> {
    let classification = Classification::manual(body.intent, body.confidence.clamp(0.0, 1.0));
    Ok(Json(
        state
            .pipeline
            .submit_classification(id, classification)
            .await?,
    ))
}

pub async fn schedule_meeting(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<MeetingRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pipeline.schedule_meeting(id, request).await?))
}

// ── Webhooks ────────────────────────────────────────────────────────────

pub async fn inbound_email(
    State(state): State<AppState>,
    Json(email): Json<InboundEmail>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pipeline.handle_inbound_email(email).await?))
}

pub async fn agent_callback(
    State(state): State<AppState>,
    Json(update): Json<AgentUpdate>,
) -> ApiResult<impl IntoResponse> {
    info!(agent = %update.agent_type, lead_id = %update.lead_id, "Agent callback");
    let lead = state.pipeline.apply_agent_update(update).await?;
    Ok(Json(serde_json::json!({ "status": "success", "lead": lead })))
}

// ── Human input ─────────────────────────────────────────────────────────

pub async fn list_human_input(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.gate().list_pending().await)
}

#[derive(Debug, Deserialize)]
pub struct HumanInputBody {
    pub lead_id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub kind: HumanRequestKind,
}

pub async fn request_human_input(
    State(state): State<AppState>,
    Json(body): Json<HumanInputBody>,
) -> ApiResult<impl IntoResponse> {
    let request = state
        .pipeline
        .request_human_input(body.lead_id, body.kind, &body.prompt)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

#[derive(Debug, Deserialize)]
pub struct HumanResponseBody {
    pub response: String,
}

pub async fn resolve_human_input(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(body): Json<HumanResponseBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .pipeline
            .resolve_human_input(&request_id, &body.response)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn cancel_human_input(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .pipeline
            .cancel_human_input(&request_id, query.reason.as_deref())
            .await?,
    ))
}

// ── Reset ───────────────────────────────────────────────────────────────

pub async fn reset(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let cleared = state.pipeline.reset().await?;
    Ok(Json(serde_json::json!({ "status": "reset", "cleared_leads": cleared })))
}
