use crate::api_error::ApiError;
use crate::models::{
    CreateTournamentRequest, ReportResultRequest, ScheduleMatchRequest, SetCurrentTournamentRequest,
    SignUpRequest,
};
use crate::service::{MatchService, SyncService, TournamentService};
use actix_web::{web, HttpResponse, Responder};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

/// Application state shared by the tournament command handlers
pub struct AppState {
    pub tournament_service: Arc<TournamentService>,
    pub match_service: Arc<MatchService>,
    pub sync_service: Arc<SyncService>,
}

// =============================================================================
// TOURNAMENTS
// =============================================================================

/// POST /api/tournaments
/// Create a tournament locally and on the bracket host
pub async fn create_tournament(
    state: web::Data<AppState>,
    req: web::Json<CreateTournamentRequest>,
) -> Result<impl Responder, ApiError> {
    req.validate()?;
    info!(name = %req.name, "Received create tournament request");

    let tournament = state.tournament_service.create_tournament(&req.name).await?;
    Ok(HttpResponse::Created().json(tournament))
}

/// DELETE /api/tournaments/{slug}
pub async fn delete_tournament(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<impl Responder, ApiError> {
    let slug = path.into_inner();
    info!(slug = %slug, "Received delete tournament request");

    state.tournament_service.delete_tournament(&slug).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// PUT /api/tournaments/current
pub async fn set_current(
    state: web::Data<AppState>,
    req: web::Json<SetCurrentTournamentRequest>,
) -> Result<impl Responder, ApiError> {
    req.validate()?;
    let tournament = state.tournament_service.set_current(&req.slug).await?;
    Ok(HttpResponse::Ok().json(tournament))
}

/// GET /api/tournaments/current
/// Current tournament with its participants and matches
pub async fn get_current(state: web::Data<AppState>) -> Result<impl Responder, ApiError> {
    let overview = state.tournament_service.get_current().await?;
    Ok(HttpResponse::Ok().json(overview))
}

/// POST /api/tournaments/current/start
pub async fn start_tournament(state: web::Data<AppState>) -> Result<impl Responder, ApiError> {
    info!("Received start tournament request");
    let report = state.tournament_service.start_tournament().await?;
    Ok(HttpResponse::Ok().json(report))
}

/// POST /api/tournaments/current/end
pub async fn end_tournament(state: web::Data<AppState>) -> Result<impl Responder, ApiError> {
    info!("Received end tournament request");
    let report = state.tournament_service.end_tournament().await?;
    Ok(HttpResponse::Ok().json(report))
}

/// POST /api/tournaments/current/sync
/// Re-read the remote bracket and repair local state
pub async fn sync_tournament(state: web::Data<AppState>) -> Result<impl Responder, ApiError> {
    info!("Received sync request");
    let report = state.sync_service.sync().await?;
    Ok(HttpResponse::Ok().json(report))
}

// =============================================================================
// PARTICIPANTS
// =============================================================================

/// POST /api/tournaments/current/participants
pub async fn sign_up(
    state: web::Data<AppState>,
    req: web::Json<SignUpRequest>,
) -> Result<impl Responder, ApiError> {
    info!(member_id = %req.member_id, "Received sign-up request");
    let participant = state.tournament_service.sign_up(req.member_id).await?;
    Ok(HttpResponse::Created().json(participant))
}

/// DELETE /api/tournaments/current/participants/{member_id}
pub async fn withdraw(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<impl Responder, ApiError> {
    let member_id = path.into_inner();
    info!(member_id = %member_id, "Received withdraw request");

    state.tournament_service.withdraw(member_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /api/tournaments/current/rewards/{member_id}
/// Mark the member's reward as handed out
pub async fn mark_reward_received(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<impl Responder, ApiError> {
    let member_id = path.into_inner();
    let participant = state.tournament_service.mark_reward_received(member_id).await?;
    Ok(HttpResponse::Ok().json(participant))
}

// =============================================================================
// MATCHES
// =============================================================================

/// POST /api/tournaments/current/results
/// Report the reporter's win on their open match
pub async fn report_result(
    state: web::Data<AppState>,
    req: web::Json<ReportResultRequest>,
) -> Result<impl Responder, ApiError> {
    req.validate()?;
    info!(
        winner_member_id = %req.winner_member_id,
        evidence_url = %req.evidence_url,
        "Received match result"
    );

    let outcome = state.match_service.report_result(req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

/// POST /api/tournaments/current/schedule
pub async fn schedule_match(
    state: web::Data<AppState>,
    req: web::Json<ScheduleMatchRequest>,
) -> Result<impl Responder, ApiError> {
    req.validate()?;
    info!(
        member_id = %req.member_id,
        opponent_member_id = %req.opponent_member_id,
        "Received schedule request"
    );

    let scheduled = state.match_service.schedule_match(req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(scheduled))
}

// =============================================================================
// ROUTE CONFIGURATION
// =============================================================================

/// Configure tournament routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/tournaments")
            .route("", web::post().to(create_tournament))
            .route("/current", web::get().to(get_current))
            .route("/current", web::put().to(set_current))
            .route("/current/start", web::post().to(start_tournament))
            .route("/current/end", web::post().to(end_tournament))
            .route("/current/sync", web::post().to(sync_tournament))
            .route("/current/participants", web::post().to(sign_up))
            .route("/current/participants/{member_id}", web::delete().to(withdraw))
            .route("/current/results", web::post().to(report_result))
            .route("/current/schedule", web::post().to(schedule_match))
            .route("/current/rewards/{member_id}", web::post().to(mark_reward_received))
            .route("/{slug}", web::delete().to(delete_tournament)),
    );
}
