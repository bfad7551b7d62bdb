use actix_web::{web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use tokio::signal;

use tournament_engine::config::Config;
use tournament_engine::db::{create_pool, run_migrations};
use tournament_engine::http::tournament_handler::{self, AppState};
use tournament_engine::middleware::cors_middleware;
use tournament_engine::repository::{PgTournamentRepository, TournamentRepository};
use tournament_engine::service::{
    BracketProvider, ChallongeService, Dispatcher, MatchService, RoundProgressionService, SyncService,
    TournamentLocks, TournamentService, TracingDispatcher, WebhookDispatcher,
};
use tournament_engine::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize telemetry
    init_telemetry(&config.server.rust_log);

    // Create database pool
    let db_pool = create_pool(&config)
        .await
        .context("Failed to create database pool")?;
    run_migrations(&db_pool)
        .await
        .context("Failed to run database migrations")?;

    let repository: Arc<dyn TournamentRepository> = Arc::new(PgTournamentRepository::new(db_pool.clone()));
    let provider: Arc<dyn BracketProvider> = Arc::new(
        ChallongeService::new(config.challonge.clone()).context("Failed to build bracket provider client")?,
    );
    let dispatcher: Arc<dyn Dispatcher> = match &config.dispatch.webhook_url {
        Some(url) => {
            tracing::info!(webhook = %url, "Dispatching side effects to chat webhook");
            Arc::new(
                WebhookDispatcher::new(url.clone(), config.challonge.timeout)
                    .context("Failed to build webhook dispatcher")?,
            )
        }
        None => {
            tracing::warn!("DISPATCH_WEBHOOK_URL not set; side effects will only be logged");
            Arc::new(TracingDispatcher::new())
        }
    };

    let locks = Arc::new(TournamentLocks::new());
    let engine = Arc::new(RoundProgressionService::new(
        repository.clone(),
        provider.clone(),
        dispatcher,
        config.dispatch.category_prefix.clone(),
    ));
    let state = web::Data::new(AppState {
        tournament_service: Arc::new(TournamentService::new(
            repository.clone(),
            provider.clone(),
            engine.clone(),
            locks.clone(),
        )),
        match_service: Arc::new(MatchService::new(
            repository.clone(),
            provider.clone(),
            engine.clone(),
            locks.clone(),
        )),
        sync_service: Arc::new(SyncService::new(repository, provider, engine, locks)),
    });

    tracing::info!("Starting tournament engine on {}:{}", config.server.host, config.server.port);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(db_pool.clone()))
            .app_data(state.clone())
            .wrap(cors_middleware())
            .wrap(actix_web::middleware::Logger::default())
            .route(
                "/api/health",
                web::get().to(tournament_engine::http::health::health_check),
            )
            .configure(tournament_handler::configure_routes)
    })
    .bind((config.server.host.clone(), config.server.port))?
    .run();

    // Graceful shutdown
    let server_handle = server.handle();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received, stopping server...");
        server_handle.stop(true).await;
    });

    server.await?;
    Ok(())
}
