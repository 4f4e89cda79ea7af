mod api;
mod config;
mod coordinator;
mod error;
mod generation;
mod memory;
mod models;
mod normalizer;
mod schema_mapper;
mod store;
mod suggestions;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use config::Config;
use coordinator::BackendCoordinator;
use memory::ConversationMemory;
use suggestions::SuggestionService;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<BackendCoordinator>,
    pub suggestions: Arc<SuggestionService>,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(allowed))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route(
            "/sessions",
            get(api::list_sessions).post(api::create_session),
        )
        .route(
            "/sessions/{session_id}",
            get(api::get_session)
                .put(api::update_session)
                .delete(api::delete_session),
        )
        .route("/sessions/{session_id}/histories", get(api::list_histories))
        .route("/histories", post(api::create_history))
        .route("/histories/{history_id}/proposals", get(api::list_proposals))
        .route("/proposals", post(api::create_proposal))
        .route("/suggestions", post(api::create_suggestions))
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "correction_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let store = BackendCoordinator::from_config(&config).await?;
    info!(
        primary = %store.primary_backend(),
        fallback = ?store.secondary_backend(),
        "Record store ready"
    );

    let generator = suggestions::generator_from_config(&config)?;
    let memory = ConversationMemory::new(config.memory_turns, config.memory_capacity);
    let suggestions = suggestions::engines_from_config(&config)?.into_iter().fold(
        SuggestionService::new(generator, Arc::new(memory), config.suggestion_count),
        SuggestionService::with_engine,
    );

    let state = AppState {
        config: config.clone(),
        store: Arc::new(store),
        suggestions: Arc::new(suggestions),
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("correction-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
