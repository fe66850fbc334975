use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

mod config;
mod containment;
mod error;
mod middleware;
mod routes;
mod state;
mod upstream;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Pitlane Agent Proxy",
        version = "0.1.0",
        description = "Forwards chat turns to the hosted inference service and always answers with a normalized JSON envelope."
    ),
    paths(
        routes::health::health_check,
        routes::agent::agent_post,
        routes::agent::agent_health,
    ),
    components(schemas(
        HealthResponse,
        routes::agent::AgentRequestBody,
        routes::agent::AgentHealthResponse,
        pitlane_core::envelope::ResponseEnvelope,
        pitlane_core::envelope::NormalizedEnvelope,
        pitlane_core::envelope::EnvelopeStatus,
    ))
)]
struct ApiDoc;

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pitlane_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = config::AppConfig::from_env();
    if !config.api_key_configured() {
        tracing::warn!(
            "{} is not configured; agent requests will fail until it is set",
            pitlane_core::error::API_KEY_ENV
        );
    }

    let transport =
        upstream::LyzrTransport::new(&config).expect("Failed to build upstream HTTP client");

    let port = config.port;
    tracing::info!(
        upstream_url = %config.upstream_url,
        upstream_timeout_secs = config.upstream_timeout.as_secs(),
        environment = %config.environment,
        "Configuration loaded"
    );

    let cors_layer = middleware::cors::build_cors_layer(&config.cors_origins);
    let app_state = state::AppState::new(config, Arc::new(transport));

    let app = Router::new()
        .route("/api-doc/openapi.json", get(openapi_json))
        .merge(routes::health::router())
        .merge(routes::agent::router(Some(middleware::rate_limit::agent_layer())))
        .layer(axum::middleware::from_fn(middleware::security_headers::apply))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Pitlane agent proxy listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}
