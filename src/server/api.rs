use crate::cli::Args;
use crate::pipeline::PipelineOutcome;
use super::ChatContext;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::{ get, post },
    Router,
    extract::{ Path, State },
    response::IntoResponse,
    http::{ HeaderMap, StatusCode },
    Json,
};
use serde::Serialize;
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, error, warn };
use uuid::Uuid;

#[derive(Serialize, Debug, PartialEq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
    pub conversations: usize,
    pub dispatch: String,
}

#[derive(Clone)]
struct AppState {
    ctx: Arc<ChatContext>,
    api_key: Option<String>,
}

pub fn router(ctx: Arc<ChatContext>, api_key: Option<String>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/pipeline/{message_id}/retry", post(retry_handler))
        .layer(cors)
        .with_state(AppState { ctx, api_key })
}

pub async fn start_http_server(
    http_port: u16,
    ctx: Arc<ChatContext>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);
    if args.server_api_key.as_deref().map_or(true, str::is_empty) {
        warn!("SERVER_API_KEY is not set; the retry endpoint is open to anyone who can reach it");
    }

    let app = router(ctx, args.server_api_key.clone().filter(|k| !k.is_empty()));

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig
                ::from_pem_file(cert_path, key_path).await?;

            tokio::spawn(async move {
                let result = axum_server
                    ::bind_rustls(addr, tls_config)
                    .serve(app.into_make_service()).await;
                if let Err(e) = result {
                    error!("HTTPS server error: {}", e);
                }
            });
            info!("HTTPS server started with TLS enabled");
        }
        _ => {
            tokio::spawn(async move {
                match tokio::net::TcpListener::bind(addr).await {
                    Ok(listener) => {
                        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                            error!("HTTP server error: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                    }
                }
            });
            info!("HTTP server started");
        }
    }

    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        sessions: state.ctx.registry.session_count(),
        conversations: state.ctx.registry.conversation_count(),
        dispatch: state.ctx.pipeline.dispatch_mode().to_string(),
    })
}

async fn retry_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<Uuid>
) -> impl IntoResponse {
    if let Some(expected) = &state.api_key {
        let provided = headers.get("X-API-Key").and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            warn!("Rejected retry for {} with missing or wrong API key", message_id);
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" }))).into_response();
        }
    }

    let outcome = state.ctx.pipeline.retry(message_id).await;
    let status = match &outcome {
        PipelineOutcome::Missing { .. } => StatusCode::NOT_FOUND,
        PipelineOutcome::Error { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}
