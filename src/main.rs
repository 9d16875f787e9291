use crate::app_state::AppState;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use clap::Parser;
use codec::ImageCodec;
use config::{Args, Settings};
use error::ConversionError;
use fetch::HttpFetcher;
use pipeline::{ConversionPipeline, ConversionResult};
use request_context::RequestContext;
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod admission;
mod app_state;
mod cache;
mod clock;
mod codec;
mod config;
mod error;
mod fetch;
mod pipeline;
mod rate_limit;
mod request_context;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_args(&Args::parse())?;
    if let Err(e) = codec::ensure_avif_decoding() {
        error!(error = %e, "refusing to start");
        return Err(e.into());
    }
    let fetcher = HttpFetcher::new(settings.fetch_timeout)?;
    let pipeline = ConversionPipeline::new(
        &settings,
        Arc::new(fetcher),
        Arc::new(ImageCodec::default()),
        Arc::new(clock::SystemClock),
    );
    let app = app(AppState::new(pipeline));

    info!(addr = %settings.addr, "AVIF to WebP proxy starting");
    axum::Server::bind(&settings.addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");

    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/convert", get(convert))
        .route("/local/:file", get(local))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn client_id(connect_info: Option<ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[axum_macros::debug_handler]
async fn convert(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let ctx = RequestContext::new(client_id(connect_info), params);
    let result = state.pipeline.convert(&ctx).await;
    respond(&state, result)
}

#[axum_macros::debug_handler]
async fn local(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(file): Path<String>,
) -> Response {
    let Some(name) = file.strip_suffix(".webp") else {
        return ConversionError::NotFound("Image not found".into()).into_response();
    };
    let result = state.pipeline.convert_local(&client_id(connect_info), name).await;
    respond(&state, result)
}

fn respond(state: &AppState, result: ConversionResult) -> Response {
    match result {
        ConversionResult::Payload(bytes) => {
            let mime_type = mime_guess::from_ext("webp").first_or_octet_stream();
            (
                [
                    (header::CONTENT_TYPE, mime_type.to_string()),
                    (
                        header::CACHE_CONTROL,
                        format!("max-age={}", state.pipeline.cache_ttl().as_secs()),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        ConversionResult::Rejected(reason) => ConversionError::Rejected(reason).into_response(),
        ConversionResult::Error(e) => e.into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
