use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    list_conversations, list_messages, list_users, trigger_sync, ApiContext, SchedulerSyncTrigger,
};
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationsResponse, MessagesResponse, SyncAccepted, SyncRequest, UsersResponse,
    },
};
use storage::Storage;
use sync_core::{
    ConnectionRegistry, HttpBridgeConnector, MissingRemoteConnector, RemoteConnector, Scheduler,
    SyncEngine, SystemClock,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url, Settings};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: Option<u32>,
    offset: Option<u32>,
}

type HttpError = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let registry = Arc::new(ConnectionRegistry::single(remote_connector(&settings)?));
    let engine = SyncEngine::new(storage.clone(), Arc::new(SystemClock))
        .with_history_delay(settings.history_delay());
    let scheduler = Arc::new(
        Scheduler::new(engine, Arc::clone(&registry)).with_interval(settings.sync_interval()),
    );

    let shutdown = CancellationToken::new();
    let sync_task = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    let api = ApiContext::new(storage, Arc::new(SchedulerSyncTrigger::new(scheduler)));
    let app = build_router(Arc::new(AppState { api })).layer(cors_layer(&settings.cors_origin)?);

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.server_bind))?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(err) = sync_task.await {
        warn!(error = %err, "sync task ended abnormally");
    }
    registry.shutdown().await;
    info!("server stopped");
    Ok(())
}

fn remote_connector(settings: &Settings) -> anyhow::Result<Arc<dyn RemoteConnector>> {
    match settings.bridge_url.as_deref() {
        Some(url) => {
            info!(bridge_url = %url, "using http bridge for remote sessions");
            Ok(Arc::new(HttpBridgeConnector::new(url)?))
        }
        None => {
            warn!("no bridge url configured; accounts will be skipped until one is set");
            Ok(Arc::new(MissingRemoteConnector))
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    let origin = HeaderValue::from_str(origin)
        .with_context(|| format!("invalid cors origin '{origin}'"))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]))
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/users", get(http_list_users))
        .route(
            "/api/v1/users/:user_id/conversations",
            get(http_list_conversations),
        )
        .route(
            "/api/v1/conversations/:conversation_id/messages",
            get(http_list_messages),
        )
        .route("/api/v1/sync", post(http_trigger_sync))
        .with_state(state)
}

fn http_error(err: ApiError) -> HttpError {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Unavailable, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_list_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<UsersResponse>, HttpError> {
    let users = list_users(&state.api).await.map_err(http_error)?;
    Ok(Json(UsersResponse { users }))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<ConversationsResponse>, HttpError> {
    let conversations = list_conversations(&state.api, UserId(user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(ConversationsResponse { conversations }))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<MessagesResponse>, HttpError> {
    let messages = list_messages(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        q.limit,
        q.offset,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(MessagesResponse { messages }))
}

async fn http_trigger_sync(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> Result<(StatusCode, Json<SyncAccepted>), HttpError> {
    let accepted = trigger_sync(&state.api, req.user_id)
        .await
        .map_err(http_error)?;
    info!(user_id = %req.user_id, "on-demand sync accepted");
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
