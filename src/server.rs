//! Transport frontends for the gate: the axum HTTP server (optionally behind the OAuth2 gate)
//! and the newline-delimited JSON local channel. Both hand every tool call to `Gate`.

pub mod oauth2;
pub mod stdio;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backend::BackendConnector;
use crate::config::GateConfig;
use crate::dispatch::{Gate, ToolCall};
use crate::error::AppError;
use crate::identity::{extract_networked, FORWARDED_USER_HEADER};
use oauth2::OAuth2Gateway;

pub const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Shared handler state: the gate context and, when configured, the OAuth2 gateway.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<Gate>,
    pub oauth: Option<Arc<OAuth2Gateway>>,
}

pub fn error_response(err: AppError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_json())).into_response()
}

/// Routes under the service URL's path prefix. `/mcp` sits behind the OAuth2 gate when enabled.
pub fn router(state: AppState) -> Router {
    let prefix = state.gate.config().path_prefix();

    let mut mcp: Router<AppState> = Router::new().route(&format!("{}/mcp", prefix), post(mcp_handler));
    if let Some(gw) = &state.oauth {
        mcp = mcp.route_layer(middleware::from_fn_with_state(gw.clone(), oauth2::require_oauth));
    }

    let mut app: Router<AppState> = Router::new()
        .route(&format!("{}/", prefix), get(|| async { "irods-mcp-gate ok" }))
        .merge(mcp);
    if let Some(gw) = &state.oauth {
        app = app.merge(oauth2::well_known_routes(&prefix, gw.clone()));
    }
    app.with_state(state)
}

async fn mcp_handler(
    State(state): State<AppState>,
    mut headers: HeaderMap,
    body: Result<Json<ToolCall>, JsonRejection>,
) -> Response {
    let Json(call) = match body {
        Ok(b) => b,
        Err(rej) => return error_response(AppError::user("bad_request", rej.body_text())),
    };

    // only the OAuth2 gate may assert a forwarded identity
    if state.oauth.is_none() {
        headers.remove(FORWARDED_USER_HEADER);
    }
    let identity = extract_networked(&mut headers);

    let gate = state.gate.clone();
    match tokio::task::spawn_blocking(move || gate.call_tool(&identity, &call.tool, &call.arguments)).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            error!("tool task failed: {}", e);
            error_response(AppError::internal("task_failed", e.to_string()))
        }
    }
}

/// Sweep expired pool entries on a fixed interval.
pub fn spawn_janitor(gate: Arc<Gate>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tick.tick().await;
            let g = gate.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || g.pool().sweep()).await {
                error!("pool sweep failed: {}", e);
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => { s.recv().await; }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Serve over HTTP until a shutdown signal arrives.
pub async fn serve_http(gate: Arc<Gate>) -> anyhow::Result<()> {
    let config = gate.config();
    let oauth = match config.oauth2.as_ref().filter(|_| config.oauth2_enabled()) {
        Some(o) => Some(Arc::new(
            OAuth2Gateway::discover(config.mcp_url(), o).await.context("failed to initialize OAuth2")?,
        )),
        None => None,
    };

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        "serving MCP on {} (public {}, oauth2 {})",
        addr,
        config.mcp_url(),
        if oauth.is_some() { "on" } else { "off" }
    );

    let app = router(AppState { gate: gate.clone(), oauth });
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

/// Run in the configured mode, then release every pooled session.
pub async fn run(config: GateConfig, connector: Arc<dyn BackendConnector>) -> anyhow::Result<()> {
    config.validate()?;
    let remote = config.remote;
    let gate = Arc::new(Gate::new(config, connector));
    let janitor = spawn_janitor(gate.clone(), JANITOR_INTERVAL);

    let res = if remote {
        serve_http(gate.clone()).await
    } else {
        tokio::select! {
            r = stdio::serve(gate.clone(), tokio::io::stdin(), tokio::io::stdout()) => r,
            _ = shutdown_signal() => Ok(()),
        }
    };

    janitor.abort();
    let g = gate.clone();
    tokio::task::spawn_blocking(move || g.pool().clear()).await?;
    info!("stopped");
    res
}
