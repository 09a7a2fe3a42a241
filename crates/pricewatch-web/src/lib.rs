//! Read-only JSON monitor API over the canonical catalog.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use pricewatch_catalog::{Catalog, CatalogStore};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const CRATE_NAME: &str = "pricewatch-web";

#[derive(Clone)]
pub struct AppState {
    pub store: CatalogStore,
}

impl AppState {
    pub fn new(store: CatalogStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChangesQuery {
    since: Option<DateTime<Utc>>,
    /// Percent, e.g. `5` for a 5% move either way.
    min_pct: Option<f64>,
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/price-changes", get(price_changes_handler))
        .route("/api/products/{id}", get(product_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "monitor api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match load(&state).await {
        Ok(catalog) => Json(catalog.get_stats()).into_response(),
        Err(resp) => resp,
    }
}

async fn price_changes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let catalog = match load(&state).await {
        Ok(catalog) => catalog,
        Err(resp) => return resp,
    };
    let mut changes = catalog.get_price_changes(query.since, query.min_pct.map(|pct| pct / 100.0));
    if let Some(limit) = query.limit {
        changes.truncate(limit);
    }
    Json(changes).into_response()
}

async fn product_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let catalog = match load(&state).await {
        Ok(catalog) => catalog,
        Err(resp) => return resp,
    };
    match catalog.get_product(&id) {
        Some(product) => Json(product).into_response(),
        None => json_error(StatusCode::NOT_FOUND, format!("product `{id}` not found")),
    }
}

async fn load(state: &AppState) -> Result<Catalog, Response> {
    state.store.load().await.map_err(|err| {
        error!(error = %err, path = %state.store.path().display(), "loading catalog failed");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("catalog unavailable: {err}"))
    })
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
