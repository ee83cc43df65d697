//! Axum JSON API over the station query engine.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bikestat_core::{Aggregation, TimeRange};
use bikestat_storage::{QueryEngine, QueryError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub queries: QueryEngine,
}

impl AppState {
    pub fn new(queries: QueryEngine) -> Self {
        Self { queries }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("BIKESTAT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RangeQuery {
    from: Option<String>,
    to: Option<String>,
}

impl RangeQuery {
    fn range(&self) -> Result<TimeRange, QueryError> {
        Ok(TimeRange::parse(self.from.as_deref(), self.to.as_deref())?)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/networks/{tag}/stations/{station_id}/stats",
            get(history_handler),
        )
        .route(
            "/networks/{tag}/stations/{station_id}/stats/{agg}",
            get(aggregate_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve<F>(port: u16, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving station API");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path((tag, station_id)): Path<(String, String)>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let result = match query.range() {
        Ok(range) => state.queries.get_history(&tag, &station_id, range).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(history) => Json(history).into_response(),
        Err(err) => error_response(err),
    }
}

async fn aggregate_handler(
    State(state): State<Arc<AppState>>,
    Path((tag, station_id, agg)): Path<(String, String, String)>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let request = agg
        .parse::<Aggregation>()
        .map_err(QueryError::from)
        .and_then(|agg| Ok((agg, query.range()?)));
    let result = match request {
        Ok((agg, range)) => state.queries.get_hourly_stats(&tag, &station_id, range, agg).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: QueryError) -> Response {
    let status = match &err {
        QueryError::NotFound { .. } => StatusCode::NOT_FOUND,
        QueryError::InvalidRange(_) | QueryError::UnsupportedAggregation(_) => {
            StatusCode::BAD_REQUEST
        }
        QueryError::Storage(source) => {
            error!(error = %source, "query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
