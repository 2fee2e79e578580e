//! JSON API over the pipeline coordinator.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metamorph_core::EntityType;
use metamorph_sync::{build_scheduler, coordinator_from_env, CoordinatorError, PipelineCoordinator};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "metamorph-web";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<PipelineCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<PipelineCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[derive(Debug, Serialize)]
struct Overview {
    name: &'static str,
    version: &'static str,
    sources: Vec<String>,
    endpoints: Vec<&'static str>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api", get(overview_handler))
        .route("/api/", get(overview_handler))
        .route("/api/data/{entity_type}", get(data_handler))
        .route("/api/insights/users", get(user_insights_handler))
        .route("/api/insights/products", get(product_insights_handler))
        .route(
            "/api/enrich/transactions",
            get(enriched_handler).post(enrich_handler),
        )
        .route("/api/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

/// Serve on `METAMORPH_WEB_PORT`, starting the refresh scheduler when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let coordinator = Arc::new(coordinator_from_env().await?);
    let port = coordinator.config().web_port;
    let scheduler = build_scheduler(coordinator.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!(cron = %coordinator.config().refresh_cron, "refresh scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving metamorph api");
    axum::serve(listener, app(AppState::new(coordinator))).await?;
    Ok(())
}

async fn overview_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(Overview {
        name: "metamorph",
        version: env!("CARGO_PKG_VERSION"),
        sources: state
            .coordinator
            .sources()
            .map(|s| s.to_string())
            .collect(),
        endpoints: vec![
            "GET /api/data/{entity_type}",
            "GET /api/insights/users",
            "GET /api/insights/products",
            "GET /api/enrich/transactions",
            "POST /api/enrich/transactions",
            "POST /api/refresh",
        ],
    })
    .into_response()
}

async fn data_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(entity_type): AxumPath<String>,
) -> Response {
    let entity_type: EntityType = match entity_type.parse() {
        Ok(entity_type) => entity_type,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };
    match state.coordinator.query(entity_type).await {
        Ok(entities) => Json(entities).into_response(),
        Err(err) => coordinator_error(err),
    }
}

async fn user_insights_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.user_insights().await {
        Ok(spend) => Json(spend).into_response(),
        Err(err) => coordinator_error(err),
    }
}

async fn product_insights_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.product_insights().await {
        Ok(popularity) => Json(popularity).into_response(),
        Err(err) => coordinator_error(err),
    }
}

async fn enriched_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.enriched_transactions().await {
        Ok(enriched) => Json(enriched).into_response(),
        Err(err) => coordinator_error(err),
    }
}

async fn enrich_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.enrich().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => coordinator_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.refresh_all().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => coordinator_error(err),
    }
}

fn coordinator_error(err: CoordinatorError) -> Response {
    let status = match err {
        CoordinatorError::AlreadyRunning { .. } => StatusCode::CONFLICT,
        CoordinatorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use metamorph_sync::{PipelineConfig, SourceRegistry};
    use serde_json::Value as JsonValue;
    use std::path::{Path, PathBuf};
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn fixture_app() -> Router {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - {source: product, display_name: FakeStore, fixture: fixtures/products/sample/payload.json}
  - {source: user, display_name: RandomUser, fixture: fixtures/users/sample/payload.json}
  - {source: transaction, display_name: Orders, fixture: fixtures/transactions/sample/payload.json}
"#,
        )
        .unwrap();
        let config = PipelineConfig {
            workspace_root: workspace_root(),
            ..PipelineConfig::default()
        };
        let coordinator = PipelineCoordinator::from_registry(config, &registry).unwrap();
        app(AppState::new(Arc::new(coordinator)))
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_overview() {
        let app = fixture_app();
        let (status, body) = send(&app, "GET", "/api/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sources"], json!(["product", "user", "transaction"]));
    }

    #[tokio::test]
    async fn unknown_entity_type_is_bad_request() {
        let app = fixture_app();
        let (status, body) = send(&app, "GET", "/api/data/widgets").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("widgets"));
    }

    #[tokio::test]
    async fn refresh_then_query_returns_canonical_entities() {
        let app = fixture_app();
        let (status, summary) = send(&app, "POST", "/api/refresh").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["sources"][0]["status"], json!("ok"));
        assert_eq!(summary["sources"][0]["records_ingested"], json!(3));

        let (status, products) = send(&app, "GET", "/api/data/products").await;
        assert_eq!(status, StatusCode::OK);
        let products = products.as_array().unwrap();
        assert_eq!(products.len(), 3);
        assert_eq!(products[0]["entity_type"], json!("product"));
        assert_eq!(products[0]["metadata"]["source"], json!("FakeStoreAPI"));
    }

    #[tokio::test]
    async fn enrich_endpoint_feeds_insights() {
        let app = fixture_app();
        let (status, insights) = send(&app, "GET", "/api/insights/products").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(insights["transaction_count"], json!(0));

        send(&app, "POST", "/api/refresh").await;
        let (status, summary) = send(&app, "POST", "/api/enrich/transactions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["enriched_count"], json!(4));
        assert_eq!(summary["skipped_count"], json!(2));

        let (_, users) = send(&app, "GET", "/api/insights/users").await;
        assert_eq!(users[0]["name"], json!("Lars Eriksen"));
        let (_, enriched) = send(&app, "GET", "/api/enrich/transactions").await;
        assert_eq!(enriched.as_array().unwrap().len(), 4);
    }
}
