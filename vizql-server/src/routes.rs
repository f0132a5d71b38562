//! HTTP route handlers.

use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use serde::Deserialize;
use vizql_gateway::service::{PreviewService, WidgetDataService};
use vizql_types::{DrillFilter, Pagination, RawGraph};

use crate::auth::Identity;
use crate::errors::ApiError;
use crate::state::AppState;

fn identity_of(req: &HttpRequest) -> Result<Identity, ApiError> {
    req.extensions()
        .get::<Identity>()
        .cloned()
        .ok_or_else(|| ApiError::from(vizql_types::errors::CoreError::InternalInvariantViolation(
            "auth middleware did not populate an Identity".to_string(),
        )))
}

#[derive(Debug, Deserialize)]
pub struct PreviewBody {
    pub graph: RawGraph,
    pub target_node: String,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default)]
    pub drill_filters: Vec<DrillFilter>,
}

/// `POST /preview` — compiles and executes a canvas-authored graph against
/// its target node, serving from the preview cache when possible.
pub async fn preview(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<PreviewBody>,
) -> Result<HttpResponse, ApiError> {
    let identity = identity_of(&req)?;
    let body = body.into_inner();
    let result = state
        .preview(
            identity.tenant,
            body.graph,
            vizql_types::NodeId(body.target_node),
            body.pagination,
            body.drill_filters,
        )
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

#[derive(Debug, Deserialize)]
pub struct WidgetDataQuery {
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    50
}

/// `GET /widgets/{widgetID}/data` — resolves a previously registered
/// widget definition and runs it through the same preview/widget pipeline
/// with `RequestProfile::Widget` bounds.
pub async fn widget_data(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<WidgetDataQuery>,
) -> Result<HttpResponse, ApiError> {
    let identity = identity_of(&req)?;
    let widget_id = path.into_inner();

    let result = state
        .widget_data(
            identity.tenant,
            widget_id,
            Pagination {
                offset: query.offset,
                limit: query.limit,
            },
            vec![],
        )
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

/// Liveness probe: the process is up and accepting connections.
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

/// Readiness probe: the process is up AND its backing stores are
/// reachable enough to serve requests.
pub async fn readyz(state: web::Data<AppState>) -> HttpResponse {
    if state.store_clients.olap.ping().await {
        HttpResponse::Ok().body("ready")
    } else {
        HttpResponse::ServiceUnavailable().body("store unavailable")
    }
}
