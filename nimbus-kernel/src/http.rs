/**
 * DASHBOARD API - Read-only projections of the cluster
 *
 * RÔLE : Expose l'état des hosts, des objets et des migrations en JSON pour
 * les tableaux de bord. Aucune route ne modifie l'état du runtime.
 *
 * SÉCURITÉ : si `NIMBUS_API_KEY` est défini, le header `x-api-key` est exigé
 * sur toutes les routes sauf /health.
 */

use crate::hosts::{HostDirectory, LivenessView};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use nimbus_core::pool::HostSnapshot;
use nimbus_core::{CloudRuntime, HostId, HostState, HostView, MigrationRecord, ObjectId, ObjectView};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<CloudRuntime>,
    pub directory: Arc<HostDirectory>,
}

#[derive(Debug, Serialize)]
pub struct HealthView {
    status: &'static str,
    pool: String,
    policy: &'static str,
    hosts: usize,
    objects: usize,
}

#[derive(Debug, Serialize)]
pub struct HostEntry {
    #[serde(flatten)]
    host: HostView,
    state: HostState,
    pool: String,
    objects: usize,
    liveness: Option<LivenessView>,
}

fn to_entry(snapshot: &HostSnapshot, directory: &HostDirectory) -> HostEntry {
    HostEntry {
        host: snapshot.view(),
        state: snapshot.state,
        pool: snapshot.pool.clone(),
        objects: snapshot.objects.len(),
        liveness: directory.liveness(snapshot.id),
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("NIMBUS_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "dashboard request without a valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/hosts", get(get_hosts))
        .route("/hosts/{id}", get(get_host))
        .route("/objects", get(get_objects))
        .route("/objects/{id}", get(get_object))
        .route("/migrations", get(get_migrations))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

async fn get_health(State(app): State<AppState>) -> Json<HealthView> {
    let pool = app.runtime.pool();
    Json(HealthView {
        status: "ok",
        pool: pool.name().to_string(),
        policy: app.runtime.policy().name(),
        hosts: pool.hosts_count(),
        objects: pool.object_count(),
    })
}

async fn get_hosts(State(app): State<AppState>) -> Json<Vec<HostEntry>> {
    let hosts = app.runtime.pool().hosts();
    Json(hosts.iter().map(|h| to_entry(h, &app.directory)).collect())
}

async fn get_host(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<HostEntry>, StatusCode> {
    let id: HostId = id.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    app.runtime
        .pool()
        .host(id)
        .map(|h| Json(to_entry(&h, &app.directory)))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_objects(State(app): State<AppState>) -> Json<Vec<ObjectView>> {
    Json(app.runtime.object_views().await)
}

async fn get_object(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<ObjectView>, StatusCode> {
    let id: ObjectId = id.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    if app.runtime.pool().owner_of(id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    app.runtime
        .object_views()
        .await
        .into_iter()
        .find(|o| o.id == id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_migrations(State(app): State<AppState>) -> Json<Vec<MigrationRecord>> {
    Json(app.runtime.pool().migrations())
}
