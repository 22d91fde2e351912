//! HTTP API for the safeprag-sync service

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::clients::ClientRegistry;
use crate::config::Config;
use crate::context::Context;
use crate::devices::{self, TypeSummary};
use crate::error::{AppError, AppResult};
use crate::events::AppEvent;
use crate::files::{Downloads, FileEntry, SavedFile};
use crate::models::{
    Client, Company, Device, Product, Schedule, ScheduleInput, ScheduleStatus, ServiceOrder,
    ServiceOrderUpdate, Signature, UserData,
};
use crate::orders::ServiceOrders;
use crate::registry::{Devices, Products, Profiles, Signatures};
use crate::scheduling::{RetroactiveVisit, ScheduleFilter, ScheduleStats, Scheduler, Transition};
use crate::store::{self, Collection, now_rfc3339};
use crate::sync::{RefreshReport, SyncBridge, SyncStatus};

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub ctx: Context,
    pub scheduler: Scheduler,
    pub clients: ClientRegistry,
    pub orders: ServiceOrders,
    pub products: Products,
    pub devices: Devices,
    pub profiles: Profiles,
    pub signatures: Signatures,
    pub downloads: Downloads,
    /// Absent while no backend is configured
    pub sync: Option<Arc<SyncBridge>>,
}

impl AppState {
    pub fn new(
        ctx: Context,
        config: Config,
        downloads: Downloads,
        sync: Option<Arc<SyncBridge>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            scheduler: Scheduler::new(ctx.clone()),
            clients: ClientRegistry::new(ctx.clone()),
            orders: ServiceOrders::new(ctx.clone()),
            products: Products::new(ctx.clone()),
            devices: Devices::new(ctx.clone()),
            profiles: Profiles::new(ctx.clone()),
            signatures: Signatures::new(ctx.clone()),
            downloads,
            sync,
            ctx,
        })
    }

    fn sync_status(&self) -> AppResult<SyncStatus> {
        match &self.sync {
            Some(bridge) => bridge.status(),
            None => SyncStatus::disabled(&self.ctx),
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/schedules", get(list_schedules).post(create_schedule))
        .route("/api/v1/schedules/check", post(check_schedule))
        .route("/api/v1/schedules/reconcile", post(reconcile_schedules))
        .route(
            "/api/v1/schedules/{id}",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/api/v1/schedules/{id}/start", post(start_schedule))
        .route("/api/v1/schedules/{id}/finish", post(finish_schedule))
        .route("/api/v1/schedules/{id}/cancel", post(cancel_schedule))
        .route("/api/v1/schedules/{id}/retroactive", post(register_retroactive))
        .route("/api/v1/dashboard", get(dashboard))
        .route("/api/v1/clients", get(list_clients).post(create_client))
        .route(
            "/api/v1/clients/{id}",
            get(get_client).put(update_client).delete(delete_client),
        )
        .route("/api/v1/products", get(list_products).post(create_product))
        .route(
            "/api/v1/products/{id}",
            put(update_product).delete(delete_product),
        )
        .route("/api/v1/devices", get(list_devices).put(replace_devices))
        .route("/api/v1/devices/selectable", get(selectable_devices))
        .route(
            "/api/v1/devices/summary",
            get(stored_device_summary).post(device_summary),
        )
        .route("/api/v1/service-orders", get(list_orders))
        .route(
            "/api/v1/service-orders/{id}",
            get(get_order).put(update_order),
        )
        .route("/api/v1/company", get(get_company).put(put_company))
        .route("/api/v1/user", get(get_user).put(put_user))
        .route("/api/v1/signatures", get(list_signatures).put(put_signature))
        .route("/api/v1/sync/status", get(sync_status))
        .route("/api/v1/sync/refresh", post(sync_refresh))
        .route("/api/v1/sync/retry", post(sync_retry))
        .route("/api/v1/backup", get(export_backup).post(restore_backup))
        .route("/api/v1/downloads", get(list_downloads).post(create_download))
        .route("/api/v1/downloads/history", get(download_history))
        .route("/api/v1/downloads/{name}", axum::routing::delete(delete_download))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "safeprag-sync",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Auth middleware - validates Bearer token
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token,
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Missing or invalid Authorization header" })),
            )
                .into_response();
        }
    };

    if !state.config.validate_token(token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid API token" })),
        )
            .into_response();
    }

    next.run(request).await
}

// Schedules

async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ScheduleFilter>,
) -> AppResult<Json<Vec<Schedule>>> {
    Ok(Json(state.scheduler.list(&filter)?))
}

async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Schedule>> {
    Ok(Json(state.scheduler.get(&id)?))
}

async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ScheduleInput>,
) -> AppResult<(StatusCode, Json<Schedule>)> {
    let schedule = state.scheduler.create(input)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest {
    #[serde(flatten)]
    input: ScheduleInput,
    #[serde(default)]
    exclude_id: Option<String>,
}

/// Validates a window without booking it
async fn check_schedule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CheckRequest>,
) -> AppResult<Json<Value>> {
    state
        .scheduler
        .check_availability(&request.input, request.exclude_id.as_deref())?;
    Ok(Json(serde_json::json!({ "available": true })))
}

async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<ScheduleInput>,
) -> AppResult<Json<Schedule>> {
    Ok(Json(state.scheduler.update(&id, input)?))
}

async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.scheduler.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Transition>> {
    Ok(Json(state.scheduler.start(&id)?))
}

async fn finish_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Transition>> {
    Ok(Json(state.scheduler.finish(&id)?))
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    request: Option<Json<CancelRequest>>,
) -> AppResult<Json<Transition>> {
    let reason = request.and_then(|Json(r)| r.reason);
    Ok(Json(state.scheduler.cancel(&id, reason.as_deref())?))
}

/// Registers a visit that happened without being started live
async fn register_retroactive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(visit): Json<RetroactiveVisit>,
) -> AppResult<Json<Transition>> {
    Ok(Json(state.scheduler.register_retroactive(&id, &visit)?))
}

async fn reconcile_schedules(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<Schedule>>> {
    Ok(Json(state.scheduler.reconcile_missed()?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Dashboard {
    stats: ScheduleStats,
    today: Vec<Schedule>,
    sync: SyncStatus,
}

async fn dashboard(State(state): State<Arc<AppState>>) -> AppResult<Json<Dashboard>> {
    let today = Local::now().date_naive();
    let agenda = state.scheduler.list(&ScheduleFilter {
        start_date: Some(today),
        end_date: Some(today),
        ..Default::default()
    })?;
    Ok(Json(Dashboard {
        stats: state.scheduler.stats(today)?,
        today: agenda
            .into_iter()
            .filter(|s| s.status != ScheduleStatus::Cancelled)
            .collect(),
        sync: state.sync_status()?,
    }))
}

// Clients

#[derive(Debug, Deserialize)]
struct ClientQuery {
    q: Option<String>,
}

async fn list_clients(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClientQuery>,
) -> AppResult<Json<Vec<Client>>> {
    let clients = match query.q.as_deref() {
        Some(term) => state.clients.search(term)?,
        None => state.clients.list()?,
    };
    Ok(Json(clients))
}

async fn get_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Client>> {
    Ok(Json(state.clients.get(&id)?))
}

async fn create_client(
    State(state): State<Arc<AppState>>,
    Json(input): Json<Client>,
) -> AppResult<(StatusCode, Json<Client>)> {
    Ok((StatusCode::CREATED, Json(state.clients.create(input)?)))
}

async fn update_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<Client>,
) -> AppResult<Json<Client>> {
    Ok(Json(state.clients.update(&id, input)?))
}

async fn delete_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.clients.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// Products

async fn list_products(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<Product>>> {
    Ok(Json(state.products.list()?))
}

async fn create_product(
    State(state): State<Arc<AppState>>,
    Json(input): Json<Product>,
) -> AppResult<(StatusCode, Json<Product>)> {
    Ok((StatusCode::CREATED, Json(state.products.create(input)?)))
}

async fn update_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<Product>,
) -> AppResult<Json<Product>> {
    Ok(Json(state.products.update(&id, input)?))
}

async fn delete_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.products.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// Devices

async fn list_devices(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<Device>>> {
    Ok(Json(state.devices.list()?))
}

async fn replace_devices(
    State(state): State<Arc<AppState>>,
    Json(devices): Json<Vec<Device>>,
) -> AppResult<Json<Vec<Device>>> {
    Ok(Json(state.devices.replace(devices)?))
}

async fn selectable_devices(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<Device>>> {
    Ok(Json(state.devices.selectable()?))
}

async fn stored_device_summary(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<TypeSummary>>> {
    Ok(Json(devices::summarize(&state.devices.list()?)))
}

/// Summary of an ad-hoc list, e.g. the devices captured on an open order
async fn device_summary(Json(devices): Json<Vec<Device>>) -> Json<Vec<TypeSummary>> {
    Json(devices::summarize(&devices))
}

// Service orders

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderQuery {
    schedule_id: Option<String>,
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrderQuery>,
) -> AppResult<Json<Vec<ServiceOrder>>> {
    Ok(Json(state.orders.list(query.schedule_id.as_deref())?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<ServiceOrder>> {
    Ok(Json(state.orders.get(&id)?))
}

async fn update_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<ServiceOrderUpdate>,
) -> AppResult<Json<ServiceOrder>> {
    Ok(Json(state.orders.update(&id, update)?))
}

// Profiles and signatures

async fn get_company(State(state): State<Arc<AppState>>) -> AppResult<Json<Company>> {
    Ok(Json(state.profiles.company()?))
}

async fn put_company(
    State(state): State<Arc<AppState>>,
    Json(company): Json<Company>,
) -> AppResult<Json<Company>> {
    Ok(Json(state.profiles.save_company(company)?))
}

async fn get_user(State(state): State<Arc<AppState>>) -> AppResult<Json<UserData>> {
    Ok(Json(state.profiles.user()?))
}

async fn put_user(
    State(state): State<Arc<AppState>>,
    Json(user): Json<UserData>,
) -> AppResult<Json<UserData>> {
    Ok(Json(state.profiles.save_user(user)?))
}

async fn list_signatures(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<Signature>>> {
    Ok(Json(state.signatures.list()?))
}

async fn put_signature(
    State(state): State<Arc<AppState>>,
    Json(signature): Json<Signature>,
) -> AppResult<Json<Signature>> {
    Ok(Json(state.signatures.save(signature)?))
}

// Sync

async fn sync_status(State(state): State<Arc<AppState>>) -> AppResult<Json<SyncStatus>> {
    Ok(Json(state.sync_status()?))
}

async fn sync_refresh(State(state): State<Arc<AppState>>) -> AppResult<Json<RefreshReport>> {
    let bridge = state
        .sync
        .as_ref()
        .ok_or_else(|| AppError::Validation("Sincronização desativada: configure o servidor remoto".into()))?;
    let report = bridge.refresh().await?;
    tracing::info!(
        delivered = report.push.delivered,
        pulled = report.pull.records,
        "Manual refresh complete"
    );
    Ok(Json(report))
}

async fn sync_retry(State(state): State<Arc<AppState>>) -> AppResult<Json<Value>> {
    let requeued = match &state.sync {
        Some(bridge) => bridge.retry_failed()?,
        None => state.ctx.store.retry_failed(&now_rfc3339())?,
    };
    Ok(Json(serde_json::json!({ "requeued": requeued })))
}

// Backup

async fn export_backup(State(state): State<Arc<AppState>>) -> AppResult<Json<Value>> {
    Ok(Json(store::export_backup(state.ctx.store.as_ref())?))
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Json(backup): Json<Value>,
) -> AppResult<Json<Value>> {
    let restored = {
        let _guard = state.ctx.write()?;
        store::restore_backup(state.ctx.store.as_ref(), &backup)?
    };
    state.ctx.sync_wake().notify_one();
    for collection in Collection::ALL {
        state.ctx.publish(AppEvent::CollectionReloaded { collection });
    }
    tracing::info!(restored, "Backup restored");
    Ok(Json(serde_json::json!({ "restored": restored })))
}

// Downloads

#[derive(Debug, Deserialize)]
struct SubdirQuery {
    subdir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: String,
    filename: String,
    #[serde(default)]
    subdir: Option<String>,
}

async fn list_downloads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubdirQuery>,
) -> AppResult<Json<Vec<FileEntry>>> {
    Ok(Json(state.downloads.list(query.subdir.as_deref()).await?))
}

async fn create_download(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DownloadRequest>,
) -> AppResult<(StatusCode, Json<SavedFile>)> {
    let saved = state
        .downloads
        .download(&request.url, &request.filename, request.subdir.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn download_history(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<SavedFile>>> {
    Ok(Json(state.downloads.history()?))
}

async fn delete_download(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<SubdirQuery>,
) -> AppResult<StatusCode> {
    state.downloads.delete(&name, query.subdir.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}
