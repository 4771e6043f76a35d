use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::AuthenticatedUser;
use crate::error::{LocationError, LocationResult};
use crate::error_handler::ErrorHandler;
use crate::model::{
    ConnectionId, LocationPatch, LocationPayload, LocationType, Scope, TransferChoices, UserId,
    ViewScope,
};
use crate::sync::CacheSyncEngine;
use crate::transfer::OwnershipTransferCoordinator;

pub struct AppState {
    pub engine: Arc<CacheSyncEngine>,
    pub transfers: OwnershipTransferCoordinator,
}

impl AppState {
    pub fn new(engine: Arc<CacheSyncEngine>) -> Self {
        Self {
            transfers: OwnershipTransferCoordinator::new(engine.clone()),
            engine,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    #[serde(default)]
    pub scope: ViewScope,
}

#[derive(Debug, Deserialize)]
pub struct MarkRequest {
    pub scope: Scope,
    pub location: LocationPayload,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub scope: Scope,
    pub patch: LocationPatch,
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    #[serde(rename = "type")]
    pub location_type: LocationType,
    pub scope: Scope,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub new_owner_id: UserId,
    pub choices: TransferChoices,
}

pub fn setup_routes(config: &mut web::ServiceConfig) {
    config
        .app_data(web::JsonConfig::default().error_handler(|err, req| ErrorHandler::payload_error(err, req)))
        .app_data(web::QueryConfig::default().error_handler(|err, req| ErrorHandler::payload_error(err, req)))
        .app_data(web::PathConfig::default().error_handler(|err, req| ErrorHandler::payload_error(err, req)))
        .service(
            web::scope("/api")
                .route("/health", web::get().to(health_check))
                .service(
                    web::scope("/bus-hotel-locations/{connection_id}")
                        .route("", web::get().to(get_active))
                        .route("/mark", web::post().to(mark_location))
                        .route("/update", web::put().to(update_location))
                        .route("/remove", web::post().to(remove_location))
                        .route("/transfer-ownership", web::post().to(transfer_ownership))
                        .route("/resync", web::post().to(resync_connection)),
                ),
        )
        .route("/", web::get().to(index));
}

fn success<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "success": true,
        "data": data
    }))
}

async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Group Locations API",
        "status": "running"
    }))
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "group-locations"
    }))
}

async fn get_active(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<ConnectionId>,
    query: web::Query<ActiveQuery>,
) -> LocationResult<HttpResponse> {
    let view = state
        .engine
        .get_active(user.0, path.into_inner(), query.scope)
        .await?;
    Ok(success(view))
}

async fn mark_location(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<ConnectionId>,
    body: web::Json<MarkRequest>,
) -> LocationResult<HttpResponse> {
    let MarkRequest { scope, location } = body.into_inner();
    let mark = state
        .engine
        .mark(user.0, path.into_inner(), location.location_type(), scope, location)
        .await?;
    Ok(success(mark))
}

async fn update_location(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<ConnectionId>,
    body: web::Json<UpdateRequest>,
) -> LocationResult<HttpResponse> {
    let UpdateRequest { scope, patch } = body.into_inner();
    let mark = state
        .engine
        .update(user.0, path.into_inner(), patch.location_type(), scope, patch)
        .await?;
    Ok(success(mark))
}

async fn remove_location(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<ConnectionId>,
    body: web::Json<RemoveRequest>,
) -> LocationResult<HttpResponse> {
    let connection_id = path.into_inner();
    state
        .engine
        .remove(user.0, connection_id, body.location_type, body.scope)
        .await?;
    Ok(success(json!({
        "connectionId": connection_id,
        "type": body.location_type,
        "scope": body.scope
    })))
}

async fn transfer_ownership(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<ConnectionId>,
    body: web::Json<TransferRequest>,
) -> LocationResult<HttpResponse> {
    let outcome = state
        .transfers
        .transfer_ownership(user.0, path.into_inner(), body.new_owner_id, body.choices)
        .await?;
    Ok(success(outcome))
}

async fn resync_connection(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<ConnectionId>,
) -> LocationResult<HttpResponse> {
    let connection_id = path.into_inner();
    let connection = state.engine.load_connection(connection_id).await?;
    if connection.active_member(user.0).is_none() {
        return Err(LocationError::Forbidden(
            "user is not an active member of this connection".to_string(),
        ));
    }

    let written = state.engine.resync_connection(connection_id).await?;
    Ok(success(json!({
        "connectionId": connection_id,
        "entriesWritten": written
    })))
}
