//! Operator endpoints over the dead-letter store.
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use telemetry_common::deadletter::{DeadLetterRecord, Page, ReprocessReport};
use tracing::{debug, info};
use uuid::Uuid;

use super::AppState;
use crate::api::{ApiError, DeleteResponse, IdsRequest, ListParams, SuggestionsResponse};

fn dead_letter_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ApiError> {
    path.map(|Path(id)| id)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn ids(payload: Result<Json<IdsRequest>, JsonRejection>) -> Result<Vec<Uuid>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    request.validate()?;
    Ok(request.ids)
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Page<DeadLetterRecord>>, ApiError> {
    state.tokens.authorize_operator(&headers)?;
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let (filter, page) = params.into_query()?;

    debug!("listing dead letters matching {:?}", filter);
    let page = state.pipeline.router().store().list(&filter, page).await?;
    Ok(Json(page))
}

pub async fn detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<DeadLetterRecord>, ApiError> {
    state.tokens.authorize_operator(&headers)?;
    let id = dead_letter_id(path)?;

    match state.pipeline.router().store().get(id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::NotFound(id)),
    }
}

pub async fn suggestions(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<SuggestionsResponse>, ApiError> {
    state.tokens.authorize_operator(&headers)?;
    let id = dead_letter_id(path)?;

    let schemas = state.pipeline.validator().schemas();
    match state.pipeline.router().suggestions(id, schemas).await? {
        Some(suggestions) => Ok(Json(SuggestionsResponse { id, suggestions })),
        None => Err(ApiError::NotFound(id)),
    }
}

pub async fn reprocess(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<IdsRequest>, JsonRejection>,
) -> Result<Json<ReprocessReport>, ApiError> {
    state.tokens.authorize_operator(&headers)?;
    let ids = ids(payload)?;

    let report = state.pipeline.reprocess(&ids, state.policy).await;
    Ok(Json(report))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<IdsRequest>, JsonRejection>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.tokens.authorize_admin(&headers)?;
    let ids = ids(payload)?;

    let deleted = state.pipeline.router().store().delete(&ids).await?;
    info!(requested = ids.len(), deleted, "deleted dead letters");
    Ok(Json(DeleteResponse { deleted }))
}
