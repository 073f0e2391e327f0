use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use tare_core::{BoardAddress, BoardDetails};
use tracing::info;

use super::AppState;
use super::error::ApiError;
use crate::transport::Transport;

#[derive(Debug, Deserialize)]
pub struct LightRequest {
    pub on: bool,
}

fn not_found(address: &BoardAddress) -> ApiError {
    ApiError::NotFound(format!("no board with address {address}"))
}

pub async fn list_boards<T: Transport>(
    State(state): State<AppState<T>>,
) -> Json<Vec<BoardDetails>> {
    Json(state.registry.details())
}

pub async fn get_board<T: Transport>(
    State(state): State<AppState<T>>,
    Path(address): Path<String>,
) -> Result<Json<BoardDetails>, ApiError> {
    let address = BoardAddress::from(address);
    let session = state.registry.get(&address).ok_or_else(|| not_found(&address))?;
    Ok(Json(session.details()))
}

pub async fn set_light<T: Transport>(
    State(state): State<AppState<T>>,
    Path(address): Path<String>,
    Json(request): Json<LightRequest>,
) -> Result<StatusCode, ApiError> {
    let address = BoardAddress::from(address);
    let session = state.registry.get(&address).ok_or_else(|| not_found(&address))?;

    session.set_light(request.on).await?;
    info!(%address, on = request.on, "Set board light");
    Ok(StatusCode::NO_CONTENT)
}
