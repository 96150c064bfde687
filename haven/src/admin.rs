use crate::auth::AdminUser;
use crate::db;
use crate::routes::AppState;
use crate::AppError;
use axum::extract::State;
use axum::Json;
use overlay_node::ArtifactId;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::spawn_blocking;

pub async fn get_admin_challenge(
    State(state): State<Arc<AppState>>,
) -> Result<Vec<u8>, AppError> {
    state.auth.admin_challenge().await
}

#[derive(Deserialize)]
pub struct AdminLoginBody {
    #[serde(rename = "challange")]
    challenge: String,
}

pub async fn login_admin(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AdminLoginBody>,
) -> Result<String, AppError> {
    state.auth.login_admin(&body.challenge).await
}

pub async fn all_images(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
) -> Result<Json<Vec<db::images::Image>>, AppError> {
    let store = state.store.clone();
    let images = spawn_blocking(move || {
        let conn = store.conn();
        db::images::all(&conn)
    })
    .await
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

    Ok(Json(images))
}

#[derive(Deserialize)]
pub struct SetImageActivityBody {
    id: i64,
    #[serde(rename = "address")]
    wallet: String,
    #[serde(rename = "postId")]
    post: String,
    active: bool,
}

#[derive(Serialize)]
pub struct ImageActivityResponse {
    id: i64,
    #[serde(rename = "address")]
    wallet: String,
    #[serde(rename = "postId")]
    post: String,
    active: bool,
}

/// Soft-deletes (or re-enables) an artifact. Disabled artifacts stay stored
/// but are never served again, locally or to the overlay.
pub async fn set_image_activity(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Json(body): Json<SetImageActivityBody>,
) -> Result<Json<ImageActivityResponse>, AppError> {
    let id = ArtifactId {
        wallet: body.wallet,
        post_id: body.post,
        local_id: body.id,
    };

    let store = state.store.clone();
    let image = spawn_blocking(move || {
        let conn = store.conn();
        db::images::set_active(&conn, &id, body.active)
    })
    .await
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    .map_err(|e| AppError::InternalServerError(format!("Failed to update image: {e:#}")))?
    .ok_or_else(|| AppError::NotFound("Image not found".to_string()))?;

    Ok(Json(ImageActivityResponse {
        id: image.id,
        wallet: image.wallet,
        post: image.post,
        active: image.active,
    }))
}

pub async fn all_feedback(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
) -> Result<Json<Vec<db::feedback::Feedback>>, AppError> {
    let store = state.store.clone();
    let feedback = spawn_blocking(move || {
        let conn = store.conn();
        db::feedback::all(&conn)
    })
    .await
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

    Ok(Json(feedback))
}
