use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::models::BackendKind;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/info", get(get_system_info))
}

#[derive(Serialize)]
pub struct SystemInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub sites: Vec<&'static str>,
    pub image_backend: BackendKind,
    pub image_base_url: String,
    pub placeholders: usize,
    pub cached_pages: usize,
    pub cached_bytes: usize,
}

/// GET /api/system/info
async fn get_system_info(State(state): State<Arc<AppState>>) -> Json<SystemInfo> {
    Json(SystemInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        sites: state.metadata.site_names(),
        image_backend: state.config.images.backend,
        image_base_url: state.config.image_base_url(),
        placeholders: state.context.classifier.placeholder_count(),
        cached_pages: state.context.session.cache_len().await,
        cached_bytes: state.context.session.cache_bytes().await,
    })
}
