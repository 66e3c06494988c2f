use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::export::MovieExport;
use crate::models::{BackendKind, MovieRecord};
use crate::services::metadata::AggregateSearch;
use crate::services::sites::{AdapterStatus, InfoOptions, SearchOptions};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/search", get(search))
        .route("/info/:site/:id", get(get_info))
        .route("/lookup", get(lookup))
}

/// Query parameters shared by all metadata endpoints
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataQuery {
    pub keyword: Option<String>,
    pub manual: Option<bool>,
    pub translate: Option<bool>,
    pub proxy: Option<String>,
    pub image_mode: Option<BackendKind>,
    pub max_fanart: Option<usize>,
    pub extras: Option<bool>,
}

impl MetadataQuery {
    fn search_options(&self, state: &AppState) -> SearchOptions {
        SearchOptions {
            translate: self.translate.unwrap_or(false),
            proxy: self
                .proxy
                .clone()
                .filter(|p| !p.trim().is_empty())
                .or_else(|| state.config.http.proxy.clone()),
            image_mode: self.image_mode.unwrap_or(state.config.images.backend),
            manual: self.manual.unwrap_or(false),
        }
    }

    fn info_options(&self, state: &AppState) -> InfoOptions {
        InfoOptions {
            search: self.search_options(state),
            max_fanart: self.max_fanart.unwrap_or(state.config.images.max_fanart),
            want_extras: self.extras.unwrap_or(true),
            prior_small: None,
        }
    }

    fn keyword(&self) -> Result<&str, (StatusCode, String)> {
        self.keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| (StatusCode::BAD_REQUEST, "Missing keyword".to_string()))
    }
}

#[derive(Debug, Serialize)]
pub struct InfoReply {
    pub status: AdapterStatus,
    pub message: Option<String>,
    pub record: Option<MovieRecord>,
    pub export: Option<MovieExport>,
}

#[derive(Debug, Serialize)]
pub struct LookupReply {
    pub record: MovieRecord,
    pub export: MovieExport,
}

/// GET /api/search?keyword=ABC-123
async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetadataQuery>,
) -> Result<Json<AggregateSearch>, (StatusCode, String)> {
    let keyword = query.keyword()?;
    let options = query.search_options(&state);
    Ok(Json(state.metadata.search(keyword, &options).await))
}

/// GET /api/info/:site/:id
async fn get_info(
    State(state): State<Arc<AppState>>,
    Path((site, id)): Path<(String, String)>,
    Query(query): Query<MetadataQuery>,
) -> Json<InfoReply> {
    let options = query.info_options(&state);
    let response = state.metadata.info(&site, &id, &options).await;
    let base = state.config.image_base_url();

    Json(InfoReply {
        status: response.status,
        message: response.message,
        export: response
            .record
            .as_ref()
            .map(|record| MovieExport::from_record(record, &base)),
        record: response.record,
    })
}

/// GET /api/lookup?keyword=ABC-123 - search and fetch the best match
async fn lookup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetadataQuery>,
) -> Result<Json<LookupReply>, (StatusCode, String)> {
    let keyword = query.keyword()?;
    let options = query.info_options(&state);

    let record = state
        .metadata
        .lookup(keyword, &options)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("No metadata for '{}'", keyword)))?;

    let export = MovieExport::from_record(&record, &state.config.image_base_url());
    Ok(Json(LookupReply { record, export }))
}
