use axum::Router;
use std::sync::Arc;

use crate::AppState;

mod movies;
mod system;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/api", movies::routes())
        .nest("/api/system", system::routes())
}
