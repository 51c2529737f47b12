//! # Embedded Dashboard
//!
//! The inspector's static assets are compiled into the binary and served
//! with SPA-style routing: unknown non-`/api` paths fall back to the root
//! document.

use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

const INDEX_HTML: &[u8] = include_bytes!("../../assets/index.html");

/// Fallback handler for everything the API routes do not claim.
pub async fn serve_asset(uri: Uri) -> Response {
    let path = uri.path();
    if path.starts_with("/api/") || path == "/api" {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    match asset_for(path) {
        Some((bytes, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        // SPA fallback: the root document owns every unknown route.
        None => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            INDEX_HTML,
        )
            .into_response(),
    }
}

fn asset_for(path: &str) -> Option<(&'static [u8], &'static str)> {
    match path {
        "/" | "/index.html" => Some((INDEX_HTML, "text/html; charset=utf-8")),
        _ => None,
    }
}
