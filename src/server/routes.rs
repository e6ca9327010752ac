use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use crate::crawler::JobTarget;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CrawlRequest {
    pub city: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub url: String,
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// POST /api/crawl: submit a city for discovery + deep crawl.
pub async fn submit_city(
    Extension(state): Extension<AppState>,
    Json(request): Json<CrawlRequest>,
) -> Response {
    let city = request.city.trim();
    if city.is_empty() {
        return bad_request("City missing");
    }

    info!(city, "Received crawl request");
    let submission = state.queue.submit(JobTarget::City {
        name: city.to_string(),
    });
    Json(submission).into_response()
}

/// POST /api/submit: submit a pre-resolved seed URL (community driven).
pub async fn submit_url(
    Extension(state): Extension<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    if request.url.trim().is_empty() {
        return bad_request("URL missing");
    }
    if Url::parse(&request.url).is_err() {
        return bad_request(format!("Invalid URL: {}", request.url));
    }

    let category = request
        .category
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| "general".to_string());
    info!(url = %request.url, category, "Community submission");

    let submission = state.queue.submit(JobTarget::Seed {
        url: request.url,
        category,
    });
    Json(submission).into_response()
}

/// POST /api/update: enqueue a re-crawl for every stale corpus file.
pub async fn trigger_update(Extension(state): Extension<AppState>) -> Response {
    let stale = match state
        .storage
        .find_stale(Duration::days(state.stale_after_days))
    {
        Ok(stale) => stale,
        Err(err) => {
            // A scan failure is a storage problem, not a client error; report
            // zero queued rather than failing the request.
            warn!(error = %err, "Stale scan failed");
            return Json(json!({ "queued": 0 })).into_response();
        }
    };

    let queued = stale.len();
    for entry in stale {
        info!(file = %entry.file, url = %entry.url, "Queueing re-crawl");
        state.queue.submit(JobTarget::Seed {
            url: entry.url,
            category: "update".to_string(),
        });
    }
    Json(json!({ "queued": queued })).into_response()
}

/// GET /api/status: active jobs and waiting tickets.
pub async fn status(Extension(state): Extension<AppState>) -> Response {
    Json(state.queue.status_snapshot()).into_response()
}

/// GET /api/cities: index of available corpus files.
pub async fn cities(Extension(state): Extension<AppState>) -> Response {
    let files = state.storage.list_files().unwrap_or_else(|err| {
        warn!(error = %err, "Failed to list corpus files");
        Vec::new()
    });
    Json(files).into_response()
}

/// GET /api/stats: aggregate counts over the persisted corpus.
pub async fn stats(Extension(state): Extension<AppState>) -> Response {
    let corpus = state.storage.stats().unwrap_or_else(|err| {
        warn!(error = %err, "Failed to compute corpus stats");
        crate::storage::CorpusStats {
            total_pages: 0,
            file_count: 0,
        }
    });
    Json(json!({
        "total_pages": corpus.total_pages,
        "active_crawlers": state.queue.active_count(),
    }))
    .into_response()
}
