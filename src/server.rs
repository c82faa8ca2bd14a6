use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, anyhow};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use duckdb::Connection;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::analytics;
use crate::cli::ServeArgs;
use crate::index::facilities::{self, FacilityEngine};
use crate::response::{self, ApiError};
use crate::storage::{StoragePaths, file_present_nonempty};

// Cache-control tiers in seconds; the store only changes via bulk import.
const CACHE_SHORT: u32 = 300;
const CACHE_MEDIUM: u32 = 1800;
const CACHE_LONG: u32 = 3600;

const DEFAULT_CITY_LIMIT: i64 = 10;
const DEFAULT_OFFICIALS_LIMIT: i64 = 10;
const DEFAULT_SEARCH_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    facilities: Arc<FacilityEngine>,
    started: Instant,
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    if !file_present_nonempty(&paths.duckdb_path) {
        return Err(anyhow!(
            "DuckDB not found at {}. Run: trials-backend import",
            paths.duckdb_path.display()
        ));
    }
    if !facilities::index_complete(&paths.facility_index_dir) {
        return Err(anyhow!(
            "Facility index not found at {}. Run: trials-backend import",
            paths.facility_index_dir.display()
        ));
    }

    let conn = Connection::open(&paths.duckdb_path)
        .with_context(|| format!("open duckdb at {}", paths.duckdb_path.display()))?;
    let facilities =
        FacilityEngine::open(&paths.facility_index_dir).context("open facility index")?;

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        facilities: Arc::new(facilities),
        started: Instant::now(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/api", get(api_info))
        .route("/api/analytics/locations", get(api_locations))
        .route("/api/analytics/demographics", get(api_demographics))
        .route("/api/analytics/trials-per-city", get(api_trials_per_city))
        .route("/api/analytics/officials", get(api_officials))
        .route("/api/analytics/summary", get(api_summary))
        .route("/api/analytics/trials-by-year", get(api_trials_by_year))
        .route("/api/analytics/search", get(api_search))
        .fallback(not_found)
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(st): State<AppState>) -> Response {
    response::success(
        json!({ "uptimeSecs": st.started.elapsed().as_secs() }),
        "Server is healthy",
    )
}

async fn api_info() -> Response {
    response::success(
        json!({
            "analytics": {
                "locations": "GET /api/analytics/locations",
                "demographics": "GET /api/analytics/demographics",
                "trialsPerCity": "GET /api/analytics/trials-per-city?limit=10",
                "officials": "GET /api/analytics/officials?page=1&limit=10",
                "summary": "GET /api/analytics/summary",
                "trialsByYear": "GET /api/analytics/trials-by-year?year=2020",
                "search": "GET /api/analytics/search?q=hospital&limit=20",
            }
        }),
        "Clinical Trial Analytics API",
    )
}

async fn not_found() -> ApiError {
    ApiError::not_found("Route not found")
}

async fn api_locations(State(st): State<AppState>) -> Result<Response, ApiError> {
    let db = st.db.lock().await;
    let data = analytics::location_distribution(&db).map_err(ApiError::internal)?;
    Ok(response::success_cached(
        data,
        "Location distribution retrieved successfully",
        CACHE_MEDIUM,
    ))
}

async fn api_demographics(State(st): State<AppState>) -> Result<Response, ApiError> {
    let db = st.db.lock().await;
    let data = analytics::demographics(&db).map_err(ApiError::internal)?;
    Ok(response::success_cached(
        data,
        "Demographics retrieved successfully",
        CACHE_MEDIUM,
    ))
}

#[derive(Debug, Deserialize)]
struct CityParams {
    limit: Option<String>,
}

async fn api_trials_per_city(
    State(st): State<AppState>,
    Query(p): Query<CityParams>,
) -> Result<Response, ApiError> {
    let limit = parse_limit(p.limit.as_deref(), DEFAULT_CITY_LIMIT)?;
    let db = st.db.lock().await;
    let data = analytics::trials_per_city(&db, limit).map_err(ApiError::internal)?;
    Ok(response::success_cached(
        data,
        "Trials per city retrieved successfully",
        CACHE_MEDIUM,
    ))
}

#[derive(Debug, Deserialize)]
struct OfficialsParams {
    page: Option<String>,
    limit: Option<String>,
}

async fn api_officials(
    State(st): State<AppState>,
    Query(p): Query<OfficialsParams>,
) -> Result<Response, ApiError> {
    let page = parse_page(p.page.as_deref())?;
    let limit = parse_limit(p.limit.as_deref(), DEFAULT_OFFICIALS_LIMIT)?;
    let db = st.db.lock().await;
    let data = analytics::officials(&db, page, limit).map_err(ApiError::internal)?;
    Ok(response::success_cached(
        data,
        "Officials retrieved successfully",
        CACHE_LONG,
    ))
}

async fn api_summary(State(st): State<AppState>) -> Result<Response, ApiError> {
    let db = st.db.lock().await;
    let data = analytics::summary_stats(&db).map_err(ApiError::internal)?;
    Ok(response::success_cached(
        data,
        "Summary statistics retrieved successfully",
        CACHE_SHORT,
    ))
}

#[derive(Debug, Deserialize)]
struct YearParams {
    year: Option<String>,
}

async fn api_trials_by_year(
    State(st): State<AppState>,
    Query(p): Query<YearParams>,
) -> Result<Response, ApiError> {
    let year = parse_year(p.year.as_deref())?;
    let db = st.db.lock().await;
    let data = analytics::trials_by_year(&db, year).map_err(ApiError::internal)?;
    Ok(response::success_cached(
        data,
        "Trials by year retrieved successfully",
        CACHE_SHORT,
    ))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<String>,
}

async fn api_search(
    State(st): State<AppState>,
    Query(p): Query<SearchParams>,
) -> Result<Response, ApiError> {
    let term = p.q.as_deref().map(str::trim).unwrap_or("");
    if term.is_empty() {
        return Err(ApiError::bad_request("Search query is required"));
    }
    let limit = parse_limit(p.limit.as_deref(), DEFAULT_SEARCH_LIMIT)?;

    let ids = st
        .facilities
        .search(term, limit as usize)
        .map_err(ApiError::internal)?;
    let db = st.db.lock().await;
    let data = analytics::trials_by_ids(&db, &ids).map_err(ApiError::internal)?;
    Ok(response::success(
        data,
        "Search results retrieved successfully",
    ))
}

fn parse_int_param(raw: Option<&str>, name: &str) -> Result<Option<i64>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("{name} must be an integer"))),
    }
}

fn parse_limit(raw: Option<&str>, default: i64) -> Result<i64, ApiError> {
    let limit = parse_int_param(raw, "Limit")?.unwrap_or(default);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::bad_request("Limit must be between 1 and 100"));
    }
    Ok(limit)
}

fn parse_page(raw: Option<&str>) -> Result<i64, ApiError> {
    let page = parse_int_param(raw, "Page")?.unwrap_or(1);
    if page < 1 {
        return Err(ApiError::bad_request("Page must be greater than 0"));
    }
    Ok(page)
}

fn parse_year(raw: Option<&str>) -> Result<Option<i64>, ApiError> {
    let Some(year) =
        parse_int_param(raw, "Year").map_err(|_| ApiError::bad_request("Invalid year parameter"))?
    else {
        return Ok(None);
    };
    if !(1900..=current_year_approx() + 10).contains(&year) {
        return Err(ApiError::bad_request("Invalid year parameter"));
    }
    Ok(Some(year))
}

fn current_year_approx() -> i64 {
    // 365.25-day years since 1970; exact rollover doesn't matter for the
    // +10-year validation bound.
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    1970 + secs / 31_557_600
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn limit_defaults_and_bounds() {
        assert_eq!(parse_limit(None, 10).unwrap(), 10);
        assert_eq!(parse_limit(Some("25"), 10).unwrap(), 25);
        assert_eq!(parse_limit(Some("1"), 10).unwrap(), 1);
        assert_eq!(parse_limit(Some("100"), 10).unwrap(), 100);

        for bad in ["0", "101", "-5"] {
            let err = parse_limit(Some(bad), 10).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
            assert_eq!(err.message(), "Limit must be between 1 and 100");
        }
        assert!(parse_limit(Some("abc"), 10).is_err());
    }

    #[test]
    fn page_defaults_and_bounds() {
        assert_eq!(parse_page(None).unwrap(), 1);
        assert_eq!(parse_page(Some("3")).unwrap(), 3);
        let err = parse_page(Some("0")).unwrap_err();
        assert_eq!(err.message(), "Page must be greater than 0");
        assert!(parse_page(Some("x")).is_err());
    }

    #[test]
    fn year_is_optional_but_bounded() {
        assert_eq!(parse_year(None).unwrap(), None);
        assert_eq!(parse_year(Some("")).unwrap(), None);
        assert_eq!(parse_year(Some("2020")).unwrap(), Some(2020));

        for bad in ["1800", "9999", "twenty"] {
            let err = parse_year(Some(bad)).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
            assert_eq!(err.message(), "Invalid year parameter");
        }
    }

    #[test]
    fn blank_params_fall_back_to_defaults() {
        assert_eq!(parse_limit(Some("  "), 20).unwrap(), 20);
        assert_eq!(parse_page(Some("")).unwrap(), 1);
    }
}
