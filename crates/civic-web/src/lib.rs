//! JSON HTTP surface for ingestion control and the aggregation queries.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use civic_core::{
    parse_filter_timestamp, parse_years_csv, CountField, DateBound, RequestFilter, TtcGroupBy,
    ValidationError,
};
use civic_query::{FrequencyQuery, QueryError, QueryService};
use civic_sync::{IngestEngine, IngestError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "civic-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<IngestEngine>,
    pub queries: QueryService,
}

impl AppState {
    pub fn new(engine: Arc<IngestEngine>, queries: QueryService) -> Self {
        Self { engine, queries }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Validation(err) => err.into(),
            QueryError::NotFound(_) => Self::NotFound(err.to_string()),
            QueryError::Store(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(err) => err.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Internal(message) => {
                error!(error = %message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("invalid JSON body: {err}")))
}

fn parse_number<T: std::str::FromStr>(
    name: &'static str,
    raw: Option<&str>,
) -> Result<Option<T>, ValidationError> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ValidationError::InvalidParameter {
                name,
                value: value.to_string(),
            }),
    }
}

fn parse_bool(
    name: &'static str,
    raw: Option<&str>,
    default: bool,
) -> Result<bool, ValidationError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(default),
        Some("true" | "True" | "1") => Ok(true),
        Some("false" | "False" | "0") => Ok(false),
        Some(other) => Err(ValidationError::InvalidParameter {
            name,
            value: other.to_string(),
        }),
    }
}

fn parse_date(
    raw: Option<&str>,
    bound: DateBound,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| parse_filter_timestamp(v, bound))
        .transpose()
}

/// Filter fields shared by the POST query bodies.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FilterBody {
    start_date: Option<String>,
    end_date: Option<String>,
    nc_list: Vec<String>,
    request_types: Vec<String>,
}

impl FilterBody {
    fn into_filter(self) -> Result<RequestFilter, ValidationError> {
        let filter = RequestFilter {
            start_date: parse_date(self.start_date.as_deref(), DateBound::Start)?,
            end_date: parse_date(self.end_date.as_deref(), DateBound::End)?,
            nc_list: self.nc_list,
            request_types: self.request_types,
        };
        filter.validate()?;
        Ok(filter)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeToCloseBody {
    #[serde(flatten)]
    filter: FilterBody,
    #[serde(default)]
    group_by: TtcGroupBy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestCountsBody {
    #[serde(flatten)]
    filter: FilterBody,
    #[serde(default)]
    count_fields: Vec<String>,
}

fn default_pins_start() -> Option<String> {
    Some("2015-01-01".to_string())
}

fn default_pins_end() -> Option<String> {
    Some("2015-12-31 01:01:01".to_string())
}

fn default_pins_councils() -> Vec<String> {
    vec!["SHERMAN OAKS NC".to_string()]
}

fn default_pins_types() -> Vec<String> {
    vec!["Bulky Items".to_string()]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinsBody {
    #[serde(default = "default_pins_start")]
    start_date: Option<String>,
    #[serde(default = "default_pins_end")]
    end_date: Option<String>,
    #[serde(default = "default_pins_councils")]
    nc_list: Vec<String>,
    #[serde(default = "default_pins_types")]
    request_types: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestParams {
    years: Option<String>,
    query_size: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrequencyParams {
    service: Option<String>,
    councils: Option<String>,
    aggregate: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ingest", post(ingest_handler))
        .route("/update", get(update_handler))
        .route("/delete", get(delete_handler))
        .route("/timetoclose", post(time_to_close_handler))
        .route("/requestfrequency", get(frequency_handler))
        .route("/pins", post(pins_handler))
        .route("/requestcounts", post(request_counts_handler))
        .route("/servicerequest/{srnumber}", get(service_request_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IngestParams>,
) -> ApiResult {
    let years = parse_years_csv(params.years.as_deref().unwrap_or_default())?;
    let query_size = parse_number::<usize>("querySize", params.query_size.as_deref())?;
    let limit = parse_number::<u64>("limit", params.limit.as_deref())?;
    let report = state
        .engine
        .populate_full_database(&years, query_size, limit)
        .await?;
    Ok(Json(report).into_response())
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IngestParams>,
) -> ApiResult {
    let query_size = parse_number::<usize>("querySize", params.query_size.as_deref())?;
    let limit = parse_number::<u64>("limit", params.limit.as_deref())?;
    let report = state
        .engine
        .update_at(Utc::now(), query_size, limit)
        .await?;
    Ok(Json(report).into_response())
}

async fn delete_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = state.engine.delete().await?;
    Ok(Json(report).into_response())
}

async fn time_to_close_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let body: TimeToCloseBody = parse_body(&body)?;
    let filter = body.filter.into_filter()?;
    let report = state.queries.time_to_close(&filter, body.group_by).await?;
    Ok(Json(report).into_response())
}

async fn frequency_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FrequencyParams>,
) -> ApiResult {
    let query = FrequencyQuery {
        service: parse_bool("service", params.service.as_deref(), true)?,
        aggregate: parse_bool("aggregate", params.aggregate.as_deref(), true)?,
        councils: params
            .councils
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
        start_date: parse_date(params.start_date.as_deref(), DateBound::Start)?,
        end_date: parse_date(params.end_date.as_deref(), DateBound::End)?,
    };
    let report = state.queries.frequency(&query).await?;
    Ok(Json(report).into_response())
}

async fn pins_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let body: PinsBody = parse_body(&body)?;
    let filter = FilterBody {
        start_date: body.start_date,
        end_date: body.end_date,
        nc_list: body.nc_list,
        request_types: body.request_types,
    }
    .into_filter()?;
    let pins = state.queries.base_pins(&filter).await?;
    Ok(Json(pins).into_response())
}

async fn request_counts_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let body: RequestCountsBody = parse_body(&body)?;
    let fields = body
        .count_fields
        .iter()
        .map(|f| CountField::parse(f))
        .collect::<Result<Vec<_>, _>>()?;
    let filter = body.filter.into_filter()?;
    let report = state.queries.request_counts(&filter, &fields).await?;
    Ok(Json(report).into_response())
}

async fn service_request_handler(
    State(state): State<Arc<AppState>>,
    Path(sr_number): Path<String>,
) -> ApiResult {
    let request = state.queries.request_detail(&sr_number).await?;
    Ok(Json(request).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::TimeZone;
    use civic_adapters::MemorySource;
    use civic_core::{RequestType, ServiceRequest};
    use civic_storage::MemoryStore;
    use civic_sync::IngestOptions;
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    fn seeded_request(sr: &str, year: i32, closed_after_hours: Option<i64>) -> ServiceRequest {
        let created_date = Utc.with_ymd_and_hms(year, 6, 1, 8, 0, 0).unwrap();
        ServiceRequest {
            sr_number: sr.to_string(),
            created_date,
            updated_date: None,
            closed_date: closed_after_hours.map(|h| created_date + chrono::Duration::hours(h)),
            request_type: RequestType::BulkyItems,
            status: Some("Closed".into()),
            request_source: Some("Mobile App".into()),
            nc: Some(52),
            nc_name: Some("SHERMAN OAKS NC".into()),
            cd: Some(4),
            address: None,
            latitude: Some(34.15),
            longitude: Some(-118.44),
            police_precinct: None,
            action_taken: None,
            owner: None,
        }
    }

    struct Harness {
        app: Router,
        source: Arc<MemorySource>,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::with_requests([
            seeded_request("1-2015", 2015, Some(48)),
            seeded_request("1-2019", 2019, None),
        ]));
        let source = Arc::new(MemorySource::new(vec![json!({
            "srnumber": "1-NEW",
            "createddate": "2019-02-01T00:00:00.000",
            "requesttype": "Graffiti Removal",
        })]));
        let engine = Arc::new(IngestEngine::new(
            source.clone(),
            store.clone(),
            IngestOptions::default(),
        ));
        let state = AppState::new(engine, QueryService::new(store.clone()));
        Harness {
            app: app(state),
            source,
            store,
        }
    }

    async fn send(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn liveness_route_answers() {
        let (status, body) = send(harness().app, "GET", "/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn ingest_rejects_bad_years_without_fetching() {
        let h = harness();
        for uri in [
            "/ingest",
            "/ingest?years=2014",
            "/ingest?years=2019,abc",
            "/ingest?years=2019&querySize=x",
        ] {
            let (status, body) = send(h.app.clone(), "POST", uri, "").await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(body["error"].is_string());
        }
        assert_eq!(h.source.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn ingest_reports_per_year() {
        let h = harness();
        let (status, body) = send(h.app, "POST", "/ingest?years=2019&querySize=10", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["units"]["year:2019"]["inserted"], 1);
        assert_eq!(body["units"]["year:2019"]["status"], "completed");
        assert_eq!(h.store.len().await, 3);
    }

    #[tokio::test]
    async fn time_to_close_returns_groups() {
        let h = harness();
        let (status, body) = send(
            h.app.clone(),
            "POST",
            "/timetoclose",
            r#"{"startDate":"2015-01-01","endDate":"2020-12-31","ncList":["SHERMAN OAKS NC"],"requestTypes":[]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["groups"]["Bulky Items"]["median"], 2.0);

        let (status, _) = send(h.app, "POST", "/timetoclose", r#"{"startDate":"soon"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn frequency_and_counts() {
        let h = harness();
        let (status, body) = send(h.app.clone(), "GET", "/requestfrequency?aggregate=false", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["counts"]["SHERMAN OAKS NC"]["Bulky Items"], 2);

        let (status, body) = send(
            h.app.clone(),
            "POST",
            "/requestcounts",
            r#"{"countFields":["requestType","cd"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["rows"][0]["keys"], json!(["Bulky Items", "4"]));

        let (status, body) =
            send(h.app, "POST", "/requestcounts", r#"{"countFields":["color"]}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("color"));
    }

    #[tokio::test]
    async fn pins_default_to_the_sample_filter() {
        let h = harness();
        let (status, body) = send(h.app, "POST", "/pins", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{
            "id": "1-2015",
            "lat": 34.15,
            "long": -118.44,
            "type": "Bulky Items",
        }]));
    }

    #[tokio::test]
    async fn service_request_detail_and_not_found() {
        let h = harness();
        let (status, body) = send(h.app.clone(), "GET", "/servicerequest/1-2019", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["srNumber"], "1-2019");
        assert_eq!(body["requestType"], "Bulky Items");

        let (status, body) = send(h.app, "GET", "/servicerequest/9-9", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("9-9"));
    }

    #[tokio::test]
    async fn delete_route_reports_reconciliation() {
        let h = harness();
        let (status, body) = send(h.app, "GET", "/delete", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 0);
    }
}
