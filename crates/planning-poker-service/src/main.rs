use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use planning_poker_api::{
    CastVoteRequest, MigrateResult, PokerApi, RecordVotes, VoteStoreConfig, WriteMode,
    API_CONTRACT_VERSION, DEFAULT_EXTENSION_ID, DEFAULT_FIELD_KEY,
};
use planning_poker_core::{
    EstimateOptions, ParticipantId, RawEstimateOptions, RecordId, TallyReport,
};
use planning_poker_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: PokerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "planning-poker-service")]
#[command(about = "Local HTTP service for planning poker votes")]
struct Args {
    #[arg(long, default_value = "./planning_poker.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value = DEFAULT_EXTENSION_ID)]
    extension_id: String,
    /// Comma separated estimate cards, in rank order.
    #[arg(long, default_value = "0,1,2,3,5,8,13,21")]
    values: String,
    #[arg(long)]
    include_unknown: bool,
    #[arg(long, default_value = "optimistic")]
    write_mode: WriteMode,
    #[arg(long, default_value_t = 5)]
    max_write_attempts: u32,
}

impl Args {
    fn build_api(&self) -> Result<PokerApi> {
        let raw = RawEstimateOptions::from_csv(&self.values, self.include_unknown);
        let options = EstimateOptions::parse(&raw)?;
        let config = VoteStoreConfig {
            extension_id: self.extension_id.clone(),
            field_key: DEFAULT_FIELD_KEY.to_string(),
            write_mode: self.write_mode,
            max_write_attempts: self.max_write_attempts,
        };
        Ok(PokerApi::new(self.db.clone(), options, config))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(err: &anyhow::Error) -> ServiceError {
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: format!("{err:#}"),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/records/:record_id/votes", get(votes_show).post(votes_cast))
        .route(
            "/v1/records/:record_id/votes/:participant_id",
            axum::routing::delete(votes_withdraw),
        )
        .route("/v1/records/:record_id/tally", get(records_tally))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState { api: args.build_api()? };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "planning poker service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = state.api.integrity_check().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(report)))
}

async fn votes_show(
    State(state): State<ServiceState>,
    Path(record_id): Path<String>,
) -> Result<Json<ServiceEnvelope<RecordVotes>>, ServiceError> {
    let votes = state
        .api
        .fetch_votes(&RecordId::new(record_id))
        .await
        .map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(votes)))
}

async fn votes_cast(
    State(state): State<ServiceState>,
    Path(record_id): Path<String>,
    Json(request): Json<CastVoteRequest>,
) -> Result<Json<ServiceEnvelope<RecordVotes>>, ServiceError> {
    let votes = state
        .api
        .cast_vote(&RecordId::new(record_id), request)
        .await
        .map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(votes)))
}

async fn votes_withdraw(
    State(state): State<ServiceState>,
    Path((record_id, participant_id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<RecordVotes>>, ServiceError> {
    let votes = state
        .api
        .withdraw_vote(&RecordId::new(record_id), &ParticipantId::new(participant_id))
        .await
        .map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(votes)))
}

async fn records_tally(
    State(state): State<ServiceState>,
    Path(record_id): Path<String>,
) -> Result<Json<ServiceEnvelope<TallyReport>>, ServiceError> {
    let report = state
        .api
        .tally(&RecordId::new(record_id))
        .await
        .map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("planning-poker-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router(db_path: PathBuf) -> Router {
        let options = EstimateOptions { values: vec![1, 2, 3, 5, 8], include_unknown: true };
        let api = PokerApi::new(db_path, options, VoteStoreConfig::default());
        app(ServiceState { api })
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build {method} {uri} request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("{method} {uri} request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn vote_ids(value: &serde_json::Value) -> Vec<String> {
        value
            .pointer("/data/votes")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing data.votes in response: {value}"))
            .iter()
            .filter_map(|vote| {
                vote.get("id")
                    .or_else(|| vote.pointer("/vote/id"))
                    .and_then(serde_json::Value::as_str)
                    .map(ToString::to_string)
            })
            .collect()
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.pointer("/data/status").and_then(serde_json::Value::as_str), Some("ok"));
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = test_router(unique_temp_db_path());

        let response = send(&router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/records/{record_id}/votes"));
        assert!(body.contains("/v1/records/{record_id}/tally"));
    }

    #[tokio::test]
    async fn db_endpoints_plan_and_apply_migrations() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let planned = response_json(
            send(&router, "POST", "/v1/db/migrate", Some(serde_json::json!({ "dry_run": true })))
                .await,
        )
        .await;
        assert_eq!(planned.pointer("/data/would_apply_versions"), Some(&serde_json::json!([1])));

        let applied = response_json(
            send(&router, "POST", "/v1/db/migrate", Some(serde_json::json!({ "dry_run": false })))
                .await,
        )
        .await;
        assert_eq!(applied.pointer("/data/up_to_date"), Some(&serde_json::json!(true)));

        let status =
            response_json(send(&router, "POST", "/v1/db/schema-version", None).await).await;
        assert_eq!(status.pointer("/data/current_version"), Some(&serde_json::json!(1)));

        let integrity =
            response_json(send(&router, "POST", "/v1/db/integrity-check", None).await).await;
        assert_eq!(integrity.pointer("/data/quick_check_ok"), Some(&serde_json::json!(true)));
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn cast_fetch_withdraw_and_tally_round_trip() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let empty = send(&router, "GET", "/v1/records/REC-1/votes", None).await;
        assert_eq!(empty.status(), StatusCode::OK);
        assert!(vote_ids(&response_json(empty).await).is_empty());

        for (id, name, estimate) in
            [("a1", "A", serde_json::json!(5)), ("b2", "B", serde_json::Value::Null)]
        {
            let payload = serde_json::json!({
                "participant": { "id": id, "name": name, "avatar_url": "" },
                "estimate": estimate
            });
            let response = send(&router, "POST", "/v1/records/REC-1/votes", Some(payload)).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let tally =
            response_json(send(&router, "GET", "/v1/records/REC-1/tally", None).await).await;
        assert_eq!(tally.pointer("/data/summary/total_votes"), Some(&serde_json::json!(2)));
        assert_eq!(tally.pointer("/data/summary/numeric_count"), Some(&serde_json::json!(1)));
        assert_eq!(tally.pointer("/data/summary/min"), Some(&serde_json::json!(5)));
        assert_eq!(tally.pointer("/data/rounded_average"), Some(&serde_json::json!(5.0)));
        assert_eq!(vote_ids(&tally), vec!["a1".to_string(), "b2".to_string()]);
        assert_eq!(tally.pointer("/data/votes/1/vote/unknown"), Some(&serde_json::json!(true)));

        let withdrawn =
            response_json(send(&router, "DELETE", "/v1/records/REC-1/votes/a1", None).await).await;
        assert_eq!(vote_ids(&withdrawn), vec!["b2".to_string()]);

        let fetched =
            response_json(send(&router, "GET", "/v1/records/REC-1/votes", None).await).await;
        assert_eq!(vote_ids(&fetched), vec!["b2".to_string()]);
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn unconfigured_estimate_returns_service_error() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let payload = serde_json::json!({
            "participant": { "id": "a1", "name": "A", "avatar_url": "" },
            "estimate": 13
        });
        let response = send(&router, "POST", "/v1/records/REC-1/votes", Some(payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        let error = value.get("error").and_then(serde_json::Value::as_str).unwrap_or_default();
        assert!(error.contains("not one of the configured values"), "{error}");
        cleanup(&db_path);
    }
}
