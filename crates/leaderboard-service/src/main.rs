use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use leaderboard_core::{
    Player, PlayerStore, SharedStore, StoreError, XpHistoryEntry, DEFAULT_HISTORY_LIMIT,
};
use leaderboard_monitor::{HiscoreRankingSource, Scheduler, DEFAULT_RANKING_URL};
use leaderboard_store_sqlite::SqlitePlayerStore;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct ApiState {
    store: SharedStore<SqlitePlayerStore>,
    operation_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "leaderboard-service")]
#[command(about = "Tracks the top of the hiscores and serves it over HTTP")]
struct Args {
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,
    /// Poll interval in minutes.
    #[arg(
        long,
        env = "UPDATE_INTERVAL",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    update_interval: u64,
    #[arg(long, env = "DB_PATH", default_value = "./data/leaderboard.db")]
    db_path: PathBuf,
    #[arg(long, env = "RANKING_URL", default_value = DEFAULT_RANKING_URL)]
    ranking_url: String,
    #[arg(
        long,
        env = "RANKING_SIZE",
        default_value_t = 50,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    ranking_size: u16,
    #[arg(long, env = "FETCH_TIMEOUT_MS", default_value_t = 10_000)]
    fetch_timeout_ms: u64,
    #[arg(long, env = "OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ListEnvelope<T>
where
    T: Serialize,
{
    success: bool,
    count: usize,
    data: Vec<T>,
}

#[derive(Debug, Clone, Serialize)]
struct PlayerEnvelope {
    success: bool,
    data: Player,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerSummary {
    name: String,
    current_rank: i64,
    current_xp: i64,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryEnvelope {
    success: bool,
    player: PlayerSummary,
    count: usize,
    data: Vec<XpHistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HistoryParams {
    limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ApiFailure {
    NotFound,
    Internal,
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "Player not found"),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };
        (status, Json(ErrorEnvelope { success: false, error })).into_response()
    }
}

impl ApiState {
    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ApiFailure>
    where
        T: Send + 'static,
        F: FnOnce(&SqlitePlayerStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        let handle = tokio::task::spawn_blocking(move || store.with(|store| op(store)));
        let join_result = tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
            tracing::error!(
                operation = operation_label,
                timeout_ms = u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX),
                "store operation timed out"
            );
            ApiFailure::Internal
        })?;

        let op_result = join_result.map_err(|err| {
            tracing::error!(operation = operation_label, error = %err, "store operation join failure");
            ApiFailure::Internal
        })?;

        op_result.map_err(|err| {
            tracing::error!(operation = operation_label, error = %err, "store operation failed");
            ApiFailure::Internal
        })
    }
}

/// Accepts only positive integers; anything else means the default.
fn history_limit(raw: Option<&str>) -> usize {
    raw.and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
}

fn app(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/players", get(list_players))
        .route("/api/players/:name", get(show_player))
        .route("/api/players/:name/history", get(player_history))
        .with_state(state)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.log_format);

    let store = SqlitePlayerStore::open(&args.db_path)
        .with_context(|| format!("failed to open database at {}", args.db_path.display()))?;
    tracing::info!(path = %args.db_path.display(), "database initialized");
    let store = SharedStore::new(store);

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let source = Arc::new(HiscoreRankingSource::new(
        args.ranking_url,
        usize::from(args.ranking_size),
        Duration::from_millis(args.fetch_timeout_ms),
    ));
    let scheduler = Scheduler::start_minutes(store.clone(), source, args.update_interval);

    let state = ApiState { store, operation_timeout: Duration::from_millis(args.operation_timeout_ms) };
    tracing::info!(%addr, "leaderboard API listening");
    let served = axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await;

    scheduler.stop().await.context("failed to close leaderboard store")?;
    served.context("HTTP server failed")?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received, draining requests");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn list_players(
    State(state): State<ApiState>,
) -> Result<Json<ListEnvelope<Player>>, ApiFailure> {
    let players = state.run_blocking("get_active_players", |store| store.get_active_players()).await?;
    Ok(Json(ListEnvelope { success: true, count: players.len(), data: players }))
}

async fn show_player(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<PlayerEnvelope>, ApiFailure> {
    let player = state
        .run_blocking("get_player", move |store| store.get_player(&name))
        .await?
        .ok_or(ApiFailure::NotFound)?;
    Ok(Json(PlayerEnvelope { success: true, data: player }))
}

async fn player_history(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryEnvelope>, ApiFailure> {
    let limit = history_limit(params.limit.as_deref());
    let found = state
        .run_blocking("get_player_history", move |store| {
            let Some(player) = store.get_player(&name)? else {
                return Ok(None);
            };
            let history = store.get_player_history(player.id, limit)?;
            Ok(Some((player, history)))
        })
        .await?;
    let (player, history) = found.ok_or(ApiFailure::NotFound)?;

    Ok(Json(HistoryEnvelope {
        success: true,
        player: PlayerSummary { name: player.name, current_rank: player.rank, current_xp: player.xp },
        count: history.len(),
        data: history,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use leaderboard_core::{PlayerUpsert, RankingEntry};
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("leaderboard-service-{}", ulid::Ulid::new()))
            .join("leaderboard.db")
    }

    fn test_state(timeout_ms: u64) -> (ApiState, PathBuf) {
        let db_path = unique_temp_db_path();
        let store = match SqlitePlayerStore::open(&db_path) {
            Ok(store) => store,
            Err(err) => panic!("failed to open test store: {err}"),
        };
        let state = ApiState {
            store: SharedStore::new(store),
            operation_timeout: Duration::from_millis(timeout_ms),
        };
        (state, db_path)
    }

    fn cleanup(db_path: &std::path::Path) {
        if let Some(dir) = db_path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    fn observe(state: &ApiState, rank: i64, name: &str, xp: i64, at: i64) {
        let entry = RankingEntry { rank, name: name.to_string(), level: 2277, xp };
        let result = state.store.with(|store| {
            let first_seen = store.get_player(name)?.map_or(at, |player| player.first_seen);
            store.record_observation(&PlayerUpsert::observed(&entry, first_seen, at), true)
        });
        if let Err(err) = result {
            panic!("failed to seed {name}: {err}");
        }
    }

    async fn get(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    #[test]
    fn history_limit_falls_back_for_non_positive_values() {
        assert_eq!(history_limit(None), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history_limit(Some("abc")), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history_limit(Some("0")), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history_limit(Some("-5")), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history_limit(Some("7")), 7);
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (state, db_path) = test_state(2500);

        let response = get(app(state), "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!({"status": "ok"}));

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn players_endpoint_lists_active_players_by_rank() {
        let (state, db_path) = test_state(2500);
        observe(&state, 2, "B", 200, 1_000);
        observe(&state, 1, "A", 300, 1_000);
        observe(&state, 3, "C", 100, 1_000);
        if let Err(err) = state.store.with(|store| store.deactivate_player("C")) {
            panic!("failed to deactivate: {err}");
        }

        let value = response_json(get(app(state), "/api/players").await).await;

        assert_eq!(value["success"], true);
        assert_eq!(value["count"], 2);
        assert_eq!(value["data"][0]["name"], "A");
        assert_eq!(value["data"][1]["name"], "B");
        assert_eq!(value["data"][0]["isActive"], true);
        assert_eq!(value["data"][0]["firstSeen"], 1_000);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn players_endpoint_returns_empty_list() {
        let (state, db_path) = test_state(2500);

        let value = response_json(get(app(state), "/api/players").await).await;

        assert_eq!(value, serde_json::json!({"success": true, "count": 0, "data": []}));
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn unknown_player_returns_not_found() {
        let (state, db_path) = test_state(2500);

        let response = get(app(state), "/api/players/Unknown").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response_json(response).await,
            serde_json::json!({"success": false, "error": "Player not found"})
        );

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn inactive_player_is_still_served() {
        let (state, db_path) = test_state(2500);
        observe(&state, 4, "Iron Lad", 4_000, 1_000);
        if let Err(err) = state.store.with(|store| store.deactivate_player("Iron Lad")) {
            panic!("failed to deactivate: {err}");
        }

        let response = get(app(state), "/api/players/Iron%20Lad").await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["name"], "Iron Lad");
        assert_eq!(value["data"]["isActive"], false);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn history_endpoint_returns_newest_first_with_summary() {
        let (state, db_path) = test_state(2500);
        observe(&state, 1, "A", 100, 1_000);
        observe(&state, 1, "A", 150, 2_000);

        let response = get(app(state), "/api/players/A/history").await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;

        assert_eq!(value["success"], true);
        assert_eq!(
            value["player"],
            serde_json::json!({"name": "A", "currentRank": 1, "currentXp": 150})
        );
        assert_eq!(value["count"], 2);
        assert_eq!(value["data"][0]["xp"], 150);
        assert_eq!(value["data"][1]["xp"], 100);
        assert_eq!(value["data"][0]["timestamp"], 2_000);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn history_endpoint_honours_limit() {
        let (state, db_path) = test_state(2500);
        for step in 1..=5 {
            observe(&state, 1, "A", step * 100, step * 1_000);
        }
        let router = app(state);

        let limited = response_json(get(router.clone(), "/api/players/A/history?limit=2").await).await;
        assert_eq!(limited["count"], 2);
        assert_eq!(limited["data"][0]["xp"], 500);

        let fallback = response_json(get(router, "/api/players/A/history?limit=zero").await).await;
        assert_eq!(fallback["count"], 5);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn history_for_unknown_player_returns_not_found() {
        let (state, db_path) = test_state(2500);

        let response = get(app(state), "/api/players/Nobody/history").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response_json(response).await["error"], "Player not found");

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn store_failure_maps_to_internal_server_error() {
        let (state, db_path) = test_state(2500);
        if let Err(err) = state.store.close() {
            panic!("failed to close store: {err}");
        }

        let response = get(app(state), "/api/players").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response_json(response).await,
            serde_json::json!({"success": false, "error": "Internal server error"})
        );

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn run_blocking_times_out_as_internal_error() {
        let (state, db_path) = test_state(1);

        let result = state
            .run_blocking("slow_operation", |_store| {
                std::thread::sleep(Duration::from_millis(25));
                Ok(())
            })
            .await;

        assert_eq!(result, Err(ApiFailure::Internal));
        cleanup(&db_path);
    }
}
