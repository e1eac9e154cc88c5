//! HTTP control API.
//!
//! Every mutating route is turned into a `Command` and handed to the
//! controller loop; the reply is the session snapshot taken after the loop
//! acknowledged the command.

use std::sync::Arc;

use airwave_proto::protocol::{Band, Command, SessionState, Station};
use airwave_proto::state::SessionStore;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::core::DaemonEvent;

#[derive(Clone)]
struct HttpState {
    store: Arc<SessionStore>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult = Result<Json<SessionState>, ApiError>;

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

pub fn router(store: Arc<SessionStore>, event_tx: mpsc::Sender<DaemonEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/stations", get(get_stations))
        .route("/api/select/:idx", get(select_station).post(select_station))
        .route("/api/toggle", get(toggle).post(toggle))
        .route("/api/reload", get(reload).post(reload))
        .route("/api/volume/:percent", get(set_volume).post(set_volume))
        .route("/api/mute", get(toggle_mute).post(toggle_mute))
        .route("/api/eq/enabled/:on", get(set_equalizer).post(set_equalizer))
        .route("/api/eq/:band/:db", get(set_band).post(set_band))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { store, event_tx })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    store: Arc<SessionStore>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP API {}: {}", addr, e);
                return;
            }
        };
        info!("HTTP API listening at http://{}", addr);

        if let Err(e) = axum::serve(listener, router(store, event_tx)).await {
            error!("HTTP API stopped: {}", e);
        }
    })
}

/// Forward `cmd` to the controller and wait until it has been applied.
async fn dispatch(api: &HttpState, cmd: Command) -> ApiResult {
    let (ack_tx, ack_rx) = oneshot::channel();
    let gone = || {
        warn!("HTTP API: controller loop is not running");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "playback controller is not running",
        )
    };

    api.event_tx
        .send(DaemonEvent::ClientCommand(cmd, Some(ack_tx)))
        .await
        .map_err(|_| gone())?;
    ack_rx.await.map_err(|_| gone())?;

    Ok(Json(api.store.get_state().await))
}

async fn get_state(State(api): State<HttpState>) -> Json<SessionState> {
    Json(api.store.get_state().await)
}

async fn get_stations(State(api): State<HttpState>) -> Json<Vec<Station>> {
    Json(api.store.get_state().await.stations)
}

async fn select_station(State(api): State<HttpState>, Path(idx): Path<usize>) -> ApiResult {
    if api.store.station(idx).await.is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no station at index {}", idx),
        ));
    }
    dispatch(&api, Command::SelectStation { station_idx: idx }).await
}

async fn toggle(State(api): State<HttpState>) -> ApiResult {
    dispatch(&api, Command::TogglePlay).await
}

async fn reload(State(api): State<HttpState>) -> ApiResult {
    dispatch(&api, Command::Reload).await
}

async fn set_volume(State(api): State<HttpState>, Path(percent): Path<u32>) -> ApiResult {
    let value = percent.min(100) as f32 / 100.0;
    dispatch(&api, Command::Volume { value }).await
}

async fn toggle_mute(State(api): State<HttpState>) -> ApiResult {
    dispatch(&api, Command::ToggleMute).await
}

async fn set_band(State(api): State<HttpState>, Path((band, db)): Path<(String, f32)>) -> ApiResult {
    let band: Band = band
        .parse()
        .map_err(|e: anyhow::Error| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    dispatch(&api, Command::SetBand { band, db }).await
}

async fn set_equalizer(State(api): State<HttpState>, Path(on): Path<bool>) -> ApiResult {
    dispatch(&api, Command::SetEqualizer { enabled: on }).await
}
