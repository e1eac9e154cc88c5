use crate::protocol::{Band, PlaybackStatus, SessionState, Station};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, read-mostly view of the playback session.
///
/// The controller is the only writer; the HTTP API and the socket server read
/// snapshots.  Nothing here touches disk: preferences live for the lifetime of
/// the process only.
pub struct SessionStore {
    state: Arc<RwLock<SessionState>>,
}

impl SessionStore {
    pub fn new(stations: Vec<Station>, volume: f32) -> Self {
        let state = SessionState {
            rev: 1,
            stations,
            volume: volume.clamp(0.0, 1.0),
            muted: volume <= 0.0,
            ..SessionState::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn get_state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn station(&self, idx: usize) -> Option<Station> {
        self.state.read().await.stations.get(idx).cloned()
    }

    /// A new station was selected: optimistic playing + loading.
    pub async fn set_selected(&self, idx: usize) {
        let mut state = self.state.write().await;
        state.active_station_name = state.stations.get(idx).map(|s| s.name.clone());
        state.active_station = Some(idx);
        state.status = PlaybackStatus::Loading;
        state.is_playing = true;
        state.is_loading = true;
        state.now_playing = None; // clear text from the previous station
        state.last_error = None;
        state.rev += 1;
    }

    /// Re-buffering the active station (reload, or retry after a failure).
    pub async fn set_loading(&self, optimistic_playing: bool) {
        let mut state = self.state.write().await;
        state.status = PlaybackStatus::Loading;
        state.is_playing = optimistic_playing;
        state.is_loading = true;
        state.last_error = None;
        state.rev += 1;
    }

    pub async fn set_playback_status(&self, status: PlaybackStatus) {
        let mut state = self.state.write().await;
        state.is_playing = matches!(status, PlaybackStatus::Playing | PlaybackStatus::Loading);
        state.is_loading = status == PlaybackStatus::Loading;
        state.status = status;
        state.rev += 1;
    }

    pub async fn set_failed(&self, reason: String) {
        let mut state = self.state.write().await;
        state.status = PlaybackStatus::Failed;
        state.is_playing = false;
        state.is_loading = false;
        state.last_error = Some(reason);
        state.rev += 1;
    }

    pub async fn set_volume(&self, volume: f32, muted: bool) {
        let mut state = self.state.write().await;
        state.volume = volume.clamp(0.0, 1.0);
        state.muted = muted;
        state.rev += 1;
    }

    pub async fn set_now_playing(&self, text: Option<String>) {
        let mut state = self.state.write().await;
        state.now_playing = text;
        state.rev += 1;
    }

    pub async fn set_band_gain(&self, band: Band, db: f32) {
        let mut state = self.state.write().await;
        state.equalizer.set_gain(band, db);
        state.rev += 1;
    }

    pub async fn set_equalizer_enabled(&self, enabled: bool) {
        let mut state = self.state.write().await;
        state.equalizer.enabled = enabled;
        state.rev += 1;
    }

    pub async fn set_preloaded(&self) {
        let mut state = self.state.write().await;
        state.preloaded = true;
        state.rev += 1;
    }
}
