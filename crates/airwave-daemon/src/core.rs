//! PlaybackController: single-owner event loop for playback.
//!
//! All inputs funnel into `run`: UI commands and the bandwidth estimate via
//! `DaemonEvent`, stream ready/failed signals from the decoders, and
//! now-playing updates from the metadata poller.  The controller exclusively
//! owns the source registry, the signal graph handle and the poller; the
//! `SessionStore` is the read-only view it publishes for UI clients.
//!
//! Async completions are never trusted blindly.  Stream signals carry the op
//! id of the load they belong to and are dropped unless that op is still the
//! handle's latest; they only drive playback when their station is still the
//! selected one.  Metadata updates are applied only while the poller is still
//! bound to their URL.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use airwave_proto::config::Config;
use airwave_proto::protocol::{clamp_band_gain, Band, Command, EqualizerState, PlaybackStatus, Station};
use airwave_proto::state::SessionStore;
use airwave_proto::stations::{
    builtin_stations, load_stations_from_m3u, load_stations_from_toml, parse_m3u_from_str,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PlaybackError;
use crate::graph::SignalGraph;
use crate::metadata::{MetadataFetcher, MetadataPoller, MetadataUpdate};
use crate::registry::SourceRegistry;
use crate::source::{SignalKind, SourcePhase, StreamFactory, StreamSignal};
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// Inputs from outside the controller.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from the HTTP API or a socket client.  `ack` fires once the
    /// command has been applied.
    ClientCommand(Command, Option<oneshot::Sender<()>>),
    /// Result of the startup bandwidth probe, in kbit/s.
    BandwidthMeasured(u32),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub poll_interval: Duration,
    pub preload_threshold_kbps: u32,
    pub initial_volume: f32,
}

impl ControllerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.metadata.poll_interval_secs.max(1)),
            preload_threshold_kbps: config.preload.threshold_kbps,
            initial_volume: config.audio.default_volume,
        }
    }
}

// ── PlaybackController ────────────────────────────────────────────────────────

pub struct PlaybackController<F: StreamFactory, M: MetadataFetcher> {
    stations: Arc<[Station]>,
    store: Arc<SessionStore>,
    registry: SourceRegistry<F>,
    graph: SignalGraph,
    poller: MetadataPoller<M>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    signal_rx: mpsc::Receiver<StreamSignal>,
    metadata_rx: mpsc::Receiver<MetadataUpdate>,
    options: ControllerOptions,
    /// Index of the selected station.
    active: Option<usize>,
    status: PlaybackStatus,
    volume: f32,
    muted: bool,
    /// Restored by unmute.
    last_nonzero_volume: f32,
    equalizer: EqualizerState,
    preloaded: bool,
}

impl<F: StreamFactory, M: MetadataFetcher> PlaybackController<F, M> {
    pub fn new(
        stations: Arc<[Station]>,
        store: Arc<SessionStore>,
        factory: F,
        fetcher: M,
        graph: SignalGraph,
        options: ControllerOptions,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(64);
        let (metadata_tx, metadata_rx) = mpsc::channel(16);
        let volume = options.initial_volume.clamp(0.0, 1.0);
        graph.set_master_gain(volume);

        Self {
            stations,
            store,
            registry: SourceRegistry::new(factory, signal_tx),
            graph,
            poller: MetadataPoller::new(fetcher, options.poll_interval, metadata_tx),
            broadcast_tx,
            signal_rx,
            metadata_rx,
            options,
            active: None,
            status: PlaybackStatus::Idle,
            volume,
            muted: volume == 0.0,
            last_nonzero_volume: if volume > 0.0 { volume } else { 1.0 },
            equalizer: EqualizerState::default(),
            preloaded: false,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.store)
    }

    /// Run until `Shutdown` arrives or every event sender is gone, then
    /// release all sources.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("PlaybackController: starting event loop");

        loop {
            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("PlaybackController: event channel closed, shutting down");
                        break;
                    }
                    Some(DaemonEvent::Shutdown) => {
                        info!("PlaybackController: shutdown requested");
                        break;
                    }
                    Some(DaemonEvent::ClientCommand(cmd, ack)) => {
                        info!("PlaybackController: command {:?}", cmd);
                        if let Err(e) = self.handle_command(cmd).await {
                            error!("PlaybackController: command error: {}", e);
                        }
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    Some(DaemonEvent::BandwidthMeasured(kbps)) => {
                        self.on_bandwidth(kbps).await;
                    }
                },
                Some(signal) = self.signal_rx.recv() => {
                    self.on_stream_signal(signal).await;
                }
                Some(update) = self.metadata_rx.recv() => {
                    self.on_metadata(update).await;
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    fn active_url(&self) -> Option<String> {
        self.active
            .and_then(|idx| self.stations.get(idx))
            .map(|s| s.url.clone())
    }

    fn notify(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn set_status(&mut self, status: PlaybackStatus) {
        self.status = status;
        self.store.set_playback_status(status).await;
        self.notify();
    }

    // ── command handlers ──────────────────────────────────────────────────────

    pub async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::SelectStation { station_idx } => self.select_station(station_idx).await?,
            Command::TogglePlay => self.toggle_play().await,
            Command::Reload => self.reload().await,
            Command::Volume { value } => self.set_volume(value).await,
            Command::ToggleMute => self.toggle_mute().await,
            Command::SetBand { band, db } => self.set_band_gain(band, db).await,
            Command::SetEqualizer { enabled } => self.set_equalizer(enabled).await,
            Command::GetState => {
                // State will be broadcast automatically
                self.notify();
            }
        }
        Ok(())
    }

    /// Select a station.  Selecting the one already selected toggles it, or
    /// retries it if it failed.
    pub async fn select_station(&mut self, idx: usize) -> anyhow::Result<()> {
        let Some(station) = self.stations.get(idx).cloned() else {
            anyhow::bail!("no station at index {}", idx);
        };

        if self.active == Some(idx) {
            if self.status == PlaybackStatus::Failed {
                info!("Retrying failed station: {}", station.name);
                self.restart_load(&station.url, true).await;
            } else {
                self.toggle_play().await;
            }
            return Ok(());
        }

        info!("Selecting station: {}", station.name);
        self.leave_active();

        self.active = Some(idx);
        self.status = PlaybackStatus::Loading;
        self.store.set_selected(idx).await;
        self.notify();

        // Now-playing text should show up before the audio does.
        self.poller.start(&station.url);

        let phase = self.registry.get_or_create(&station.url).phase();
        match phase {
            SourcePhase::Ready | SourcePhase::Paused => {
                debug!("{} already buffered, starting at once", station.url);
                self.start_audio(&station.url).await;
            }
            SourcePhase::Loading => {
                debug!("{} is still buffering, waiting for it", station.url);
            }
            SourcePhase::Unloaded | SourcePhase::Failed | SourcePhase::Playing => {
                self.registry.load(&station.url);
            }
        }
        Ok(())
    }

    /// Stop the selected station's poller and unwire its source.  The source
    /// keeps decoding in the background only once every station has been
    /// preloaded; otherwise its decoder is closed and it goes back to
    /// `Unloaded`.
    fn leave_active(&mut self) {
        if let Some(url) = self.active_url() {
            if let Some(handle) = self.registry.get_mut(&url) {
                if self.preloaded {
                    handle.pause();
                } else {
                    debug!("closing decoder for {}", url);
                    handle.close();
                }
            }
        }
        self.poller.stop();
        self.graph.detach();
    }

    pub async fn toggle_play(&mut self) {
        let Some(url) = self.active_url() else {
            return;
        };

        match self.status {
            PlaybackStatus::Playing => {
                if let Some(handle) = self.registry.get_mut(&url) {
                    handle.pause();
                }
                self.poller.stop();
                info!("Paused {}", url);
                self.set_status(PlaybackStatus::Paused).await;
            }
            PlaybackStatus::Paused => {
                let dead = self
                    .registry
                    .get(&url)
                    .map_or(true, |h| h.phase() == SourcePhase::Failed);
                if dead {
                    info!("{} dropped while paused, buffering again", url);
                    self.restart_load(&url, true).await;
                    return;
                }
                self.poller.start(&url);
                self.start_audio(&url).await;
            }
            PlaybackStatus::Idle | PlaybackStatus::Loading | PlaybackStatus::Failed => {
                debug!("toggle ignored while {}", self.status.label());
            }
        }
    }

    /// Pause, drop buffered audio and buffer the selected station again.
    pub async fn reload(&mut self) {
        let Some(url) = self.active_url() else {
            return;
        };
        info!("Reloading {}", url);
        self.restart_load(&url, false).await;
    }

    /// Re-run the full load sequence for the selected station under a fresh
    /// op id.  Signals from the previous load are ignored from here on.
    async fn restart_load(&mut self, url: &str, optimistic_playing: bool) {
        if let Some(handle) = self.registry.get_mut(url) {
            handle.pause();
            handle.rewind();
        }
        self.graph.detach();
        let op = self.registry.load(url);
        debug!("{} loading under op {}", url, op);

        self.status = PlaybackStatus::Loading;
        self.store.set_loading(optimistic_playing).await;
        self.notify();

        // The old text may be stale now; fetch again right away.
        self.poller.start(url);
    }

    /// Wire the selected station's buffered source into the graph and play.
    async fn start_audio(&mut self, url: &str) {
        let Some(handle) = self.registry.get_mut(url) else {
            return;
        };
        // Per-source volume stays at unity; volume and mute act on master gain.
        handle.set_volume(1.0);

        if let Err(e) = self.graph.attach(handle) {
            self.fail_active(e).await;
            return;
        }
        if let Err(e) = handle.play() {
            self.graph.detach();
            self.fail_active(e).await;
            return;
        }

        info!("Playing {}", url);
        self.set_status(PlaybackStatus::Playing).await;
    }

    async fn fail_active(&mut self, err: PlaybackError) {
        warn!("Playback failed: {}", err);
        if let Some(handle) = self.registry.get_mut(err.url()) {
            handle.mark_failed();
        }
        if self.graph.attached_url() == Some(err.url()) {
            self.graph.detach();
        }
        self.poller.stop();

        self.status = PlaybackStatus::Failed;
        self.store.set_failed(err.to_string()).await;
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::Error(err.to_string()));
        self.notify();
    }

    pub async fn set_volume(&mut self, value: f32) {
        let volume = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        self.volume = volume;
        self.muted = volume == 0.0;
        if volume > 0.0 {
            self.last_nonzero_volume = volume;
        }
        self.apply_volume().await;
    }

    /// Swap between silence and the last non-zero volume.
    pub async fn toggle_mute(&mut self) {
        if self.muted {
            self.volume = self.last_nonzero_volume;
            self.muted = false;
        } else {
            self.volume = 0.0;
            self.muted = true;
        }
        self.apply_volume().await;
    }

    async fn apply_volume(&mut self) {
        self.graph.set_master_gain(self.volume);
        self.store.set_volume(self.volume, self.muted).await;
        self.notify();
    }

    pub async fn set_band_gain(&mut self, band: Band, db: f32) {
        let db = clamp_band_gain(db);
        self.equalizer.set_gain(band, db);
        self.graph.set_band_gain(band, db);
        self.store.set_band_gain(band, db).await;
        self.notify();
    }

    pub async fn set_equalizer(&mut self, enabled: bool) {
        if enabled == self.equalizer.enabled {
            return;
        }
        self.equalizer.enabled = enabled;
        if enabled {
            self.graph.enable_equalizer();
        } else {
            self.graph.teardown();
        }
        self.store.set_equalizer_enabled(enabled).await;
        self.notify();
    }

    // ── async completions ─────────────────────────────────────────────────────

    pub async fn on_stream_signal(&mut self, signal: StreamSignal) {
        let is_active = self.active_url().as_deref() == Some(signal.url.as_str());
        let status = self.status;

        let Some(handle) = self.registry.get_mut(&signal.url) else {
            debug!("signal for unknown source {}", signal.url);
            return;
        };
        if !handle.accepts(&signal) {
            debug!("stale signal for {} op={} dropped", signal.url, signal.op);
            return;
        }

        match signal.kind {
            SignalKind::Ready => {
                handle.mark_ready();
                if is_active && status == PlaybackStatus::Loading {
                    self.start_audio(&signal.url).await;
                } else {
                    debug!("{} buffered in the background", signal.url);
                }
            }
            SignalKind::Failed(err) => {
                if is_active
                    && matches!(status, PlaybackStatus::Loading | PlaybackStatus::Playing)
                {
                    self.fail_active(err).await;
                } else {
                    debug!("background source failed: {}", err);
                    handle.mark_failed();
                    if self.graph.attached_url() == Some(signal.url.as_str()) {
                        self.graph.detach();
                    }
                }
            }
        }
    }

    pub async fn on_metadata(&mut self, update: MetadataUpdate) {
        let is_active = self.active_url().as_deref() == Some(update.url.as_str());
        if !is_active || !self.poller.is_for(&update.url) {
            debug!("metadata for {} arrived after the station changed", update.url);
            return;
        }
        let Some(text) = update.text else {
            debug!("no title in metadata for {}", update.url);
            return;
        };

        if self.store.get_state().await.now_playing.as_deref() == Some(text.as_str()) {
            return;
        }
        info!("Now playing: {}", text);
        self.store.set_now_playing(Some(text.clone())).await;
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::NowPlaying(Some(text)));
        self.notify();
    }

    pub async fn on_bandwidth(&mut self, kbps: u32) {
        if self.preloaded {
            return;
        }
        if kbps <= self.options.preload_threshold_kbps {
            info!(
                "Bandwidth {} kbps at or below {} kbps, loading stations on demand",
                kbps, self.options.preload_threshold_kbps
            );
            return;
        }

        info!("Bandwidth {} kbps, preloading every station", kbps);
        let stations = Arc::clone(&self.stations);
        self.registry
            .preload_all(stations.iter().map(|s| s.url.as_str()));
        self.preloaded = true;
        self.store.set_preloaded().await;
        self.notify();
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    async fn cleanup(&mut self) {
        info!("PlaybackController: cleanup, releasing all sources");
        self.poller.stop();
        self.graph.detach();
        self.graph.teardown();
        self.registry.teardown_all();
    }
}

// ── station loader ────────────────────────────────────────────────────────────

pub async fn load_stations(config: &Config) -> Vec<Station> {
    // 1. User config dir
    let toml_path = &config.stations.stations_toml;
    if toml_path.exists() {
        match load_stations_from_toml(toml_path) {
            Ok(s) if !s.is_empty() => {
                info!("Loaded {} stations from TOML: {}", s.len(), toml_path.display());
                return s;
            }
            Ok(_) => warn!("{} lists no stations", toml_path.display()),
            Err(e) => warn!("Failed to parse TOML stations: {}", e),
        }
    }

    // 2. stations.toml in working directory
    let local_toml = PathBuf::from("stations.toml");
    if local_toml.exists() {
        match load_stations_from_toml(&local_toml) {
            Ok(s) if !s.is_empty() => {
                info!("Loaded {} stations from local stations.toml", s.len());
                return s;
            }
            Ok(_) => warn!("local stations.toml lists no stations"),
            Err(e) => warn!("Failed to parse local stations.toml: {}", e),
        }
    }

    // 3. m3u URL or file
    if let Some(source) = &config.stations.m3u {
        info!("Loading stations from m3u: {}", source);
        let loaded = if source.starts_with("http://") || source.starts_with("https://") {
            fetch_m3u_url(source).await
        } else {
            load_stations_from_m3u(&PathBuf::from(source))
        };
        match loaded {
            Ok(s) if !s.is_empty() => {
                info!("Loaded {} stations from m3u", s.len());
                return s;
            }
            Ok(_) => warn!("m3u {} lists no stations", source),
            Err(e) => warn!("Failed to load m3u stations: {}", e),
        }
    }

    // 4. Built-in table
    let stations = builtin_stations();
    info!("Using {} built-in stations", stations.len());
    stations
}

async fn fetch_m3u_url(url: &str) -> anyhow::Result<Vec<Station>> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    parse_m3u_from_str(&text)
}
