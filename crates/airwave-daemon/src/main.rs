mod bandwidth;
mod core;
mod error;
mod ffmpeg;
mod graph;
mod http;
mod metadata;
mod pcm;
mod registry;
mod socket;
mod source;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use airwave_proto::config::Config;
use airwave_proto::protocol::EqualizerState;
use airwave_proto::state::SessionStore;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::{ControllerOptions, DaemonEvent, PlaybackController};
use crate::ffmpeg::{DecodeSettings, FfmpegFactory};
use crate::graph::{CpalSink, NullSink, OutputSink, SignalGraph, StreamFormat};
use crate::metadata::HttpMetadataFetcher;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    NowPlaying(Option<String>),
    Log(String),
    /// A station failed; the text is shown to the listener.
    Error(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR reach clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = airwave_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,airwaved=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let stations: Arc<[_]> = core::load_stations(&config).await.into();
    let store = Arc::new(SessionStore::new(
        stations.to_vec(),
        config.audio.default_volume,
    ));

    // The graph outlives every source; the sink outlives the graph's filters.
    let equalizer = EqualizerState::default();
    let graph = SignalGraph::new(
        StreamFormat::default(),
        config.audio.ramp_ms,
        config.audio.default_volume,
        &equalizer,
    );
    let sink: Box<dyn OutputSink> = match CpalSink::start(config.audio.device.clone(), graph.renderer()) {
        Ok(sink) => Box::new(sink),
        Err(e) => {
            warn!("No audio output ({}), running silent", e);
            Box::new(NullSink::new(graph.format()))
        }
    };
    info!("Output sink: {}", sink.name());

    let ffmpeg = airwave_proto::platform::find_ffmpeg_binary().unwrap_or_else(|| {
        warn!("ffmpeg not found, relying on PATH");
        PathBuf::from("ffmpeg")
    });
    let factory = FfmpegFactory::new(DecodeSettings::new(
        ffmpeg,
        sink.format(),
        config.audio.buffer_secs,
        config.audio.preroll_ms,
    ));

    let client = reqwest::Client::builder()
        .user_agent(concat!("airwaved/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let fetcher = HttpMetadataFetcher::new(
        client.clone(),
        config.metadata.read_limit_bytes,
        Duration::from_secs(config.metadata.timeout_secs),
    );

    let controller = PlaybackController::new(
        Arc::clone(&stations),
        Arc::clone(&store),
        factory,
        fetcher,
        graph,
        ControllerOptions::from_config(&config),
        broadcast_tx.clone(),
    );

    // Event channel: all external inputs funnel into the controller
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<DaemonEvent>(256);

    if config.preload.enabled {
        let tx = event_tx.clone();
        let preload = config.preload.clone();
        tokio::spawn(async move {
            let measured = bandwidth::measure(
                client,
                preload.probe_url,
                preload.probe_bytes,
                Duration::from_secs(preload.probe_timeout_secs),
            )
            .await;
            if let Some(kbps) = measured {
                let _ = tx.send(DaemonEvent::BandwidthMeasured(kbps)).await;
            }
        });
    }

    if config.socket.enabled {
        let _socket_handle = socket::start_server(
            config.http.bind_address.clone(),
            config.socket.port,
            Arc::clone(&store),
            event_tx.clone(),
            broadcast_tx.clone(),
        );
    }

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            Arc::clone(&store),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(DaemonEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    controller.run(event_rx).await?;

    drop(sink);
    Ok(())
}
