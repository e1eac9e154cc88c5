//! ffmpeg-backed decodable stream.
//!
//! Each loaded stream owns one `ffmpeg` child that connects to the station,
//! decodes to interleaved f32 PCM at the output device's rate and channel
//! count, and writes it to stdout.  A reader task moves the samples into the
//! stream's `PcmBuffer` and reports readiness once enough audio is buffered.
//!
//! The child is spawned with `kill_on_drop`, so aborting the reader task
//! (reload, close, drop) also terminates ffmpeg.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::PlaybackError;
use crate::graph::StreamFormat;
use crate::pcm::PcmBuffer;
use crate::source::{DecodableStream, OpId, SignalKind, SignalSender, StreamFactory, StreamSignal};

const READ_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct DecodeSettings {
    pub ffmpeg: PathBuf,
    pub format: StreamFormat,
    /// Samples (not frames) kept per source.
    pub capacity_samples: usize,
    /// Samples that must arrive before the stream reports ready.
    pub preroll_samples: usize,
}

impl DecodeSettings {
    pub fn new(ffmpeg: PathBuf, format: StreamFormat, buffer_secs: u32, preroll_ms: u32) -> Self {
        let samples_per_sec = format.sample_rate as usize * format.channels as usize;
        Self {
            ffmpeg,
            format,
            capacity_samples: samples_per_sec * buffer_secs.max(1) as usize,
            preroll_samples: samples_per_sec * preroll_ms as usize / 1000,
        }
    }
}

pub struct FfmpegFactory {
    settings: Arc<DecodeSettings>,
}

impl FfmpegFactory {
    pub fn new(settings: DecodeSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl StreamFactory for FfmpegFactory {
    type Stream = FfmpegStream;

    fn create(&self, url: &str) -> FfmpegStream {
        FfmpegStream {
            url: url.to_string(),
            buffer: PcmBuffer::new(self.settings.capacity_samples),
            settings: Arc::clone(&self.settings),
            task: None,
        }
    }
}

pub struct FfmpegStream {
    url: String,
    settings: Arc<DecodeSettings>,
    buffer: Arc<PcmBuffer>,
    task: Option<tokio::task::AbortHandle>,
}

impl DecodableStream for FfmpegStream {
    fn load(&mut self, op: OpId, signals: SignalSender) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.buffer.reopen();

        let handle = tokio::spawn(run_decoder(
            self.url.clone(),
            Arc::clone(&self.settings),
            Arc::clone(&self.buffer),
            op,
            signals,
        ));
        self.task = Some(handle.abort_handle());
    }

    fn play(&mut self) -> Result<(), PlaybackError> {
        if self.task.is_none() || self.buffer.is_closed() {
            return Err(PlaybackError::StreamPlay {
                url: self.url.clone(),
                reason: "stream is not loaded".to_string(),
            });
        }
        self.buffer.set_flowing(true);
        Ok(())
    }

    fn pause(&mut self) {
        self.buffer.set_flowing(false);
    }

    fn rewind(&mut self) {
        self.buffer.clear();
    }

    fn set_volume(&mut self, volume: f32) {
        self.buffer.set_volume(volume);
    }

    fn output(&self) -> Option<Arc<PcmBuffer>> {
        if self.buffer.is_closed() {
            None
        } else {
            Some(Arc::clone(&self.buffer))
        }
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.buffer.close();
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn spawn_ffmpeg(url: &str, settings: &DecodeSettings) -> std::io::Result<Child> {
    let rate = settings.format.sample_rate.to_string();
    let channels = settings.format.channels.to_string();
    Command::new(&settings.ffmpeg)
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostdin",
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-probesize",
            "64k",
            "-analyzeduration",
            "200000",
            "-i",
            url,
            "-vn",
            "-ac",
            &channels,
            "-ar",
            &rate,
            "-f",
            "f32le",
            "pipe:1",
        ])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

async fn run_decoder(
    url: String,
    settings: Arc<DecodeSettings>,
    buffer: Arc<PcmBuffer>,
    op: OpId,
    signals: SignalSender,
) {
    let failed = |reason: String| StreamSignal {
        url: url.clone(),
        op,
        kind: SignalKind::Failed(PlaybackError::StreamLoad {
            url: url.clone(),
            reason,
        }),
    };

    let mut child = match spawn_ffmpeg(&url, &settings) {
        Ok(child) => child,
        Err(e) => {
            warn!("ffmpeg: failed to spawn for {}: {}", url, e);
            let _ = signals.send(failed(format!("ffmpeg: {}", e))).await;
            return;
        }
    };
    let Some(mut stdout) = child.stdout.take() else {
        let _ = signals.send(failed("ffmpeg stdout unavailable".to_string())).await;
        return;
    };

    debug!("ffmpeg: decoding {} op={}", url, op);
    let mut raw = vec![0u8; READ_CHUNK_BYTES];
    let mut decoder = F32leDecoder::default();
    let mut samples: Vec<f32> = Vec::with_capacity(READ_CHUNK_BYTES / 4);
    let mut received = 0usize;
    let mut ready = false;

    let reason = loop {
        match stdout.read(&mut raw).await {
            Ok(0) => break "stream ended".to_string(),
            Ok(n) => {
                samples.clear();
                decoder.feed(&raw[..n], &mut samples);
                buffer.push(&samples);
                received += samples.len();
                if !ready && received >= settings.preroll_samples {
                    ready = true;
                    info!("ffmpeg: {} buffered, ready (op={})", url, op);
                    let signal = StreamSignal {
                        url: url.clone(),
                        op,
                        kind: SignalKind::Ready,
                    };
                    if signals.send(signal).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => break format!("read error: {}", e),
        }
    };

    let reason = match child.wait().await {
        Ok(status) if !status.success() => format!("{} (ffmpeg {})", reason, status),
        _ => reason,
    };
    warn!("ffmpeg: {} stopped: {}", url, reason);
    let _ = signals.send(failed(reason)).await;
}

/// Turns a byte stream of little-endian f32 into samples, carrying a partial
/// sample over to the next read.
#[derive(Debug, Default)]
pub struct F32leDecoder {
    carry: Vec<u8>,
}

impl F32leDecoder {
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<f32>) {
        let mut rest = bytes;
        if !self.carry.is_empty() {
            let need = 4 - self.carry.len();
            let take = need.min(rest.len());
            self.carry.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.carry.len() < 4 {
                return;
            }
            out.push(f32::from_le_bytes([
                self.carry[0],
                self.carry[1],
                self.carry[2],
                self.carry[3],
            ]));
            self.carry.clear();
        }

        let mut chunks = rest.chunks_exact(4);
        for c in &mut chunks {
            out.push(f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        }
        self.carry.extend_from_slice(chunks.remainder());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_decoder_carries_partial_samples() {
        let bytes = bytes_of(&[0.25, -0.5, 1.0]);
        let mut decoder = F32leDecoder::default();
        let mut out = Vec::new();

        decoder.feed(&bytes[..5], &mut out);
        assert_eq!(out, vec![0.25]);
        decoder.feed(&bytes[5..6], &mut out);
        assert_eq!(out, vec![0.25]);
        decoder.feed(&bytes[6..], &mut out);
        assert_eq!(out, vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn test_settings_scale_with_format() {
        let settings = DecodeSettings::new(
            PathBuf::from("ffmpeg"),
            StreamFormat {
                sample_rate: 48_000,
                channels: 2,
            },
            4,
            250,
        );
        assert_eq!(settings.capacity_samples, 48_000 * 2 * 4);
        assert_eq!(settings.preroll_samples, 24_000);
    }

    #[test]
    fn test_play_before_load_is_rejected() {
        let factory = FfmpegFactory::new(DecodeSettings::new(
            PathBuf::from("ffmpeg"),
            StreamFormat::default(),
            1,
            100,
        ));
        let mut stream = factory.create("http://example.com/live");
        assert!(matches!(
            stream.play(),
            Err(PlaybackError::StreamPlay { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_reports_load_failure() {
        let factory = FfmpegFactory::new(DecodeSettings::new(
            PathBuf::from("/nonexistent/airwave-ffmpeg"),
            StreamFormat::default(),
            1,
            100,
        ));
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let mut stream = factory.create("http://example.com/live");
        stream.load(7, tx);

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.op, 7);
        assert!(matches!(
            signal.kind,
            SignalKind::Failed(PlaybackError::StreamLoad { .. })
        ));
    }
}
