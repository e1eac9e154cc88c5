//! Process-wide audio output.
//!
//! The sink pulls rendered audio out of the graph.  It is created once by
//! `main` and outlives every graph rewiring, including equalizer teardown.

use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SizedSample, Stream, StreamConfig};
use tracing::{debug, error, info, warn};

use super::GraphCore;
use crate::error::SinkError;

/// Sample rate and interleaved channel count shared by the sink, the graph
/// and every decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

pub trait OutputSink: Send {
    fn format(&self) -> StreamFormat;
    fn name(&self) -> &str;
}

/// Discards audio.  Used when no output device is available and in tests.
pub struct NullSink {
    format: StreamFormat,
}

impl NullSink {
    pub fn new(format: StreamFormat) -> Self {
        Self { format }
    }
}

impl OutputSink for NullSink {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// cpal output stream driven by the graph.
///
/// `cpal::Stream` is not `Send`, so the stream lives on its own thread for
/// the lifetime of the sink; dropping the sink stops that thread.
pub struct CpalSink {
    format: StreamFormat,
    device_name: String,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    pub fn start(device: Option<String>, renderer: Arc<Mutex<GraphCore>>) -> Result<Self, SinkError> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(StreamFormat, String), SinkError>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("airwave-audio".to_string())
            .spawn(move || {
                let stream = match open_stream(device.as_deref(), renderer) {
                    Ok((stream, format, name)) => {
                        let _ = ready_tx.send(Ok((format, name)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until the sink is dropped.
                let _ = shutdown_rx.recv();
                debug!("audio output thread stopping");
                drop(stream);
            })
            .map_err(|e| SinkError::Stream(e.to_string()))?;

        let (format, device_name) = ready_rx.recv().map_err(|_| SinkError::ThreadGone)??;
        info!(
            "Audio output on '{}' ({} Hz, {} ch)",
            device_name, format.sample_rate, format.channels
        );

        Ok(Self {
            format,
            device_name,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl OutputSink for CpalSink {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn select_device(name: Option<&str>) -> Result<(Device, String), SinkError> {
    let host = cpal::default_host();

    if let Some(wanted) = name {
        let mut devices = host
            .output_devices()
            .map_err(|e| SinkError::Config(format!("failed to enumerate devices: {}", e)))?;
        if let Some(dev) = devices.find(|d| d.name().ok().as_deref() == Some(wanted)) {
            return Ok((dev, wanted.to_string()));
        }
        warn!("Output device '{}' not found, falling back to default", wanted);
        let dev = host
            .default_output_device()
            .ok_or_else(|| SinkError::DeviceNotFound(wanted.to_string()))?;
        let dev_name = dev.name().unwrap_or_else(|_| "Unknown".to_string());
        return Ok((dev, dev_name));
    }

    let dev = host.default_output_device().ok_or(SinkError::NoDevice)?;
    let dev_name = dev.name().unwrap_or_else(|_| "Unknown".to_string());
    Ok((dev, dev_name))
}

fn open_stream(
    name: Option<&str>,
    renderer: Arc<Mutex<GraphCore>>,
) -> Result<(Stream, StreamFormat, String), SinkError> {
    let (device, device_name) = select_device(name)?;
    let supported = device
        .default_output_config()
        .map_err(|e| SinkError::Config(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let format = StreamFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };
    debug!("audio config: {:?} {:?}", format, sample_format);

    renderer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .configure(format);

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, renderer, |s| s)?,
        SampleFormat::I16 => {
            build_stream::<i16>(&device, &config, renderer, |s| (s * i16::MAX as f32) as i16)?
        }
        SampleFormat::U16 => {
            build_stream::<u16>(&device, &config, renderer, |s| ((s + 1.0) * 32767.5) as u16)?
        }
        other => return Err(SinkError::UnsupportedFormat(format!("{:?}", other))),
    };

    stream
        .play()
        .map_err(|e| SinkError::Stream(format!("failed to start stream: {}", e)))?;

    Ok((stream, format, device_name))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    renderer: Arc<Mutex<GraphCore>>,
    convert: fn(f32) -> T,
) -> Result<Stream, SinkError>
where
    T: SizedSample + Send + 'static,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                renderer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .render(&mut scratch);
                for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = convert(sample.clamp(-1.0, 1.0));
                }
            },
            move |err| {
                error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| SinkError::Stream(format!("failed to build stream: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sink_reports_its_format() {
        let sink = NullSink::new(StreamFormat {
            sample_rate: 44_100,
            channels: 1,
        });
        assert_eq!(sink.format().sample_rate, 44_100);
        assert_eq!(sink.name(), "null");
    }
}
