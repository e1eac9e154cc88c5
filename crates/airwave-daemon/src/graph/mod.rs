//! Signal graph: source -> master gain -> low shelf -> peaking mid ->
//! high shelf -> output sink.
//!
//! `SignalGraph` is the controller-side owner.  It shares a `GraphCore` with
//! the output sink, which renders it from the audio callback.  At most one
//! source buffer is wired into the input at a time.

pub mod dsp;
pub mod sink;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use airwave_proto::protocol::{clamp_band_gain, Band, EqualizerState};
use tracing::{debug, info};

use crate::error::PlaybackError;
use crate::pcm::PcmBuffer;
use crate::source::{DecodableStream, SourceHandle};
use dsp::{band_index, Equalizer, SmoothedParam};

pub use sink::{CpalSink, NullSink, OutputSink, StreamFormat};

pub struct GraphCore {
    format: StreamFormat,
    ramp_ms: u32,
    input: Option<Arc<PcmBuffer>>,
    master: SmoothedParam,
    /// `None` after teardown: pass-through from master gain to the sink.
    eq: Option<Equalizer>,
    band_db: [f32; 3],
}

impl GraphCore {
    fn ramp_frames(format: StreamFormat, ramp_ms: u32) -> u32 {
        (format.sample_rate as u64 * ramp_ms as u64 / 1000) as u32
    }

    /// Adopt the output device's format.  Filter state is rebuilt.
    pub fn configure(&mut self, format: StreamFormat) {
        if format == self.format {
            return;
        }
        debug!("graph: reconfigured for {:?}", format);
        self.format = format;
        let ramp = Self::ramp_frames(format, self.ramp_ms);
        self.master = SmoothedParam::new(self.master.target(), ramp);
        if self.eq.is_some() {
            self.eq = Some(Equalizer::new(format, self.band_db, ramp));
        }
    }

    /// Fill `out` (interleaved) with the next block of processed audio.
    /// Missing input renders as silence.
    pub fn render(&mut self, out: &mut [f32]) {
        let filled = match &self.input {
            Some(buffer) => buffer.pop_into(out),
            None => 0,
        };
        out[filled..].fill(0.0);

        let channels = self.format.channels.max(1) as usize;
        for frame in out.chunks_mut(channels) {
            let gain = self.master.next();
            for sample in frame.iter_mut() {
                *sample *= gain;
            }
            if let Some(eq) = self.eq.as_mut() {
                eq.process_frame(frame);
            }
        }
    }
}

/// Controller-side handle on the one process-wide graph.
pub struct SignalGraph {
    core: Arc<Mutex<GraphCore>>,
    attached: Option<String>,
}

impl SignalGraph {
    pub fn new(format: StreamFormat, ramp_ms: u32, gain: f32, equalizer: &EqualizerState) -> Self {
        let ramp = GraphCore::ramp_frames(format, ramp_ms);
        let band_db = [equalizer.low_db, equalizer.mid_db, equalizer.high_db];
        let eq = equalizer
            .enabled
            .then(|| Equalizer::new(format, band_db, ramp));

        Self {
            core: Arc::new(Mutex::new(GraphCore {
                format,
                ramp_ms,
                input: None,
                master: SmoothedParam::new(gain.clamp(0.0, 1.0), ramp),
                eq,
                band_db,
            })),
            attached: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The shared core the output sink renders from.
    pub fn renderer(&self) -> Arc<Mutex<GraphCore>> {
        Arc::clone(&self.core)
    }

    pub fn format(&self) -> StreamFormat {
        self.lock().format
    }

    pub fn attached_url(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    /// Wire `handle` into the graph input, replacing whatever was there.
    ///
    /// Attaching the handle that is already wired in does nothing.  If the
    /// handle has no live output the graph is left with an empty input.
    pub fn attach<S: DecodableStream>(&mut self, handle: &SourceHandle<S>) -> Result<(), PlaybackError> {
        let output = handle.stream().output().filter(|b| !b.is_closed());

        if self.attached.as_deref() == Some(handle.url()) {
            let same = match (&self.lock().input, &output) {
                (Some(current), Some(new)) => Arc::ptr_eq(current, new),
                _ => false,
            };
            if same {
                return Ok(());
            }
        }

        self.detach();

        let Some(buffer) = output else {
            return Err(PlaybackError::GraphAttach {
                url: handle.url().to_string(),
                reason: "stream has no open output".to_string(),
            });
        };
        self.lock().input = Some(buffer);
        self.attached = Some(handle.url().to_string());
        info!("graph: attached {}", handle.url());
        Ok(())
    }

    pub fn detach(&mut self) {
        if let Some(url) = self.attached.take() {
            debug!("graph: detached {}", url);
        }
        self.lock().input = None;
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.lock().master.set_target(gain.clamp(0.0, 1.0));
    }

    #[cfg(test)]
    pub fn master_gain(&self) -> f32 {
        self.lock().master.target()
    }

    pub fn set_band_gain(&self, band: Band, db: f32) {
        let db = clamp_band_gain(db);
        let mut core = self.lock();
        core.band_db[band_index(band)] = db;
        if let Some(eq) = core.eq.as_mut() {
            eq.set_gain(band, db);
        }
    }

    /// Remove the filter stages and route master gain straight to the sink.
    /// The input stays wired, so playback continues unequalized.
    pub fn teardown(&self) {
        let mut core = self.lock();
        if core.eq.take().is_some() {
            info!("graph: equalizer torn down, pass-through active");
        }
    }

    /// Re-insert the filter stages with the current band gains.
    pub fn enable_equalizer(&self) {
        let mut core = self.lock();
        if core.eq.is_none() {
            let ramp = GraphCore::ramp_frames(core.format, core.ramp_ms);
            core.eq = Some(Equalizer::new(core.format, core.band_db, ramp));
            info!("graph: equalizer enabled");
        }
    }

    #[cfg(test)]
    pub fn is_equalized(&self) -> bool {
        self.lock().eq.is_some()
    }
}
