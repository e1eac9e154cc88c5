//! Source handles: one decodable stream per station URL.
//!
//! Every load is tagged with an [`OpId`].  Ready/failed notifications carry the
//! op they were issued for, so a notification that arrives after the handle
//! was reloaded (or after the listener moved on) can be recognised and
//! dropped by the controller.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::PlaybackError;
use crate::pcm::PcmBuffer;

/// Identifier of one load operation.  Issued by the registry, never reused.
pub type OpId = u64;

/// Life-phase of a source handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePhase {
    Unloaded,
    Loading,
    /// Buffered enough to start, not playing.
    Ready,
    Playing,
    Paused,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    Ready,
    Failed(PlaybackError),
}

/// Asynchronous completion of a load, tagged with the op it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSignal {
    pub url: String,
    pub op: OpId,
    pub kind: SignalKind,
}

pub type SignalSender = mpsc::Sender<StreamSignal>;

/// A live audio stream that can be buffered, started and stopped.
///
/// `load` must not block: it starts buffering in the background and reports
/// exactly one `Ready` or `Failed` for `op` through `signals`.  A stream that
/// dies after it was ready may report a later `Failed` for the same op.
pub trait DecodableStream: Send {
    fn load(&mut self, op: OpId, signals: SignalSender);
    fn play(&mut self) -> Result<(), PlaybackError>;
    fn pause(&mut self);
    /// Drop buffered audio so the next play starts from the live edge.
    fn rewind(&mut self);
    fn set_volume(&mut self, volume: f32);
    /// Decoded audio the signal graph reads from.  `None` once closed.
    fn output(&self) -> Option<Arc<PcmBuffer>>;
    fn close(&mut self);
}

/// Builds streams for the registry.  Construction must not perform I/O.
pub trait StreamFactory: Send {
    type Stream: DecodableStream;

    fn create(&self, url: &str) -> Self::Stream;
}

pub struct SourceHandle<S> {
    url: String,
    phase: SourcePhase,
    op: Option<OpId>,
    stream: S,
}

impl<S: DecodableStream> SourceHandle<S> {
    pub fn new(url: impl Into<String>, stream: S) -> Self {
        Self {
            url: url.into(),
            phase: SourcePhase::Unloaded,
            op: None,
            stream,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn phase(&self) -> SourcePhase {
        self.phase
    }

    #[cfg(test)]
    /// The op of the most recent load, if any.
    pub fn current_op(&self) -> Option<OpId> {
        self.op
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Whether a signal belongs to the latest load of this handle.
    pub fn accepts(&self, signal: &StreamSignal) -> bool {
        signal.url == self.url && self.op == Some(signal.op)
    }

    pub(crate) fn begin_load(&mut self, op: OpId, signals: SignalSender) {
        self.op = Some(op);
        self.phase = SourcePhase::Loading;
        self.stream.load(op, signals);
    }

    pub fn mark_ready(&mut self) {
        if self.phase == SourcePhase::Loading {
            self.phase = SourcePhase::Ready;
        }
    }

    pub fn mark_failed(&mut self) {
        self.stream.pause();
        self.phase = SourcePhase::Failed;
    }

    pub fn play(&mut self) -> Result<(), PlaybackError> {
        match self.stream.play() {
            Ok(()) => {
                self.phase = SourcePhase::Playing;
                Ok(())
            }
            Err(e) => {
                self.mark_failed();
                Err(e)
            }
        }
    }

    /// Pause playback.  A handle still buffering keeps buffering and will
    /// become `Ready` rather than `Playing`.
    pub fn pause(&mut self) {
        self.stream.pause();
        if self.phase == SourcePhase::Playing {
            self.phase = SourcePhase::Paused;
        }
    }

    pub fn rewind(&mut self) {
        self.stream.rewind();
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.stream.set_volume(volume);
    }

    pub fn close(&mut self) {
        self.stream.close();
        self.op = None;
        self.phase = SourcePhase::Unloaded;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stream used by controller, registry and graph tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct FakeLog {
        pub loads: Vec<(String, OpId)>,
        pub plays: Vec<String>,
        pub pauses: Vec<String>,
        pub rewinds: Vec<String>,
        pub closes: Vec<String>,
    }

    pub struct FakeStream {
        url: String,
        buffer: Arc<PcmBuffer>,
        log: Arc<Mutex<FakeLog>>,
        reject_play: bool,
    }

    impl DecodableStream for FakeStream {
        fn load(&mut self, op: OpId, _signals: SignalSender) {
            self.buffer.reopen();
            self.log.lock().unwrap().loads.push((self.url.clone(), op));
        }

        fn play(&mut self) -> Result<(), PlaybackError> {
            if self.reject_play {
                return Err(PlaybackError::StreamPlay {
                    url: self.url.clone(),
                    reason: "rejected by test".to_string(),
                });
            }
            self.buffer.set_flowing(true);
            self.log.lock().unwrap().plays.push(self.url.clone());
            Ok(())
        }

        fn pause(&mut self) {
            self.buffer.set_flowing(false);
            self.log.lock().unwrap().pauses.push(self.url.clone());
        }

        fn rewind(&mut self) {
            self.buffer.clear();
            self.log.lock().unwrap().rewinds.push(self.url.clone());
        }

        fn set_volume(&mut self, volume: f32) {
            self.buffer.set_volume(volume);
        }

        fn output(&self) -> Option<Arc<PcmBuffer>> {
            Some(Arc::clone(&self.buffer))
        }

        fn close(&mut self) {
            self.buffer.close();
            self.log.lock().unwrap().closes.push(self.url.clone());
        }
    }

    #[derive(Clone, Default)]
    pub struct FakeFactory {
        pub log: Arc<Mutex<FakeLog>>,
        pub reject_play_for: Arc<Mutex<Vec<String>>>,
    }

    impl StreamFactory for FakeFactory {
        type Stream = FakeStream;

        fn create(&self, url: &str) -> FakeStream {
            FakeStream {
                url: url.to_string(),
                buffer: PcmBuffer::new(4096),
                log: Arc::clone(&self.log),
                reject_play: self.reject_play_for.lock().unwrap().iter().any(|u| u == url),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeFactory;
    use super::*;

    #[test]
    fn test_signal_acceptance_follows_latest_op() {
        let factory = FakeFactory::default();
        let (tx, _rx) = mpsc::channel(8);
        let mut handle = SourceHandle::new("http://a", factory.create("http://a"));
        handle.begin_load(1, tx.clone());
        handle.begin_load(2, tx);

        let stale = StreamSignal {
            url: "http://a".to_string(),
            op: 1,
            kind: SignalKind::Ready,
        };
        let fresh = StreamSignal { op: 2, ..stale.clone() };
        assert!(!handle.accepts(&stale));
        assert!(handle.accepts(&fresh));
    }

    #[test]
    fn test_pause_while_loading_keeps_loading() {
        let factory = FakeFactory::default();
        let (tx, _rx) = mpsc::channel(8);
        let mut handle = SourceHandle::new("http://a", factory.create("http://a"));
        handle.begin_load(1, tx);
        handle.pause();
        assert_eq!(handle.phase(), SourcePhase::Loading);
        handle.mark_ready();
        assert_eq!(handle.phase(), SourcePhase::Ready);
    }

    #[test]
    fn test_rejected_play_fails_handle() {
        let factory = FakeFactory::default();
        factory
            .reject_play_for
            .lock()
            .unwrap()
            .push("http://a".to_string());
        let mut handle = SourceHandle::new("http://a", factory.create("http://a"));
        assert!(matches!(
            handle.play(),
            Err(PlaybackError::StreamPlay { .. })
        ));
        assert_eq!(handle.phase(), SourcePhase::Failed);
    }
}
