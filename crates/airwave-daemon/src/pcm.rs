//! Bounded PCM hand-off between a decoder task and the signal graph.
//!
//! The decoder pushes interleaved f32 samples; the audio callback pops them.
//! Live feeds keep arriving while a source is paused, so the buffer drops the
//! oldest samples once full instead of applying back-pressure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub struct PcmBuffer {
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
    /// Samples only leave the buffer while flowing (i.e. the source plays).
    flowing: AtomicBool,
    closed: AtomicBool,
    /// Per-source volume as f32 bits.
    volume: AtomicU32,
}

impl PcmBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(1 << 20))),
            capacity: capacity.max(1),
            flowing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            volume: AtomicU32::new(1.0f32.to_bits()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, samples: &[f32]) {
        if self.is_closed() {
            return;
        }
        let mut queue = self.lock();
        queue.extend(samples.iter().copied());
        let excess = queue.len().saturating_sub(self.capacity);
        if excess > 0 {
            queue.drain(..excess);
        }
    }

    /// Fill `out` from the front of the queue.  Returns the number of samples
    /// written; the caller treats the rest of `out` as an underrun.
    pub fn pop_into(&self, out: &mut [f32]) -> usize {
        if !self.is_flowing() || self.is_closed() {
            return 0;
        }
        let volume = self.volume();
        let mut queue = self.lock();
        let n = out.len().min(queue.len());
        for (slot, sample) in out.iter_mut().zip(queue.drain(..n)) {
            *slot = sample * volume;
        }
        n
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn set_flowing(&self, flowing: bool) {
        self.flowing.store(flowing, Ordering::SeqCst);
    }

    pub fn is_flowing(&self) -> bool {
        self.flowing.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.flowing.store(false, Ordering::SeqCst);
        self.clear();
    }

    pub fn reopen(&self) {
        self.clear();
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_oldest_when_full() {
        let buf = PcmBuffer::new(4);
        buf.push(&[1.0, 2.0, 3.0]);
        buf.push(&[4.0, 5.0, 6.0]);
        assert_eq!(buf.len(), 4);

        buf.set_flowing(true);
        let mut out = [0.0; 8];
        assert_eq!(buf.pop_into(&mut out), 4);
        assert_eq!(&out[..4], &[3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_nothing_flows_while_paused() {
        let buf = PcmBuffer::new(16);
        buf.push(&[0.5; 8]);
        let mut out = [0.0; 8];
        assert_eq!(buf.pop_into(&mut out), 0);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_volume_scales_output() {
        let buf = PcmBuffer::new(16);
        buf.set_volume(0.5);
        buf.set_flowing(true);
        buf.push(&[1.0, -1.0]);
        let mut out = [0.0; 2];
        buf.pop_into(&mut out);
        assert_eq!(out, [0.5, -0.5]);
    }

    #[test]
    fn test_closed_buffer_rejects_samples_until_reopened() {
        let buf = PcmBuffer::new(16);
        buf.close();
        buf.push(&[1.0; 4]);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_closed());

        buf.reopen();
        buf.push(&[1.0; 4]);
        assert_eq!(buf.len(), 4);
    }
}
