//! Signal primitives: the three fixed tone-control stages and ramped
//! parameters.
//!
//! Gain and band changes never jump.  A new value becomes the target of a
//! linear ramp; master gain advances per frame, band gains per block of
//! `COEFF_BLOCK_FRAMES` with the filter coefficients recomputed each block.

use airwave_proto::protocol::Band;
use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type, Q_BUTTERWORTH_F32};

use super::StreamFormat;

pub const LOW_SHELF_HZ: f32 = 320.0;
pub const MID_PEAK_HZ: f32 = 1000.0;
pub const MID_PEAK_Q: f32 = 0.5;
pub const HIGH_SHELF_HZ: f32 = 3200.0;

/// Frames between coefficient updates while a band gain is ramping.
pub const COEFF_BLOCK_FRAMES: u32 = 32;

pub fn band_index(band: Band) -> usize {
    match band {
        Band::Low => 0,
        Band::Mid => 1,
        Band::High => 2,
    }
}

fn passthrough() -> Coefficients<f32> {
    Coefficients {
        a1: 0.0,
        a2: 0.0,
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
    }
}

/// Coefficients for one band at `db` gain.  Shelves use a slope of 1
/// (Butterworth Q); the mid band is a peaking filter with Q = 0.5.
///
/// Falls back to a pass-through when the band frequency is above Nyquist.
pub fn band_coefficients(band: Band, db: f32, sample_rate: u32) -> Coefficients<f32> {
    let fs = (sample_rate as f32).hz();
    let designed = match band {
        Band::Low => Coefficients::<f32>::from_params(
            Type::LowShelf(db),
            fs,
            LOW_SHELF_HZ.hz(),
            Q_BUTTERWORTH_F32,
        ),
        Band::Mid => Coefficients::<f32>::from_params(
            Type::PeakingEQ(db),
            fs,
            MID_PEAK_HZ.hz(),
            MID_PEAK_Q,
        ),
        Band::High => Coefficients::<f32>::from_params(
            Type::HighShelf(db),
            fs,
            HIGH_SHELF_HZ.hz(),
            Q_BUTTERWORTH_F32,
        ),
    };
    designed.unwrap_or_else(|_| passthrough())
}

/// A value that moves linearly toward its target over a fixed number of
/// steps.
#[derive(Debug, Clone)]
pub struct SmoothedParam {
    current: f32,
    target: f32,
    step: f32,
    remaining: u32,
    ramp_steps: u32,
}

impl SmoothedParam {
    pub fn new(value: f32, ramp_steps: u32) -> Self {
        Self {
            current: value,
            target: value,
            step: 0.0,
            remaining: 0,
            ramp_steps,
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = target;
        if self.ramp_steps == 0 {
            self.current = target;
            self.remaining = 0;
            return;
        }
        self.step = (target - self.current) / self.ramp_steps as f32;
        self.remaining = self.ramp_steps;
    }

    /// Advance one step and return the new value.
    pub fn next(&mut self) -> f32 {
        self.advance(1)
    }

    pub fn advance(&mut self, steps: u32) -> f32 {
        if self.remaining == 0 {
            return self.current;
        }
        if steps >= self.remaining {
            self.remaining = 0;
            self.current = self.target;
        } else {
            self.remaining -= steps;
            self.current += self.step * steps as f32;
        }
        self.current
    }

    #[cfg(test)]
    pub fn value(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn is_ramping(&self) -> bool {
        self.remaining > 0
    }
}

/// Low-shelf, peaking-mid and high-shelf in series, one filter set per
/// channel.
pub struct Equalizer {
    sample_rate: u32,
    gains: [SmoothedParam; 3],
    filters: Vec<[DirectForm1<f32>; 3]>,
    block_pos: u32,
}

impl Equalizer {
    pub fn new(format: StreamFormat, gains_db: [f32; 3], ramp_frames: u32) -> Self {
        let ramp_blocks = ramp_frames.div_ceil(COEFF_BLOCK_FRAMES);
        let coeffs = [
            band_coefficients(Band::Low, gains_db[0], format.sample_rate),
            band_coefficients(Band::Mid, gains_db[1], format.sample_rate),
            band_coefficients(Band::High, gains_db[2], format.sample_rate),
        ];
        let filters = (0..format.channels.max(1))
            .map(|_| coeffs.map(DirectForm1::<f32>::new))
            .collect();

        Self {
            sample_rate: format.sample_rate,
            gains: gains_db.map(|db| SmoothedParam::new(db, ramp_blocks)),
            filters,
            block_pos: 0,
        }
    }

    pub fn set_gain(&mut self, band: Band, db: f32) {
        self.gains[band_index(band)].set_target(db);
    }

    #[cfg(test)]
    pub fn gain_target(&self, band: Band) -> f32 {
        self.gains[band_index(band)].target()
    }

    /// Filter one interleaved frame in place.
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        if self.block_pos == 0 {
            self.step_ramps();
        }
        self.block_pos = (self.block_pos + 1) % COEFF_BLOCK_FRAMES;

        for (sample, chain) in frame.iter_mut().zip(self.filters.iter_mut()) {
            for stage in chain.iter_mut() {
                *sample = stage.run(*sample);
            }
        }
    }

    fn step_ramps(&mut self) {
        for (i, band) in Band::ALL.into_iter().enumerate() {
            if !self.gains[i].is_ramping() {
                continue;
            }
            let db = self.gains[i].next();
            let coeffs = band_coefficients(band, db, self.sample_rate);
            for chain in self.filters.iter_mut() {
                chain[i].update_coefficients(coeffs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: StreamFormat = StreamFormat {
        sample_rate: 48_000,
        channels: 1,
    };

    #[test]
    fn test_flat_equalizer_is_transparent() {
        let mut eq = Equalizer::new(FORMAT, [0.0; 3], 0);
        for i in 0..2_000 {
            let x = (i as f32 * 0.05).sin() * 0.8;
            let mut frame = [x];
            eq.process_frame(&mut frame);
            assert!((frame[0] - x).abs() < 1e-4, "sample {} drifted", i);
        }
    }

    #[test]
    fn test_low_shelf_boosts_dc_by_its_gain() {
        let mut stage = DirectForm1::<f32>::new(band_coefficients(Band::Low, 6.0, 48_000));
        let mut y = 0.0;
        for _ in 0..48_000 {
            y = stage.run(1.0);
        }
        let expected = 10f32.powf(6.0 / 20.0);
        assert!((y - expected).abs() < 0.01, "dc gain {} != {}", y, expected);
    }

    #[test]
    fn test_high_shelf_leaves_dc_alone() {
        let mut stage = DirectForm1::<f32>::new(band_coefficients(Band::High, 9.0, 48_000));
        let mut y = 0.0;
        for _ in 0..48_000 {
            y = stage.run(1.0);
        }
        assert!((y - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_ramp_has_no_jumps_and_lands_on_target() {
        let mut gain = SmoothedParam::new(1.0, 100);
        gain.set_target(0.0);
        let mut prev = gain.value();
        for _ in 0..100 {
            let v = gain.next();
            assert!((prev - v).abs() <= 0.0101);
            prev = v;
        }
        assert_eq!(gain.value(), 0.0);
        assert!(!gain.is_ramping());
    }

    #[test]
    fn test_zero_length_ramp_applies_immediately() {
        let mut gain = SmoothedParam::new(0.2, 0);
        gain.set_target(0.9);
        assert_eq!(gain.value(), 0.9);
    }

    #[test]
    fn test_band_gain_change_ramps_in_blocks() {
        let mut eq = Equalizer::new(FORMAT, [0.0; 3], COEFF_BLOCK_FRAMES * 4);
        eq.set_gain(Band::Mid, 12.0);
        assert_eq!(eq.gain_target(Band::Mid), 12.0);
        // one block later the band is part-way there
        for _ in 0..COEFF_BLOCK_FRAMES {
            eq.process_frame(&mut [0.0]);
        }
        let partial = eq.gains[1].value();
        assert!(partial > 0.0 && partial < 12.0);
    }
}
