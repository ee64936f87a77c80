//! Test signals fed into simulated buffer groups.

use std::f64::consts::TAU;

/// Produces samples for the buffer groups of one I/O cycle.
pub trait SignalSource: Send {
    /// Fill `out` with interleaved samples for `channels` channels.
    ///
    /// `group` 0 is the tap stream, 1 the input device.
    fn fill(&mut self, group: usize, channels: u32, out: &mut [f32]);
}

/// Independent sine per group, continuous across cycles.
#[derive(Debug, Clone)]
pub struct SineSource {
    sample_rate: f64,
    frequencies: [f64; 2],
    amplitude: f32,
    phase: [f64; 2],
}

impl SineSource {
    pub fn new(sample_rate: f64, tap_hz: f64, input_hz: f64, amplitude: f32) -> Self {
        Self {
            sample_rate,
            frequencies: [tap_hz, input_hz],
            amplitude,
            phase: [0.0; 2],
        }
    }
}

impl SignalSource for SineSource {
    fn fill(&mut self, group: usize, channels: u32, out: &mut [f32]) {
        let slot = group.min(1);
        let step = TAU * self.frequencies[slot] / self.sample_rate;
        let channels = channels.max(1) as usize;

        for frame in out.chunks_mut(channels) {
            let value = self.amplitude * self.phase[slot].sin() as f32;
            frame.iter_mut().for_each(|s| *s = value);
            self.phase[slot] = (self.phase[slot] + step) % TAU;
        }
    }
}

/// Every sample of group `n` equals `values[n]`.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSource {
    pub values: [f32; 2],
}

impl ConstantSource {
    pub fn new(tap: f32, input: f32) -> Self {
        Self { values: [tap, input] }
    }
}

impl SignalSource for ConstantSource {
    fn fill(&mut self, group: usize, _channels: u32, out: &mut [f32]) {
        out.fill(self.values[group.min(1)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_stays_within_amplitude_and_is_continuous() {
        let mut source = SineSource::new(48000.0, 440.0, 220.0, 0.8);
        let mut a = vec![0.0f32; 960];
        let mut b = vec![0.0f32; 960];
        source.fill(0, 2, &mut a);
        source.fill(0, 2, &mut b);

        assert!(a.iter().chain(&b).all(|s| s.abs() <= 0.8 + 1e-6));
        assert_eq!(a[0], 0.0);
        // Channels carry the same value.
        assert_eq!(a[10], a[11]);
        // Second block continues rather than restarting at zero.
        assert_ne!(b[0], 0.0);
    }

    #[test]
    fn constant_source_per_group() {
        let mut source = ConstantSource::new(0.25, -0.5);
        let mut out = [1.0f32; 4];
        source.fill(1, 1, &mut out);
        assert_eq!(out, [-0.5; 4]);
        source.fill(0, 2, &mut out);
        assert_eq!(out, [0.25; 4]);
    }
}
