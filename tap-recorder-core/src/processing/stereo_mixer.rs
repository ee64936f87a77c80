use crate::models::hal::AudioBuffer;

/// Channels in the mixed output.
pub const MIX_OUTPUT_CHANNELS: u32 = 2;

/// Attenuation applied to the secondary stream before it is added.
pub const SECONDARY_GAIN: f32 = 0.5;

/// Real-time stereo mixer for the two buffer groups of an aggregate device.
///
/// Output format: interleaved stereo `[L0, R0, L1, R1, ...]`.
/// `L[i] = primary_L[i] + gain * secondary_L[i]`, and likewise for R.
/// Mono groups fan out to both channels. Nothing is clamped, so the sum may
/// leave [-1, 1].
#[derive(Debug, Clone, Copy)]
pub struct StereoMixer {
    pub secondary_gain: f32,
}

impl Default for StereoMixer {
    fn default() -> Self {
        Self::new(SECONDARY_GAIN)
    }
}

impl StereoMixer {
    pub fn new(secondary_gain: f32) -> Self {
        Self { secondary_gain }
    }

    /// Frames both groups can supply.
    pub fn usable_frames(primary: &AudioBuffer<'_>, secondary: &AudioBuffer<'_>) -> usize {
        primary.frame_count().min(secondary.frame_count())
    }

    /// Mix into a caller-provided interleaved stereo buffer without allocating.
    ///
    /// Processes `min(primary frames, secondary frames, out.len() / 2)` frames
    /// and returns that count.
    pub fn mix_into(&self, primary: &AudioBuffer<'_>, secondary: &AudioBuffer<'_>, out: &mut [f32]) -> usize {
        let channels = MIX_OUTPUT_CHANNELS as usize;
        let frames = Self::usable_frames(primary, secondary).min(out.len() / channels);

        for frame in 0..frames {
            for ch in 0..channels {
                out[frame * channels + ch] = primary.sample(frame, ch);
            }
        }

        // Multiply-add the secondary stream over the same range.
        for frame in 0..frames {
            for ch in 0..channels {
                out[frame * channels + ch] += secondary.sample(frame, ch) * self.secondary_gain;
            }
        }

        frames
    }

    /// Mix the first two groups of an I/O delivery into a new buffer.
    ///
    /// Returns `None` when fewer than two groups were delivered.
    pub fn mix(&self, groups: &[AudioBuffer<'_>]) -> Option<Vec<f32>> {
        let [primary, secondary, ..] = groups else {
            return None;
        };
        let frames = Self::usable_frames(primary, secondary);
        let mut out = vec![0.0f32; frames * MIX_OUTPUT_CHANNELS as usize];
        self.mix_into(primary, secondary, &mut out);
        Some(out)
    }

    /// Compute RMS level of samples (0.0–1.0 range for normalized audio).
    pub fn rms_level(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    /// Compute peak absolute level of samples.
    pub fn peak_level(samples: &[f32]) -> f32 {
        samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn mono_constants_mix_to_a_plus_half_b() {
        let mixer = StereoMixer::default();
        let primary = vec![0.4f32; 256];
        let secondary = vec![0.6f32; 256];

        let out = mixer
            .mix(&[AudioBuffer::new(1, &primary), AudioBuffer::new(1, &secondary)])
            .unwrap();

        assert_eq!(out.len(), 512);
        for sample in out {
            assert_abs_diff_eq!(sample, 0.4 + 0.5 * 0.6, epsilon = 1e-6);
        }
    }

    #[test]
    fn stereo_groups_keep_channels_apart() {
        let mixer = StereoMixer::default();
        let primary = [0.1f32, 0.2, 0.3, 0.4];
        let secondary = [1.0f32, -1.0, 0.5, -0.5];

        let out = mixer
            .mix(&[AudioBuffer::new(2, &primary), AudioBuffer::new(2, &secondary)])
            .unwrap();

        assert_abs_diff_eq!(out[0], 0.1 + 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], 0.2 - 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(out[2], 0.3 + 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(out[3], 0.4 - 0.25, epsilon = 1e-6);
    }

    #[test]
    fn stereo_primary_with_mono_secondary() {
        let mixer = StereoMixer::default();
        let primary = [0.1f32, 0.2];
        let secondary = [0.8f32];

        let out = mixer
            .mix(&[AudioBuffer::new(2, &primary), AudioBuffer::new(1, &secondary)])
            .unwrap();

        assert_abs_diff_eq!(out[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], 0.6, epsilon = 1e-6);
    }

    #[test]
    fn unequal_lengths_process_the_shorter_group() {
        let mixer = StereoMixer::default();
        let primary = vec![0.25f32; 480];
        let secondary = vec![0.5f32; 2 * 300];

        let out = mixer
            .mix(&[AudioBuffer::new(1, &primary), AudioBuffer::new(2, &secondary)])
            .unwrap();
        assert_eq!(out.len(), 300 * 2);

        // And the other way round, into an oversized scratch buffer.
        let mut scratch = vec![9.0f32; 2048];
        let frames = mixer.mix_into(&AudioBuffer::new(2, &secondary), &AudioBuffer::new(1, &primary), &mut scratch);
        assert_eq!(frames, 300);
        assert_eq!(scratch[600], 9.0);
    }

    #[test]
    fn mix_into_respects_output_capacity() {
        let mixer = StereoMixer::default();
        let primary = vec![0.1f32; 64];
        let secondary = vec![0.1f32; 64];
        let mut out = vec![0.0f32; 20];

        let frames = mixer.mix_into(&AudioBuffer::new(1, &primary), &AudioBuffer::new(1, &secondary), &mut out);

        assert_eq!(frames, 10);
    }

    #[test]
    fn fewer_than_two_groups_is_none() {
        let mixer = StereoMixer::default();
        let primary = [0.1f32; 8];
        assert!(mixer.mix(&[]).is_none());
        assert!(mixer.mix(&[AudioBuffer::new(1, &primary)]).is_none());
    }

    #[test]
    fn no_clamping_beyond_unit_range() {
        let mixer = StereoMixer::default();
        let primary = [1.0f32; 4];
        let secondary = [1.0f32; 4];

        let out = mixer
            .mix(&[AudioBuffer::new(1, &primary), AudioBuffer::new(1, &secondary)])
            .unwrap();

        assert!(out.iter().all(|&s| (s - 1.5).abs() < 1e-6));
    }

    #[test]
    fn rms_level_full_scale() {
        let rms = StereoMixer::rms_level(&[1.0, 1.0, 1.0]);
        assert_abs_diff_eq!(rms, 1.0, epsilon = 1e-6);
        assert_eq!(StereoMixer::rms_level(&[]), 0.0);
    }

    #[test]
    fn peak_level_basic() {
        assert_abs_diff_eq!(StereoMixer::peak_level(&[0.1, -0.5, 0.3]), 0.5, epsilon = 1e-6);
    }
}
