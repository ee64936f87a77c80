//! Value types exchanged with the audio HAL gateway.

use super::stream::{StreamDescription, SAMPLE_SIZE};

/// Raw HAL object identifier.
pub type ObjectId = u32;

/// Which processes a tap listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapFilter {
    /// Sentinel meaning "no process filter": the whole system mix.
    AllProcesses,
    /// Only the listed HAL process objects.
    Processes(Vec<ObjectId>),
}

/// Request for a new process tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapDescription {
    /// Fresh per activation so a stale tap from an earlier activation never collides.
    pub uid: String,
    pub name: String,
    pub filter: TapFilter,
    pub mono: bool,
    pub private: bool,
    pub muted: bool,
}

/// A live tap. Not `Clone`: destroying the tap consumes the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct TapHandle {
    pub object_id: ObjectId,
    pub uid: String,
}

/// A physical device resolved from the HAL defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub object_id: ObjectId,
    pub uid: String,
}

/// Sub-tap entry of an aggregate device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTap {
    pub uid: String,
    pub drift_compensation: bool,
}

/// Sub-device entry of an aggregate device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDevice {
    pub uid: String,
    pub drift_compensation: bool,
}

/// Descriptor for a private aggregate device combining a tap with real devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDeviceDescription {
    pub uid: String,
    pub name: String,
    /// UID of the clock source.
    pub main_sub_device: String,
    pub sub_devices: Vec<SubDevice>,
    pub taps: Vec<SubTap>,
    pub is_private: bool,
    pub is_stacked: bool,
    pub tap_auto_start: bool,
}

/// A live aggregate device. Not `Clone` for the same reason as [`TapHandle`].
#[derive(Debug, PartialEq, Eq)]
pub struct AggregateDeviceHandle {
    pub object_id: ObjectId,
    pub uid: String,
}

/// Identifier of a registered I/O proc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoProcId(pub u64);

/// Object whose stream description is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalObject {
    Tap(ObjectId),
    Device(ObjectId),
}

/// Property scope for stream description reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Input,
    Output,
}

/// One buffer group delivered to the I/O callback.
///
/// `data` holds interleaved float32 samples for `channels` channels.
#[derive(Debug, Clone, Copy)]
pub struct AudioBuffer<'a> {
    pub channels: u32,
    pub data: &'a [f32],
}

impl<'a> AudioBuffer<'a> {
    pub fn new(channels: u32, data: &'a [f32]) -> Self {
        Self { channels, data }
    }

    /// Size of the payload in bytes, as the HAL reports it.
    pub fn byte_size(&self) -> usize {
        self.data.len() * SAMPLE_SIZE
    }

    /// Whole frames available: byte size / (channels * sample size).
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.byte_size() / (self.channels as usize * SAMPLE_SIZE)
    }

    /// Sample of `channel` at `frame`, or the first channel when the group is mono.
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        let channels = self.channels as usize;
        let ch = if channels >= 2 { channel } else { 0 };
        self.data[frame * channels + ch]
    }
}

/// Negotiated format of an activated tap, with where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiatedFormat {
    pub description: StreamDescription,
    pub from_aggregate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_from_byte_size() {
        let data = [0.0f32; 10];
        assert_eq!(AudioBuffer::new(2, &data).frame_count(), 5);
        assert_eq!(AudioBuffer::new(1, &data).frame_count(), 10);
        // Partial trailing frame is ignored.
        assert_eq!(AudioBuffer::new(3, &data).frame_count(), 3);
        assert_eq!(AudioBuffer::new(0, &data).frame_count(), 0);
    }

    #[test]
    fn mono_sample_fans_out() {
        let data = [0.25f32, 0.5];
        let buf = AudioBuffer::new(1, &data);
        assert_eq!(buf.sample(1, 0), 0.5);
        assert_eq!(buf.sample(1, 1), 0.5);
    }
}
