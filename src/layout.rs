//! Sample buffer geometry
//!
//! One fetch returns, for every sensor and every receiver, the measured samples
//! followed by `oversampling` metadata slots:
//!
//! ```text
//! [ S1 Rx1 samples | S1 Rx1 meta | S1 Rx2 samples | S1 Rx2 meta | S2 Rx1 ... ]
//! ```
//!
//! The first metadata slot of the first receiver of the first sensor carries the
//! per-fetch sequence number.

use crate::hal::{Sample, SensorInfo};

/// Expected shape of one dataset, derived from the effective sensor info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub samples_per_receiver: usize,
    pub oversampling: usize,
    pub receivers: usize,
    pub sensors: usize,
}

impl BufferLayout {
    /// Layout for `sensors` identically configured sensors described by `info`.
    /// Must be rebuilt whenever the configuration changes.
    pub fn new(info: &SensorInfo, sensors: usize) -> Self {
        Self {
            samples_per_receiver: info.samples_per_receiver as usize,
            oversampling: info.config.oversampling as usize,
            receivers: info.config.receivers as usize,
            sensors,
        }
    }

    /// Elements belonging to one receiver, metadata included
    pub fn receiver_stride(&self) -> usize {
        self.samples_per_receiver + self.oversampling
    }

    pub fn sensor_stride(&self) -> usize {
        self.receivers * self.receiver_stride()
    }

    /// Total number of elements of one fetch
    pub fn len(&self) -> usize {
        self.sensors * self.sensor_stride()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the sequence number slot
    pub fn sequence_offset(&self) -> usize {
        self.samples_per_receiver
    }

    /// Zeroed buffer of exactly [`Self::len`] elements
    pub fn alloc(&self) -> Vec<Sample> {
        vec![0; self.len()]
    }

    fn receiver_start(&self, sensor: usize, rx: usize) -> Option<usize> {
        (sensor < self.sensors && rx < self.receivers)
            .then(|| sensor * self.sensor_stride() + rx * self.receiver_stride())
    }
}

/// A dataset whose length has been checked against its layout
#[derive(Debug, Clone, Copy)]
pub struct IrfView<'a> {
    layout: BufferLayout,
    data: &'a [Sample],
}

impl<'a> IrfView<'a> {
    /// `None` unless `data` is exactly as long as the layout demands
    pub fn new(layout: &BufferLayout, data: &'a [Sample]) -> Option<Self> {
        (data.len() == layout.len() && layout.oversampling > 0 && !layout.is_empty()).then(|| Self {
            layout: *layout,
            data,
        })
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Sequence number stamped by the device into the first metadata slot
    pub fn sequence_number(&self) -> Sample {
        self.data[self.layout.sequence_offset()]
    }

    /// Measured samples of one receiver, metadata excluded
    pub fn signal(&self, sensor: usize, rx: usize) -> Option<&'a [Sample]> {
        let start = self.layout.receiver_start(sensor, rx)?;
        Some(&self.data[start..start + self.layout.samples_per_receiver])
    }

    /// Metadata slots trailing one receiver's samples
    pub fn metadata(&self, sensor: usize, rx: usize) -> Option<&'a [Sample]> {
        let start = self.layout.receiver_start(sensor, rx)? + self.layout.samples_per_receiver;
        Some(&self.data[start..start + self.layout.oversampling])
    }

    pub fn as_slice(&self) -> &'a [Sample] {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SensorConfig;

    fn info(samples: u32, ov: u32, rx: u32) -> SensorInfo {
        SensorInfo {
            config: SensorConfig {
                oversampling: ov,
                receivers: rx,
                ..Default::default()
            },
            samples_per_receiver: samples,
            ..Default::default()
        }
    }

    #[test]
    fn buffer_size() {
        assert_eq!(BufferLayout::new(&info(511, 1, 2), 1).len(), 2 * (511 + 1));
        assert_eq!(BufferLayout::new(&info(1022, 2, 2), 1).len(), 2 * (1022 + 2));
        assert_eq!(BufferLayout::new(&info(4095, 1, 1), 1).len(), 4096);
        assert_eq!(BufferLayout::new(&info(511, 1, 2), 3).len(), 3 * 2 * 512);
    }

    #[test]
    fn size_follows_clamped_config() {
        let before = BufferLayout::new(&info(511, 1, 2), 1);
        let after = BufferLayout::new(&info(32767, 1, 2), 1);
        assert_ne!(before.len(), after.len());
        assert_eq!(after.len(), 2 * 32768);
    }

    #[test]
    fn view_requires_exact_length() {
        let layout = BufferLayout::new(&info(4, 1, 2), 1);
        let buf = vec![0; layout.len() - 1];
        assert!(IrfView::new(&layout, &buf).is_none());
        let buf = vec![0; layout.len() + 1];
        assert!(IrfView::new(&layout, &buf).is_none());
        let buf = layout.alloc();
        assert!(IrfView::new(&layout, &buf).is_some());
    }

    #[test]
    fn view_slots() {
        // 2 receivers, 4 samples and 2 metadata slots each
        let layout = BufferLayout::new(&info(4, 2, 2), 1);
        let buf: Vec<Sample> = vec![1, 2, 3, 4, 77, 0, 5, 6, 7, 8, -1, -2];
        let view = IrfView::new(&layout, &buf).unwrap();
        assert_eq!(view.layout(), &layout);
        assert_eq!(view.sequence_number(), 77);
        assert_eq!(view.signal(0, 0).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(view.metadata(0, 0).unwrap(), &[77, 0]);
        assert_eq!(view.signal(0, 1).unwrap(), &[5, 6, 7, 8]);
        assert_eq!(view.metadata(0, 1).unwrap(), &[-1, -2]);
        assert!(view.signal(0, 2).is_none());
        assert!(view.signal(1, 0).is_none());
    }
}
