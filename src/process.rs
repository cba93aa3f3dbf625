//! Hooks that receive every validated impulse response
//!
//! Whatever a hook does with the data is its own business: it cannot fail the
//! acquisition, and its errors never count towards the run's error total.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use byte_slice_cast::AsByteSlice;
use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, error, info};

use crate::{hal::SensorInfo, layout::IrfView};

pub trait Process {
    fn process(&mut self, info: &SensorInfo, sensors: usize, irf: IrfView<'_>);
}

/// Hook backed by a closure, see [`from_fn`]
pub struct FnHook<F>(F);

/// Wrap a closure as a [`Process`] hook
pub fn from_fn<F>(f: F) -> FnHook<F>
where
    F: FnMut(&SensorInfo, usize, IrfView<'_>),
{
    FnHook(f)
}

impl<F> Process for FnHook<F>
where
    F: FnMut(&SensorInfo, usize, IrfView<'_>),
{
    fn process(&mut self, info: &SensorInfo, sensors: usize, irf: IrfView<'_>) {
        (self.0)(info, sensors, irf)
    }
}

/// Placeholder for real signal processing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProcessing;

impl Process for NoProcessing {
    fn process(&mut self, _info: &SensorInfo, _sensors: usize, irf: IrfView<'_>) {
        debug!(
            sequence = irf.sequence_number(),
            elements = irf.layout().len(),
            "<no processing defined>"
        );
    }
}

/// Convert a chrono DateTime into a filename-friendly timestamp
fn file_timestamp(time: &DateTime<Utc>) -> String {
    format!(
        "{}-{:02}-{:02}-{:02}:{:02}:{:02}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// Appends the raw bytes (native-endian samples, metadata included) of every
/// impulse response to a sink
pub struct RawWriter<W: Write> {
    sink: W,
    written: usize,
    failures: usize,
}

impl<W: Write> RawWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            written: 0,
            failures: 0,
        }
    }

    /// Impulse responses written so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Impulse responses that could not be written
    pub fn failures(&self) -> usize {
        self.failures
    }
}

impl RawWriter<BufWriter<File>> {
    /// Create `irf-<timestamp>.raw` in `dir`
    pub fn create_in(dir: &Path) -> std::io::Result<(Self, PathBuf)> {
        let path = dir.join(format!("irf-{}.raw", file_timestamp(&Utc::now())));
        let file = File::create(&path)?;
        info!("Writing impulse responses to {}", path.display());
        Ok((Self::new(BufWriter::new(file)), path))
    }
}

impl<W: Write> Process for RawWriter<W> {
    fn process(&mut self, _info: &SensorInfo, _sensors: usize, irf: IrfView<'_>) {
        match self.sink.write_all(irf.as_slice().as_byte_slice()) {
            Ok(()) => self.written += 1,
            Err(e) => {
                self.failures += 1;
                error!(
                    "Could not write impulse response with sequence number {}: {}",
                    irf.sequence_number(),
                    e
                );
            }
        }
    }
}

impl<W: Write> Drop for RawWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.sink.flush() {
            error!("Could not flush impulse response dump: {}", e);
        }
    }
}
