//! The acquisition loop: pull a fixed number of impulse responses off a running
//! measurement, check each one, and hand the good ones to a processing hook.
//!
//! Timeouts, wrongly sized datasets and sequence gaps are recorded as
//! [`Anomaly`]s and the loop moves on to the next index. Lost data is never
//! re-requested, since the transmit stream cannot be rewound. Only a HAL failure
//! ends the loop early.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::{
    error::{Anomaly, Error},
    hal::{FetchOutcome, Hal, Sample},
    layout::{BufferLayout, IrfView},
    monitoring::Timing,
    process::Process,
    session::Measurement,
};

/// Bookkeeping of one repetition. Only the loop mutates it; the run controller
/// resets it before every repetition.
#[derive(Debug, Clone)]
pub struct AcquisitionState {
    expected_sequence: Sample,
    origin: Instant,
    anomalies: Vec<Anomaly>,
    attempts: usize,
    dispatched: usize,
    fetch_timing: Timing,
    process_timing: Timing,
}

impl Default for AcquisitionState {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionState {
    pub fn new() -> Self {
        Self {
            expected_sequence: 0,
            origin: Instant::now(),
            anomalies: Vec::new(),
            attempts: 0,
            dispatched: 0,
            fetch_timing: Timing::default(),
            process_timing: Timing::default(),
        }
    }

    /// Start over with a sequence baseline of 0 and a fresh time origin
    pub fn reset(&mut self) {
        self.expected_sequence = 0;
        self.origin = Instant::now();
        self.anomalies.clear();
        self.attempts = 0;
        self.dispatched = 0;
        self.fetch_timing = Timing::default();
        self.process_timing = Timing::default();
    }

    /// Sequence number the next dataset should carry
    pub fn expected_sequence(&self) -> Sample {
        self.expected_sequence
    }

    pub fn errors(&self) -> usize {
        self.anomalies.len()
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// Fetches issued, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Impulse responses handed to the processing hook
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn fetch_timing(&self) -> &Timing {
        &self.fetch_timing
    }

    pub fn process_timing(&self) -> &Timing {
        &self.process_timing
    }

    fn record(&mut self, anomaly: Anomaly) {
        warn!("{}", anomaly);
        self.anomalies.push(anomaly);
    }
}

/// Fetches `responses` impulse responses per call to [`AcquisitionLoop::run`]
/// into a buffer sized once from the layout.
#[derive(Debug)]
pub struct AcquisitionLoop {
    layout: BufferLayout,
    responses: usize,
    timeout: Duration,
    buffer: Vec<Sample>,
}

/// Samples and at least one metadata slot are needed to check anything
fn check_layout(layout: &BufferLayout) -> Result<(), Error> {
    if layout.samples_per_receiver == 0
        || layout.oversampling == 0
        || layout.receivers == 0
        || layout.sensors == 0
    {
        return Err(Error::InvalidLayout {
            samples: layout.samples_per_receiver,
            oversampling: layout.oversampling,
        });
    }
    Ok(())
}

impl AcquisitionLoop {
    /// Fails with [`Error::InvalidLayout`] if no dataset could ever pass the
    /// checks, e.g. without a slot for the sequence number.
    pub fn new(layout: BufferLayout, responses: usize, timeout: Duration) -> Result<Self, Error> {
        check_layout(&layout)?;
        Ok(Self {
            buffer: layout.alloc(),
            layout,
            responses,
            timeout,
        })
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Run `responses` fetch attempts against `measurement`.
    ///
    /// Returns early only with [`Error::FatalDevice`]; everything the loop
    /// recovered from is left in `state`.
    pub fn run<H, P>(
        &mut self,
        measurement: &mut Measurement<'_, '_, H>,
        state: &mut AcquisitionState,
        hook: &mut P,
    ) -> Result<(), Error>
    where
        H: Hal,
        P: Process + ?Sized,
    {
        let info = *measurement.info();
        let expected_len = self.layout.len();

        for index in 0..self.responses {
            state.attempts += 1;
            let fetch_start = Instant::now();
            let outcome = measurement
                .fetch(&mut self.buffer, self.timeout)
                .map_err(|source| {
                    error!("Error reading measured data #{}: {}", index, source);
                    Error::FatalDevice {
                        op: "reading measured data",
                        source,
                    }
                })?;
            state.fetch_timing.record(fetch_start.elapsed());

            let count = match outcome {
                FetchOutcome::Ready(count) => count,
                FetchOutcome::TimedOut => {
                    state.record(Anomaly::FetchTimeout {
                        index,
                        timeout: self.timeout,
                    });
                    continue;
                }
            };

            // Never reinterpret a short or long dataset
            let irf = if count == expected_len {
                IrfView::new(&self.layout, &self.buffer)
            } else {
                None
            };
            let irf = match irf {
                Some(irf) => irf,
                None => {
                    state.record(Anomaly::SizeMismatch {
                        index,
                        got: count,
                        expected: expected_len,
                    });
                    continue;
                }
            };

            let sequence = irf.sequence_number();
            let expected = state.expected_sequence;
            // On a gap, adopt the device's numbering as the new baseline
            state.expected_sequence = sequence.wrapping_add(1);
            if sequence != expected {
                state.record(Anomaly::SequenceGap {
                    index,
                    got: sequence,
                    expected,
                });
                continue;
            }

            info!(
                "Received impulse response #{} with sequence number {} after {} ms.",
                index,
                sequence,
                state.elapsed().as_millis()
            );
            let process_start = Instant::now();
            hook.process(&info, self.layout.sensors, irf);
            let took = process_start.elapsed();
            state.process_timing.record(took);
            state.dispatched += 1;
            debug!(
                "Processing of impulse response #{} took {} ms.",
                index,
                took.as_millis()
            );
        }
        Ok(())
    }
}
