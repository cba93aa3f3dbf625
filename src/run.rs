//! Repeated acquisition runs on one armed sensor

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::{
    acquire::{AcquisitionLoop, AcquisitionState},
    error::Error,
    hal::{Hal, RunMode},
    layout::BufferLayout,
    monitoring::rate,
    process::Process,
    session::Session,
};

/// What a run looks like, built once from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// Number of start → acquire → stop cycles, at least 1
    pub repeat_count: u32,
    /// Fetch attempts per cycle
    pub responses: usize,
    /// Deadline of a single fetch
    pub timeout: Duration,
    pub mode: RunMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repeat_count: 1,
            responses: 10,
            timeout: Duration::from_millis(500),
            mode: RunMode::Buffered,
        }
    }
}

/// Totals over every repetition run so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Repetitions that ran to completion
    pub repetitions: u32,
    pub dispatched: usize,
    /// Recoverable errors, including those of a repetition cut short
    pub errors: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

pub struct RunController {
    config: RunConfig,
    state: AcquisitionState,
    summary: RunSummary,
}

impl RunController {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            state: AcquisitionState::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Cumulative error count. Survives a fatal abort.
    pub fn total_errors(&self) -> usize {
        self.summary.errors
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// State of the most recent repetition
    pub fn state(&self) -> &AcquisitionState {
        &self.state
    }

    /// Run all repetitions on a configured, armed session.
    ///
    /// Recoverable errors never stop the outer loop. A fatal device error
    /// returns immediately, after its repetition's errors were added to the
    /// totals.
    pub fn run<H, P>(
        &mut self,
        session: &mut Session<'_, H>,
        hook: &mut P,
    ) -> Result<RunSummary, Error>
    where
        H: Hal,
        P: Process + ?Sized,
    {
        let info = *session.info().ok_or(Error::NotConfigured)?;
        let mut acquisition = AcquisitionLoop::new(
            BufferLayout::new(&info, 1),
            self.config.responses,
            self.config.timeout,
        )?;
        let layout = acquisition.layout();
        debug!(?layout, elements = layout.len(), "buffer layout");
        for repetition in 1..=self.config.repeat_count.max(1) {
            info!("--- Starting test run #{} ---", repetition);
            self.state.reset();
            let started = Instant::now();

            let state = &mut self.state;
            let result = session.start(self.config.mode).and_then(|mut measurement| {
                acquisition.run(&mut measurement, state, hook)?;
                measurement.stop()
            });

            let took = started.elapsed();
            self.summary.errors += self.state.errors();
            self.summary.dispatched += self.state.dispatched();
            self.summary.elapsed += took;
            result?;
            self.summary.repetitions += 1;

            info!(
                "Read {} impulse responses with {} error(s) in {:.3} seconds ({:.1} IRF/s).",
                self.state.dispatched(),
                self.state.errors(),
                took.as_secs_f64(),
                rate(self.state.dispatched(), took)
            );
            debug!("fetch timing: {}", self.state.fetch_timing());
            debug!("processing timing: {}", self.state.process_timing());
        }
        Ok(self.summary.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hal::{status, HalError, HalLogLevel, Sample, SensorConfig, SensorId},
        process::from_fn,
        session::Driver,
        sim::{Call, Event, SimulatedHal},
    };

    const S1: SensorId = SensorId(1);

    fn config(repeat_count: u32, responses: usize) -> RunConfig {
        RunConfig {
            repeat_count,
            responses,
            timeout: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn count(hal: &SimulatedHal, call: Call) -> usize {
        hal.calls().iter().filter(|c| **c == call).count()
    }

    #[test]
    fn defaults() {
        let c = RunConfig::default();
        assert_eq!(c.repeat_count, 1);
        assert_eq!(c.responses, 10);
        assert_eq!(c.timeout, Duration::from_millis(500));
        assert_eq!(c.mode, RunMode::Buffered);
    }

    #[test]
    fn repeats_full_cycle() {
        let mut driver = Driver::init(SimulatedHal::new(1), HalLogLevel::None).unwrap();
        let mut seen: Vec<Sample> = Vec::new();
        let mut controller = RunController::new(config(3, 4));
        let summary = {
            let mut session = driver.open(S1).unwrap();
            session.configure(&SensorConfig::default()).unwrap();
            let mut hook = from_fn(|_, _, irf| seen.push(irf.sequence_number()));
            controller.run(&mut session, &mut hook).unwrap()
        };
        assert_eq!(count(driver.hal(), Call::Start), 3);
        assert_eq!(count(driver.hal(), Call::Stop), 3);
        assert_eq!(count(driver.hal(), Call::Fetch), 12);
        // Each repetition starts from sequence 0 again without a gap
        assert!(summary.is_clean());
        assert_eq!(summary.repetitions, 3);
        assert_eq!(summary.dispatched, 12);
        assert_eq!(seen, [0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(controller.state().expected_sequence(), 4);
        assert_eq!(controller.state().dispatched(), 4);
        assert_eq!(controller.config().repeat_count, 3);
    }

    #[test]
    fn recoverable_errors_do_not_stop_repeating() {
        let hal = SimulatedHal::new(1).with_script([Event::Irf, Event::Stall]);
        let mut driver = Driver::init(hal, HalLogLevel::None).unwrap();
        let mut controller = RunController::new(config(2, 3));
        let summary = {
            let mut session = driver.open(S1).unwrap();
            session.configure(&SensorConfig::default()).unwrap();
            controller.run(&mut session, &mut crate::process::NoProcessing).unwrap()
        };
        assert_eq!(summary.repetitions, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.dispatched, 5);
        assert!(!summary.is_clean());
    }

    #[test]
    fn fatal_error_keeps_earlier_errors() {
        let script = [
            // First repetition: one timeout
            Event::Stall,
            Event::Irf,
            Event::Irf,
            // Second repetition: one timeout, then the device goes away
            Event::Stall,
            Event::Fault(status::IO),
        ];
        let hal = SimulatedHal::new(1).with_script(script);
        let mut driver = Driver::init(hal, HalLogLevel::None).unwrap();
        let mut controller = RunController::new(config(3, 3));
        let result = {
            let mut session = driver.open(S1).unwrap();
            session.configure(&SensorConfig::default()).unwrap();
            controller.run(&mut session, &mut crate::process::NoProcessing)
        };
        assert!(matches!(
            result,
            Err(Error::FatalDevice {
                source: HalError(status::IO),
                ..
            })
        ));
        assert_eq!(controller.total_errors(), 2);
        assert_eq!(controller.summary().repetitions, 1);
        assert_eq!(controller.summary().dispatched, 2);
        // No third repetition; the aborted one is still stopped
        assert_eq!(count(driver.hal(), Call::Start), 2);
        assert_eq!(count(driver.hal(), Call::Stop), 2);
        assert_eq!(count(driver.hal(), Call::Fetch), 5);
    }

    #[test]
    fn start_failure_is_fatal() {
        let mut hal = SimulatedHal::new(1);
        hal.fail_next(Call::Start, status::BUSY);
        let mut driver = Driver::init(hal, HalLogLevel::None).unwrap();
        let mut session = driver.open(S1).unwrap();
        session.configure(&SensorConfig::default()).unwrap();
        let mut controller = RunController::new(config(2, 3));
        let result = controller.run(&mut session, &mut crate::process::NoProcessing);
        assert!(matches!(result, Err(Error::FatalDevice { .. })));
        assert_eq!(controller.total_errors(), 0);
    }

    #[test]
    fn requires_configured_session() {
        let mut driver = Driver::init(SimulatedHal::new(1), HalLogLevel::None).unwrap();
        let mut session = driver.open(S1).unwrap();
        let mut controller = RunController::new(RunConfig::default());
        let result = controller.run(&mut session, &mut crate::process::NoProcessing);
        assert!(matches!(result, Err(Error::NotConfigured)));
    }

    #[test]
    fn zero_repeats_run_once() {
        let mut driver = Driver::init(SimulatedHal::new(1), HalLogLevel::None).unwrap();
        let mut controller = RunController::new(config(0, 1));
        {
            let mut session = driver.open(S1).unwrap();
            session.configure(&SensorConfig::default()).unwrap();
            controller.run(&mut session, &mut crate::process::NoProcessing).unwrap();
        }
        assert_eq!(count(driver.hal(), Call::Start), 1);
    }
}
