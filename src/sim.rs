//! An in-process stand-in for the sensor HAL
//!
//! The simulator behaves like a small bank of identical sensors: it clamps
//! requested configuration the way the hardware does, enforces open/run state,
//! and stamps a sequence number into every dataset. Fetches follow a script of
//! [`Event`]s so tests can inject timeouts, short buffers, lost datasets and
//! link faults at exact positions; once the script is exhausted every fetch
//! yields a regular impulse response.

use std::{collections::VecDeque, thread, time::Duration};

use tracing::trace;

use crate::{
    hal::{
        status, FetchOutcome, Hal, HalError, HalLogLevel, Role, RunMode, Sample, SensorConfig,
        SensorId, SensorInfo, Synch, TxPower, Version,
    },
    layout::BufferLayout,
};

const HARDWARE_AVERAGES: u32 = 256;
const SOFTWARE_AVERAGE_LIMITS: [u32; 2] = [1, 4096];
const WAIT_CYCLE_LIMITS: [u32; 2] = [0, 255];

/// HAL entry points, as recorded in the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Init,
    Deinit,
    Version,
    SetLogLevel,
    Open,
    Close,
    ModuleId,
    ModuleInfo,
    Setup,
    SetRole(Role),
    Synchronize(Synch),
    ResetMlbs,
    SetAverages,
    SetPower(TxPower),
    Start,
    Stop,
    Fetch,
}

/// What the next fetch does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A complete, in-sequence dataset
    Irf,
    /// Nothing arrives before the deadline
    Stall,
    /// A dataset whose reported element count is off
    Resized(usize),
    /// The device lost this many datasets before the next one
    Skip(u32),
    /// The call fails with this status
    Fault(i32),
}

#[derive(Debug, Clone)]
struct SimSensor {
    name: String,
    open: bool,
    config: SensorConfig,
    role: Role,
    synched: bool,
    tx: TxPower,
    software_averages: u32,
    wait_cycles: u32,
    running: bool,
}

impl SimSensor {
    fn new(name: String) -> Self {
        Self {
            name,
            open: false,
            config: effective(&SensorConfig::default()),
            role: Role::Slave,
            synched: false,
            tx: TxPower::Off,
            software_averages: 32,
            wait_cycles: 0,
            running: false,
        }
    }

    fn info(&self) -> SensorInfo {
        let c = self.config;
        SensorInfo {
            config: c,
            samples_per_receiver: ((1u32 << c.mlbs_order) - 1) * c.oversampling,
            hardware_averages: HARDWARE_AVERAGES,
            software_averages: self.software_averages,
            software_average_limits: SOFTWARE_AVERAGE_LIMITS,
            wait_cycles: self.wait_cycles,
            wait_cycle_limits: WAIT_CYCLE_LIMITS,
            full_scale_range: [-0.5, 0.5],
            lsb_volts: 1.0 / (1 << 20) as f64,
            timebase_corner: 0.0,
            temperature: 38.5,
        }
    }
}

/// Apply device defaults and limits to a requested configuration
fn effective(requested: &SensorConfig) -> SensorConfig {
    let or_default = |v: u32, default: u32| if v == 0 { default } else { v };
    SensorConfig {
        clock_ghz: requested.clock_ghz.clamp(0.1, 18.0),
        mlbs_order: match requested.mlbs_order {
            0..=10 => 9,
            11..=13 => 12,
            _ => 15,
        },
        divider: or_default(requested.divider, 1),
        oversampling: or_default(requested.oversampling, 1).min(8),
        transmitters: or_default(requested.transmitters, 1).min(1),
        receivers: or_default(requested.receivers, 2).min(2),
    }
}

/// Deterministic sample pattern
fn sample(n: usize, sequence: Sample) -> Sample {
    ((n as i64 * 37 + sequence as i64 * 11).rem_euclid(2001) - 1000) as Sample
}

#[derive(Debug)]
pub struct SimulatedHal {
    sensors: Vec<SimSensor>,
    initialised: bool,
    log_level: HalLogLevel,
    script: VecDeque<Event>,
    sequence: Sample,
    failures: Vec<(Call, i32)>,
    calls: Vec<Call>,
    irf_period: Option<Duration>,
}

impl SimulatedHal {
    /// A bank of `count` sensors
    pub fn new(count: usize) -> Self {
        Self {
            sensors: (1..=count)
                .map(|n| SimSensor::new(format!("SIM-UWB-{:04}", n)))
                .collect(),
            initialised: false,
            log_level: HalLogLevel::default(),
            script: VecDeque::new(),
            sequence: 0,
            failures: Vec::new(),
            calls: Vec::new(),
            irf_period: None,
        }
    }

    /// Pace datasets in real time. Stalls then really wait for the full timeout.
    pub fn with_irf_period(mut self, period: Duration) -> Self {
        self.irf_period = Some(period);
        self
    }

    pub fn with_script(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.push_events(events);
        self
    }

    pub fn push_events(&mut self, events: impl IntoIterator<Item = Event>) {
        self.script.extend(events);
    }

    /// Fail the next call matching `call` with `code`
    pub fn fail_next(&mut self, call: Call, code: i32) {
        self.failures.push((call, code));
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn log_level(&self) -> HalLogLevel {
        self.log_level
    }

    pub fn is_open(&self, id: SensorId) -> bool {
        self.sensor(id).map_or(false, |s| s.open)
    }

    pub fn role(&self, id: SensorId) -> Option<Role> {
        self.sensor(id).map(|s| s.role)
    }

    pub fn is_running(&self, id: SensorId) -> bool {
        self.sensor(id).map_or(false, |s| s.running)
    }

    pub fn is_transmitting(&self, id: SensorId) -> bool {
        self.sensor(id).map_or(false, |s| s.tx == TxPower::On)
    }

    fn sensor(&self, id: SensorId) -> Option<&SimSensor> {
        (id.get() as usize)
            .checked_sub(1)
            .and_then(|i| self.sensors.get(i))
    }

    /// Record the call, then apply any pending injected failure
    fn enter(&mut self, call: Call) -> Result<(), HalError> {
        trace!(?call, "simulated HAL call");
        self.calls.push(call);
        if !self.initialised && call != Call::Init {
            return Err(HalError(status::STATE));
        }
        if let Some(pos) = self.failures.iter().position(|(c, _)| *c == call) {
            let (_, code) = self.failures.remove(pos);
            return Err(HalError(code));
        }
        Ok(())
    }

    fn index(&self, id: SensorId) -> Result<usize, HalError> {
        let idx = (id.get() as usize)
            .checked_sub(1)
            .ok_or(HalError(status::INVALID_PARAM))?;
        if idx < self.sensors.len() {
            Ok(idx)
        } else {
            Err(HalError(status::INVALID_PARAM))
        }
    }

    /// Apply `f` to every listed sensor, which must be open and idle
    fn each_idle(
        &mut self,
        sensors: &[SensorId],
        mut f: impl FnMut(&mut SimSensor) -> Result<(), HalError>,
    ) -> Result<(), HalError> {
        let idx = sensors
            .iter()
            .map(|&id| self.index(id))
            .collect::<Result<Vec<_>, _>>()?;
        if idx
            .iter()
            .any(|&i| !self.sensors[i].open || self.sensors[i].running)
        {
            return Err(HalError(status::STATE));
        }
        for i in idx {
            f(&mut self.sensors[i])?;
        }
        Ok(())
    }

    fn write_frame(&self, layout: &BufferLayout, buffer: &mut [Sample], sequence: Sample) {
        let stride = layout.receiver_stride();
        for (r, receiver) in buffer[..layout.len()].chunks_exact_mut(stride).enumerate() {
            let (signal, meta) = receiver.split_at_mut(layout.samples_per_receiver);
            for (n, s) in signal.iter_mut().enumerate() {
                *s = sample(r * stride + n, sequence);
            }
            meta.fill(0);
            // Only the first receiver of each sensor carries the counter
            if r % layout.receivers == 0 {
                meta[0] = sequence;
            }
        }
    }
}

impl Hal for SimulatedHal {
    fn init(&mut self) -> Result<usize, HalError> {
        self.enter(Call::Init)?;
        self.initialised = true;
        Ok(self.sensors.len())
    }

    fn deinit(&mut self) {
        self.calls.push(Call::Deinit);
        for s in &mut self.sensors {
            s.open = false;
            s.running = false;
        }
        self.initialised = false;
    }

    fn version(&mut self) -> Result<Version, HalError> {
        self.enter(Call::Version)?;
        Ok(Version {
            major: 1,
            minor: 1,
            build: 1,
        })
    }

    fn set_log_level(&mut self, level: HalLogLevel) -> Result<(), HalError> {
        self.enter(Call::SetLogLevel)?;
        self.log_level = level;
        Ok(())
    }

    fn open(&mut self, sensors: &[SensorId]) -> Result<(), HalError> {
        self.enter(Call::Open)?;
        let idx = sensors
            .iter()
            .map(|&id| self.index(id))
            .collect::<Result<Vec<_>, _>>()?;
        if idx.iter().any(|&i| self.sensors[i].open) {
            return Err(HalError(status::BUSY));
        }
        for i in idx {
            self.sensors[i].open = true;
        }
        Ok(())
    }

    fn close(&mut self, sensors: &[SensorId]) {
        if self.enter(Call::Close).is_err() {
            return;
        }
        for &id in sensors {
            if let Ok(i) = self.index(id) {
                self.sensors[i].open = false;
                self.sensors[i].running = false;
            }
        }
    }

    fn module_id(&mut self, sensor: SensorId) -> Result<String, HalError> {
        self.enter(Call::ModuleId)?;
        let i = self.index(sensor)?;
        if !self.sensors[i].open {
            return Err(HalError(status::STATE));
        }
        Ok(self.sensors[i].name.clone())
    }

    fn module_info(&mut self, sensor: SensorId) -> Result<SensorInfo, HalError> {
        self.enter(Call::ModuleInfo)?;
        let i = self.index(sensor)?;
        if !self.sensors[i].open {
            return Err(HalError(status::STATE));
        }
        Ok(self.sensors[i].info())
    }

    fn setup(&mut self, sensors: &[SensorId], config: &SensorConfig) -> Result<(), HalError> {
        self.enter(Call::Setup)?;
        let config = effective(config);
        self.each_idle(sensors, |s| {
            s.config = config;
            // A new setup retracts synchronisation
            s.synched = false;
            Ok(())
        })
    }

    fn set_role(&mut self, sensors: &[SensorId], role: Role) -> Result<(), HalError> {
        self.enter(Call::SetRole(role))?;
        self.each_idle(sensors, |s| {
            s.role = role;
            Ok(())
        })
    }

    fn synchronize(&mut self, sensors: &[SensorId], mode: Synch) -> Result<(), HalError> {
        self.enter(Call::Synchronize(mode))?;
        self.each_idle(sensors, |s| {
            s.synched = mode == Synch::On;
            Ok(())
        })
    }

    fn reset_mlbs(&mut self, sensors: &[SensorId]) -> Result<(), HalError> {
        self.enter(Call::ResetMlbs)?;
        self.each_idle(sensors, |s| {
            if s.synched {
                Ok(())
            } else {
                Err(HalError(status::STATE))
            }
        })
    }

    fn set_averages(
        &mut self,
        sensors: &[SensorId],
        software_averages: u32,
        wait_cycles: u32,
    ) -> Result<(), HalError> {
        self.enter(Call::SetAverages)?;
        self.each_idle(sensors, |s| {
            s.software_averages =
                software_averages.clamp(SOFTWARE_AVERAGE_LIMITS[0], SOFTWARE_AVERAGE_LIMITS[1]);
            s.wait_cycles = wait_cycles.clamp(WAIT_CYCLE_LIMITS[0], WAIT_CYCLE_LIMITS[1]);
            Ok(())
        })
    }

    fn set_power(&mut self, sensors: &[SensorId], power: TxPower) -> Result<(), HalError> {
        self.enter(Call::SetPower(power))?;
        self.each_idle(sensors, |s| {
            s.tx = power;
            Ok(())
        })
    }

    fn start(&mut self, sensors: &[SensorId], _mode: RunMode) -> Result<(), HalError> {
        self.enter(Call::Start)?;
        self.each_idle(sensors, |s| {
            s.running = true;
            Ok(())
        })?;
        self.sequence = 0;
        Ok(())
    }

    fn stop(&mut self, sensors: &[SensorId]) -> Result<(), HalError> {
        self.enter(Call::Stop)?;
        for &id in sensors {
            let i = self.index(id)?;
            if !self.sensors[i].running {
                return Err(HalError(status::STATE));
            }
            self.sensors[i].running = false;
        }
        Ok(())
    }

    fn fetch(
        &mut self,
        sensors: &[SensorId],
        buffer: &mut [Sample],
        timeout: Duration,
    ) -> Result<FetchOutcome, HalError> {
        self.enter(Call::Fetch)?;
        let first = sensors.first().ok_or(HalError(status::INVALID_PARAM))?;
        for &id in sensors {
            let i = self.index(id)?;
            if !self.sensors[i].open || !self.sensors[i].running {
                return Err(HalError(status::STATE));
            }
        }
        let layout = BufferLayout::new(&self.sensors[self.index(*first)?].info(), sensors.len());
        if buffer.len() < layout.len() {
            return Err(HalError(status::INVALID_PARAM));
        }

        let event = self.script.pop_front().unwrap_or(Event::Irf);
        let reported = match event {
            Event::Stall => {
                if self.irf_period.is_some() {
                    thread::sleep(timeout);
                }
                return Ok(FetchOutcome::TimedOut);
            }
            Event::Fault(code) => return Err(HalError(code)),
            Event::Irf => layout.len(),
            Event::Resized(n) => n,
            Event::Skip(lost) => {
                self.sequence = self.sequence.wrapping_add(lost as Sample);
                layout.len()
            }
        };
        if let Some(period) = self.irf_period {
            thread::sleep(period);
        }
        self.write_frame(&layout, buffer, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(FetchOutcome::Ready(reported))
    }
}
