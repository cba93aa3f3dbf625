//! The device HAL contract the rest of the crate is written against.
//!
//! Every call mirrors one entry point of the vendor library. Calls that take a
//! list of sensors apply the same operation to each of them. A negative status
//! from the vendor side always surfaces as a [`HalError`]; nothing above this
//! layer branches on the particular code.

use std::{fmt, time::Duration};

/// Raw element type of measured data
pub type Sample = i32;

/// Vendor status codes, kept for readable error messages
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const INVALID_PARAM: i32 = -1;
    pub const STATE: i32 = -2;
    pub const BUSY: i32 = -3;
    pub const ACCESS: i32 = -4;
    pub const IO: i32 = -5;
    pub const NO_MEMORY: i32 = -6;
    pub const AGAIN: i32 = -7;
    pub const TIMEOUT: i32 = -8;
    pub const NOT_SUPPORTED: i32 = -9;
    pub const UNKNOWN: i32 = -99;
}

/// A failed HAL call, carrying the raw (negative) status
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{} (status {0})", describe(.0))]
pub struct HalError(pub i32);

fn describe(code: &i32) -> &'static str {
    match *code {
        status::INVALID_PARAM => "invalid parameter",
        status::STATE => "invalid state",
        status::BUSY => "resource busy",
        status::ACCESS => "access denied",
        status::IO => "input/output error",
        status::NO_MEMORY => "resource allocation failed",
        status::AGAIN => "not enough data",
        status::TIMEOUT => "timeout expired",
        status::NOT_SUPPORTED => "operation not supported",
        _ => "unspecified error",
    }
}

/// Turn a signed vendor status into a result. Non-negative values are payload.
pub fn check(status: i32) -> Result<u32, HalError> {
    if status < status::SUCCESS {
        Err(HalError(status))
    } else {
        Ok(status as u32)
    }
}

/// 1-based ordinal number of a sensor as reported by enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorId(pub u32);

impl SensorId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Verbosity of the vendor library's own diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum HalLogLevel {
    None = 0,
    #[default]
    Info = 1,
    More = 2,
    Most = 3,
    All = 4,
}

impl TryFrom<u32> for HalLogLevel {
    type Error = String;

    fn try_from(level: u32) -> Result<Self, Self::Error> {
        Ok(match level {
            0 => Self::None,
            1 => Self::Info,
            2 => Self::More,
            3 => Self::Most,
            4 => Self::All,
            _ => return Err(format!("HAL log level {} is not in 0..=4", level)),
        })
    }
}

/// Timing role of a sensor among cooperating devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Slave = 0,
    Master = 1,
}

/// Digital synchronisation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synch {
    Off = 0,
    On = 1,
}

/// Transmitter output amplifier state. The vendor encodes "on" as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPower {
    On = 0,
    Off = 1,
}

/// How the library moves data off the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Unbuffered, transferred on demand
    Raw = 1,
    /// Buffered by the library on a separate thread
    #[default]
    Buffered = 2,
}

/// Requested (or effective) sensor parameters. Zero means "device default" for
/// the divider, oversampling and transmitter count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorConfig {
    /// RF system clock in GHz
    pub clock_ghz: f64,
    pub mlbs_order: u32,
    /// Clock divider (prescaler) for the real sampling rate
    pub divider: u32,
    pub oversampling: u32,
    pub transmitters: u32,
    pub receivers: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            clock_ghz: 13.312,
            mlbs_order: 9,
            divider: 0,
            oversampling: 0,
            transmitters: 0,
            receivers: 2,
        }
    }
}

/// Read-only snapshot the device reports after configuration
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorInfo {
    /// Effective configuration, possibly clamped by the device
    pub config: SensorConfig,
    pub samples_per_receiver: u32,
    pub hardware_averages: u32,
    pub software_averages: u32,
    pub software_average_limits: [u32; 2],
    pub wait_cycles: u32,
    pub wait_cycle_limits: [u32; 2],
    /// ADC full scale range in volts (min, max)
    pub full_scale_range: [f64; 2],
    pub lsb_volts: f64,
    /// Corner frequency used for timebase calibration
    pub timebase_corner: f64,
    /// Internal temperature in degrees Celsius
    pub temperature: f64,
}

impl fmt::Display for SensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.config;
        writeln!(f, "* RF system clock    [GHz]: {:.6}", c.clock_ghz)?;
        writeln!(f, "* MLBS order              : {}", c.mlbs_order)?;
        writeln!(f, "* Prescaler           1/  : {}", c.divider)?;
        writeln!(f, "* Oversampling        x   : {}", c.oversampling)?;
        writeln!(f, "* Number of Tx            : {}", c.transmitters)?;
        writeln!(f, "* Number of Rx            : {}", c.receivers)?;
        writeln!(f, "* Number of samples per Rx: {}", self.samples_per_receiver)?;
        writeln!(f, "* Hardware averages       : {}", self.hardware_averages)?;
        writeln!(
            f,
            "* Software avg. limits    : [{} .. {}]",
            self.software_average_limits[0], self.software_average_limits[1]
        )?;
        writeln!(f, "* Software averages       : {}", self.software_averages)?;
        writeln!(
            f,
            "* Wait cycle limits       : [{} .. {}]",
            self.wait_cycle_limits[0], self.wait_cycle_limits[1]
        )?;
        writeln!(f, "* Wait cycles             : {}", self.wait_cycles)?;
        writeln!(
            f,
            "* ADC full scale range [V]: [{:.6} .. {:.6}]",
            self.full_scale_range[0], self.full_scale_range[1]
        )?;
        writeln!(f, "* ADC LSB voltage     [mV]: {:.6}", self.lsb_volts * 1000.0)?;
        write!(f, "* Int. temperature    [°C]: {:.2}", self.temperature)
    }
}

/// Result of a bounded wait for the next dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The library wrote a dataset and reported this many elements
    Ready(usize),
    /// Nothing arrived before the deadline
    TimedOut,
}

/// Entry points of a UWB sensor HAL.
///
/// Implementations are driven strictly sequentially; nothing here is expected to
/// be reentrant.
pub trait Hal {
    /// Initialise the library, returning the number of detected sensors
    fn init(&mut self) -> Result<usize, HalError>;
    /// Release the library. Always succeeds.
    fn deinit(&mut self);
    fn version(&mut self) -> Result<Version, HalError>;
    fn set_log_level(&mut self, level: HalLogLevel) -> Result<(), HalError>;

    fn open(&mut self, sensors: &[SensorId]) -> Result<(), HalError>;
    fn close(&mut self, sensors: &[SensorId]);
    fn module_id(&mut self, sensor: SensorId) -> Result<String, HalError>;
    fn module_info(&mut self, sensor: SensorId) -> Result<SensorInfo, HalError>;
    fn setup(&mut self, sensors: &[SensorId], config: &SensorConfig) -> Result<(), HalError>;

    fn set_role(&mut self, sensors: &[SensorId], role: Role) -> Result<(), HalError>;
    fn synchronize(&mut self, sensors: &[SensorId], mode: Synch) -> Result<(), HalError>;
    /// Reset the M-sequence generator, aligning transmitters and receivers
    fn reset_mlbs(&mut self, sensors: &[SensorId]) -> Result<(), HalError>;
    fn set_averages(
        &mut self,
        sensors: &[SensorId],
        software_averages: u32,
        wait_cycles: u32,
    ) -> Result<(), HalError>;
    fn set_power(&mut self, sensors: &[SensorId], power: TxPower) -> Result<(), HalError>;

    fn start(&mut self, sensors: &[SensorId], mode: RunMode) -> Result<(), HalError>;
    fn stop(&mut self, sensors: &[SensorId]) -> Result<(), HalError>;
    /// Block until one dataset per sensor is written to `buffer` or `timeout`
    /// expires. A zero timeout blocks forever; callers must not pass one.
    fn fetch(
        &mut self,
        sensors: &[SensorId],
        buffer: &mut [Sample],
        timeout: Duration,
    ) -> Result<FetchOutcome, HalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_status_is_error() {
        assert_eq!(check(3), Ok(3));
        assert_eq!(check(0), Ok(0));
        assert_eq!(check(-5), Err(HalError(status::IO)));
        // Undocumented codes are still failures
        assert_eq!(check(-1234), Err(HalError(-1234)));
    }

    #[test]
    fn hal_error_messages() {
        assert_eq!(HalError(-3).to_string(), "resource busy (status -3)");
        assert_eq!(HalError(-42).to_string(), "unspecified error (status -42)");
    }

    #[test]
    fn log_level_range() {
        assert_eq!(HalLogLevel::try_from(4), Ok(HalLogLevel::All));
        assert!(HalLogLevel::try_from(5).is_err());
    }
}
