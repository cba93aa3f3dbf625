//! Error taxonomy for sessions and acquisition runs
//!
//! [`Error`] is what unwinds out of a session or a run. [`Anomaly`] covers the
//! recoverable conditions the acquisition loop absorbs and only counts.

use std::{fmt, time::Duration};

use crate::hal::{HalError, Sample};

/// Steps of configuring and arming a sensor, in the order they are performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    Setup,
    ReadInfo,
    DemoteToSlave,
    PromoteToMaster,
    SynchOff,
    SynchOn,
    StartTransmitter,
    SetAverages,
    PowerOnTransmitter,
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigStep::Setup => "basic setup",
            ConfigStep::ReadInfo => "reading sensor info",
            ConfigStep::DemoteToSlave => "setting slave mode",
            ConfigStep::PromoteToMaster => "setting master mode",
            ConfigStep::SynchOff => "unsynching",
            ConfigStep::SynchOn => "synching",
            ConfigStep::StartTransmitter => "starting the transmitter",
            ConfigStep::SetAverages => "setting software averages and wait cycles",
            ConfigStep::PowerOnTransmitter => "switching on the transmitter",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Library initialisation, enumeration or opening a sensor failed
    #[error("{context}: device unavailable")]
    DeviceUnavailable {
        context: String,
        #[source]
        source: HalError,
    },
    /// A configuration or arming step failed. The session must be closed and
    /// reopened before trying again.
    #[error("configuration failed while {step}")]
    ConfigurationFailed {
        step: ConfigStep,
        #[source]
        source: HalError,
    },
    /// Any other HAL failure (link loss, device removed). Aborts the run.
    #[error("fatal device error while {op}")]
    FatalDevice {
        op: &'static str,
        #[source]
        source: HalError,
    },
    #[error("sensor has not been configured")]
    NotConfigured,
    /// Reported geometry leaves no room for samples or the sequence number
    #[error("unusable buffer layout: {samples} sample(s) and {oversampling} metadata slot(s) per receiver")]
    InvalidLayout { samples: usize, oversampling: usize },
    #[error("session is closed")]
    Closed,
    #[error("sensor #{requested} does not exist, {count} sensor(s) attached")]
    NoSuchSensor { requested: u32, count: usize },
    #[error("built without hardware support, pass --simulate or enable the `ilmsens` feature")]
    NoHardwareSupport,
    #[error("could not create impulse response dump")]
    Dump(#[from] std::io::Error),
}

/// Recoverable acquisition conditions. Counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Anomaly {
    #[error("no impulse response #{index} within {} ms", .timeout.as_millis())]
    FetchTimeout { index: usize, timeout: Duration },
    #[error("size of dataset #{index} is {got} sample(s) long, but expected {expected} samples")]
    SizeMismatch {
        index: usize,
        got: usize,
        expected: usize,
    },
    #[error("sequence number of impulse response #{index} is {got}, but expected {expected}; some data seems to be missing")]
    SequenceGap {
        index: usize,
        got: Sample,
        expected: Sample,
    },
}

impl Anomaly {
    /// Index of the fetch attempt this anomaly belongs to
    pub fn index(&self) -> usize {
        match *self {
            Anomaly::FetchTimeout { index, .. }
            | Anomaly::SizeMismatch { index, .. }
            | Anomaly::SequenceGap { index, .. } => index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn configuration_failure_names_step() {
        let err = Error::ConfigurationFailed {
            step: ConfigStep::SynchOn,
            source: HalError(-5),
        };
        assert_eq!(err.to_string(), "configuration failed while synching");
        assert_eq!(
            err.source().map(|s| s.to_string()),
            Some("input/output error (status -5)".to_owned())
        );
    }

    #[test]
    fn anomaly_index() {
        let gap = Anomaly::SequenceGap {
            index: 3,
            got: 5,
            expected: 3,
        };
        assert_eq!(gap.index(), 3);
        let timeout = Anomaly::FetchTimeout {
            index: 7,
            timeout: Duration::from_millis(500),
        };
        assert_eq!(timeout.to_string(), "no impulse response #7 within 500 ms");
    }
}
