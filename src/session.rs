//! Sensor lifecycle on top of a [`Hal`]
//!
//! Three nested scopes, each releasing its resource on drop:
//! - [`Driver`] owns the initialised library,
//! - [`Session`] holds one opened sensor,
//! - [`Measurement`] is one running acquisition on that sensor.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    error::{ConfigStep, Error},
    hal::{
        FetchOutcome, Hal, HalError, HalLogLevel, Role, RunMode, Sample, SensorConfig, SensorId,
        SensorInfo, Synch, TxPower, Version,
    },
};

/// Identity of an attached sensor, fixed at enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDescriptor {
    pub id: SensorId,
    pub name: String,
}

/// Software averaging and snapshot-mode wait cycles pushed while arming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Averages {
    pub software: u32,
    /// 0 measures continuously, anything else switches to snapshot mode
    pub wait_cycles: u32,
}

impl Default for Averages {
    fn default() -> Self {
        Self {
            software: 32,
            wait_cycles: 0,
        }
    }
}

/// An initialised HAL library. Dropping it de-initialises the library.
pub struct Driver<H: Hal> {
    hal: H,
    sensor_count: usize,
}

impl<H: Hal> Driver<H> {
    pub fn init(mut hal: H, log_level: HalLogLevel) -> Result<Self, Error> {
        let sensor_count = hal.init().map_err(|source| Error::DeviceUnavailable {
            context: "initialising the HAL library".to_owned(),
            source,
        })?;
        // From here on `Drop` takes care of deinit
        let mut driver = Self { hal, sensor_count };
        driver
            .hal
            .set_log_level(log_level)
            .map_err(|source| Error::DeviceUnavailable {
                context: "setting the HAL log level".to_owned(),
                source,
            })?;
        debug!(sensors = sensor_count, ?log_level, "HAL initialised");
        Ok(driver)
    }

    /// Number of sensors detected at initialisation
    pub fn sensor_count(&self) -> usize {
        self.sensor_count
    }

    pub fn version(&mut self) -> Result<Version, Error> {
        self.hal
            .version()
            .map_err(|source| Error::DeviceUnavailable {
                context: "reading the HAL library version".to_owned(),
                source,
            })
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Read the ID of every detected sensor and demote all of them to slave so
    /// that whichever one is armed later is the only master.
    pub fn enumerate(&mut self) -> Result<Vec<SensorDescriptor>, Error> {
        let ids: Vec<SensorId> = (1..=self.sensor_count as u32).map(SensorId).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.hal
            .open(&ids)
            .map_err(|source| Error::DeviceUnavailable {
                context: "opening the sensors".to_owned(),
                source,
            })?;
        let result = self.describe_and_demote(&ids);
        self.hal.close(&ids);
        result
    }

    fn describe_and_demote(&mut self, ids: &[SensorId]) -> Result<Vec<SensorDescriptor>, Error> {
        let mut sensors = Vec::with_capacity(ids.len());
        for &id in ids {
            let name = self
                .hal
                .module_id(id)
                .map_err(|source| Error::DeviceUnavailable {
                    context: format!("reading the ID of sensor {}", id),
                    source,
                })?;
            info!("Sensor {} has ID '{}'", id, name);
            sensors.push(SensorDescriptor { id, name });
        }
        self.hal
            .set_role(ids, Role::Slave)
            .map_err(|source| Error::ConfigurationFailed {
                step: ConfigStep::DemoteToSlave,
                source,
            })?;
        Ok(sensors)
    }

    /// Acquire exclusive access to one sensor
    pub fn open(&mut self, id: SensorId) -> Result<Session<'_, H>, Error> {
        self.hal
            .open(&[id])
            .map_err(|source| Error::DeviceUnavailable {
                context: format!("opening sensor {}", id),
                source,
            })?;
        let name = match self.hal.module_id(id) {
            Ok(name) => name,
            Err(source) => {
                self.hal.close(&[id]);
                return Err(Error::DeviceUnavailable {
                    context: format!("reading the ID of sensor {}", id),
                    source,
                });
            }
        };
        debug!("opened sensor {} ('{}')", id, name);
        Ok(Session {
            hal: &mut self.hal,
            id,
            name,
            info: None,
            open: true,
        })
    }
}

impl<H: Hal> Drop for Driver<H> {
    fn drop(&mut self) {
        self.hal.deinit();
        debug!("HAL de-initialised");
    }
}

/// Exclusive handle on one opened sensor. Dropping it closes the sensor.
pub struct Session<'d, H: Hal> {
    hal: &'d mut H,
    id: SensorId,
    name: String,
    info: Option<SensorInfo>,
    open: bool,
}

impl<'d, H: Hal> Session<'d, H> {
    pub fn id(&self) -> SensorId {
        self.id
    }

    /// Unique identifier the sensor reported when opened
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> SensorDescriptor {
        SensorDescriptor {
            id: self.id,
            name: self.name.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Most recent info read back from the device
    pub fn info(&self) -> Option<&SensorInfo> {
        self.info.as_ref()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Push the requested configuration and read back what the device made of it.
    /// The returned info, not `config`, is what buffer sizing must use.
    pub fn configure(&mut self, config: &SensorConfig) -> Result<&SensorInfo, Error> {
        self.ensure_open()?;
        self.hal
            .setup(&[self.id], config)
            .map_err(|source| Error::ConfigurationFailed {
                step: ConfigStep::Setup,
                source,
            })?;
        let info = self.refresh_info()?;
        if info.config != *config {
            debug!(requested = ?config, effective = ?info.config, "device adjusted configuration");
        }
        Ok(info)
    }

    pub fn refresh_info(&mut self) -> Result<&SensorInfo, Error> {
        self.ensure_open()?;
        let info = self
            .hal
            .module_info(self.id)
            .map_err(|source| Error::ConfigurationFailed {
                step: ConfigStep::ReadInfo,
                source,
            })?;
        Ok(self.info.insert(info))
    }

    /// Make this sensor the synchronised timing master with its transmitter
    /// running. Stops at the first failing step; the session should then be
    /// closed and reopened.
    pub fn arm_as_master(&mut self, averages: Averages) -> Result<(), Error> {
        self.ensure_open()?;
        let ids = [self.id];
        let step = |step: ConfigStep, result: Result<(), HalError>| {
            result.map_err(|source| Error::ConfigurationFailed { step, source })
        };
        // A sensor that never was master accepts the demotion just the same
        step(ConfigStep::DemoteToSlave, self.hal.set_role(&ids, Role::Slave))?;
        step(ConfigStep::PromoteToMaster, self.hal.set_role(&ids, Role::Master))?;
        // It may have been synch'ed before
        step(ConfigStep::SynchOff, self.hal.synchronize(&ids, Synch::Off))?;
        step(ConfigStep::SynchOn, self.hal.synchronize(&ids, Synch::On))?;
        step(ConfigStep::StartTransmitter, self.hal.reset_mlbs(&ids))?;
        step(
            ConfigStep::SetAverages,
            self.hal
                .set_averages(&ids, averages.software, averages.wait_cycles),
        )?;
        self.refresh_info()?;
        step(
            ConfigStep::PowerOnTransmitter,
            self.hal.set_power(&ids, TxPower::On),
        )?;
        debug!("sensor {} armed as master", self.id);
        Ok(())
    }

    /// Start an acquisition. Requires a configured session.
    pub fn start(&mut self, mode: RunMode) -> Result<Measurement<'_, 'd, H>, Error> {
        self.ensure_open()?;
        let info = self.info.ok_or(Error::NotConfigured)?;
        self.hal
            .start(&[self.id], mode)
            .map_err(|source| Error::FatalDevice {
                op: "starting the measurement",
                source,
            })?;
        debug!(?mode, "measurement started on sensor {}", self.id);
        Ok(Measurement {
            session: self,
            info,
            running: true,
        })
    }

    /// Release the sensor. Further calls are no-ops.
    pub fn close(&mut self) {
        if self.open {
            self.hal.close(&[self.id]);
            self.open = false;
            debug!("closed sensor {}", self.id);
        }
    }
}

impl<H: Hal> Drop for Session<'_, H> {
    fn drop(&mut self) {
        self.close();
    }
}

/// A running acquisition. Dropping it without [`Measurement::stop`] stops the
/// device on a best-effort basis.
pub struct Measurement<'s, 'd, H: Hal> {
    session: &'s mut Session<'d, H>,
    info: SensorInfo,
    running: bool,
}

impl<H: Hal> Measurement<'_, '_, H> {
    /// Info snapshot taken when the measurement started
    pub fn info(&self) -> &SensorInfo {
        &self.info
    }

    pub fn sensor(&self) -> SensorId {
        self.session.id
    }

    /// Wait for the next dataset. The timeout is never shorter than 1 ms, as a
    /// zero would make the library block forever.
    pub fn fetch(
        &mut self,
        buffer: &mut [Sample],
        timeout: Duration,
    ) -> Result<FetchOutcome, HalError> {
        let timeout = timeout.max(Duration::from_millis(1));
        self.session.hal.fetch(&[self.session.id], buffer, timeout)
    }

    pub fn stop(mut self) -> Result<(), Error> {
        self.running = false;
        self.session
            .hal
            .stop(&[self.session.id])
            .map_err(|source| Error::FatalDevice {
                op: "stopping the measurement",
                source,
            })
    }
}

impl<H: Hal> Drop for Measurement<'_, '_, H> {
    fn drop(&mut self) {
        if self.running {
            if let Err(e) = self.session.hal.stop(&[self.session.id]) {
                warn!("could not stop measurement on sensor {}: {}", self.session.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hal::status,
        sim::{Call, SimulatedHal},
    };

    const S1: SensorId = SensorId(1);

    fn driver(count: usize) -> Driver<SimulatedHal> {
        Driver::init(SimulatedHal::new(count), HalLogLevel::More).unwrap()
    }

    #[test]
    fn init_sets_log_level() {
        let driver = driver(2);
        assert_eq!(driver.sensor_count(), 2);
        assert_eq!(driver.hal().log_level(), HalLogLevel::More);
    }

    #[test]
    fn enumerate_demotes_all_and_closes() {
        let mut driver = driver(3);
        let sensors = driver.enumerate().unwrap();
        assert_eq!(sensors.len(), 3);
        assert_eq!(sensors[2].id, SensorId(3));
        assert_eq!(sensors[0].name, "SIM-UWB-0001");
        for s in &sensors {
            assert!(!driver.hal().is_open(s.id));
            assert_eq!(driver.hal().role(s.id), Some(Role::Slave));
        }
    }

    #[test]
    fn enumerate_closes_on_failure() {
        let mut driver = driver(2);
        driver.hal_mut().fail_next(Call::ModuleId, status::IO);
        assert!(matches!(
            driver.enumerate(),
            Err(Error::DeviceUnavailable { .. })
        ));
        assert!(!driver.hal().is_open(S1));
    }

    #[test]
    fn open_absent_or_held() {
        let mut driver = driver(1);
        assert!(matches!(
            driver.open(SensorId(2)),
            Err(Error::DeviceUnavailable { .. })
        ));
        driver.hal_mut().open(&[S1]).unwrap();
        assert!(matches!(
            driver.open(S1),
            Err(Error::DeviceUnavailable {
                source: HalError(status::BUSY),
                ..
            })
        ));
    }

    #[test]
    fn session_knows_sensor_id() {
        let mut driver = driver(2);
        let session = driver.open(SensorId(2)).unwrap();
        assert_eq!(session.name(), "SIM-UWB-0002");
        assert_eq!(
            session.descriptor(),
            SensorDescriptor {
                id: SensorId(2),
                name: "SIM-UWB-0002".to_owned()
            }
        );
    }

    #[test]
    fn open_releases_sensor_without_id() {
        let mut driver = driver(1);
        driver.hal_mut().fail_next(Call::ModuleId, status::IO);
        assert!(matches!(
            driver.open(S1),
            Err(Error::DeviceUnavailable {
                source: HalError(status::IO),
                ..
            })
        ));
        assert!(!driver.hal().is_open(S1));
    }

    #[test]
    fn close_is_idempotent_and_drop_closes() {
        let mut driver = driver(1);
        {
            let mut session = driver.open(S1).unwrap();
            session.close();
            session.close();
            assert!(!session.is_open());
            assert!(matches!(
                session.configure(&SensorConfig::default()),
                Err(Error::Closed)
            ));
        }
        let closes = driver
            .hal()
            .calls()
            .iter()
            .filter(|c| **c == Call::Close)
            .count();
        assert_eq!(closes, 1);

        driver.open(S1).unwrap();
        assert!(!driver.hal().is_open(S1));
    }

    #[test]
    fn configure_returns_effective_values() {
        let mut driver = driver(1);
        let mut session = driver.open(S1).unwrap();
        let requested = SensorConfig {
            mlbs_order: 15,
            ..Default::default()
        };
        let info = session.configure(&requested).unwrap();
        assert_eq!(info.config.oversampling, 1);
        assert_eq!(info.samples_per_receiver, 32767);
        // Idempotent
        let again = *session.configure(&requested).unwrap();
        assert_eq!(Some(&again), session.info());
    }

    #[test]
    fn arm_runs_steps_in_order() {
        let mut driver = driver(1);
        let mut session = driver.open(S1).unwrap();
        session.configure(&SensorConfig::default()).unwrap();
        session.hal.clear_calls();
        session
            .arm_as_master(Averages {
                software: 8,
                wait_cycles: 0,
            })
            .unwrap();
        assert_eq!(session.info().unwrap().software_averages, 8);
        drop(session);
        assert_eq!(
            &driver.hal().calls()[..8],
            &[
                Call::SetRole(Role::Slave),
                Call::SetRole(Role::Master),
                Call::Synchronize(Synch::Off),
                Call::Synchronize(Synch::On),
                Call::ResetMlbs,
                Call::SetAverages,
                Call::ModuleInfo,
                Call::SetPower(TxPower::On),
            ]
        );
        assert_eq!(driver.hal().role(S1), Some(Role::Master));
        assert!(driver.hal().is_transmitting(S1));
    }

    #[test]
    fn arm_stops_at_failing_step() {
        let mut driver = driver(1);
        driver
            .hal_mut()
            .fail_next(Call::Synchronize(Synch::On), status::IO);
        let mut session = driver.open(S1).unwrap();
        session.configure(&SensorConfig::default()).unwrap();
        let err = session.arm_as_master(Averages::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::ConfigurationFailed {
                step: ConfigStep::SynchOn,
                ..
            }
        ));
        drop(session);
        assert!(!driver.hal().calls().contains(&Call::ResetMlbs));
        assert!(!driver.hal().is_transmitting(S1));
    }

    #[test]
    fn start_requires_configuration() {
        let mut driver = driver(1);
        let mut session = driver.open(S1).unwrap();
        assert!(matches!(
            session.start(RunMode::Buffered),
            Err(Error::NotConfigured)
        ));
    }

    #[test]
    fn dropped_measurement_stops() {
        let mut driver = driver(1);
        let mut session = driver.open(S1).unwrap();
        session.configure(&SensorConfig::default()).unwrap();
        {
            let measurement = session.start(RunMode::Buffered).unwrap();
            assert!(session_running(&measurement));
        }
        assert!(!session.hal.is_running(S1));
        let measurement = session.start(RunMode::Raw).unwrap();
        measurement.stop().unwrap();
        assert!(!session.hal.is_running(S1));
    }

    fn session_running(m: &Measurement<'_, '_, SimulatedHal>) -> bool {
        m.session.hal.is_running(m.sensor())
    }
}
