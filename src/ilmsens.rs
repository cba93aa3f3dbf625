//! Backend for the vendor's `libilmsens_hal` shared library
//!
//! Every wrapper converts the library's signed status with [`check`]. The only
//! status given a meaning of its own is the timeout of a fetch.

use std::{
    ffi::CStr,
    mem,
    os::raw::{c_char, c_double, c_int, c_uint},
    time::Duration,
};

use tracing::{debug, trace};

use crate::hal::{
    check, status, FetchOutcome, Hal, HalError, HalLogLevel, Role, RunMode, Sample, SensorConfig,
    SensorId, SensorInfo, Synch, TxPower, Version,
};

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct RawVersion {
    major: c_uint,
    minor: c_uint,
    build: c_uint,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct RawModConfig {
    order: c_uint,
    sub: c_uint,
    clk: c_double,
    ov: c_uint,
    tx: c_uint,
    rx: c_uint,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct RawModInfo {
    config: RawModConfig,
    tb_fc: c_double,
    temp: c_double,
    lsb_volt: c_double,
    fsr: [c_double; 2],
    hw_avg: c_uint,
    avg: c_uint,
    avg_lim: [c_uint; 2],
    wait: c_uint,
    wait_lim: [c_uint; 2],
    num_samp: c_uint,
}

#[link(name = "ilmsens_hal")]
extern "C" {
    fn ilmsens_hal_initHAL() -> c_int;
    fn ilmsens_hal_deinitHAL();
    fn ilmsens_hal_setDEBLevel(level: c_uint) -> c_int;
    fn ilmsens_hal_getVersion(version: *mut RawVersion) -> c_int;

    fn ilmsens_hal_openSensors(devs: *const c_uint, num: c_uint) -> c_int;
    fn ilmsens_hal_closeSensors(devs: *const c_uint, num: c_uint);
    fn ilmsens_hal_getModId(dev: c_uint, id: *mut c_char, size: usize) -> c_int;
    fn ilmsens_hal_getModInfo(dev: c_uint, info: *mut RawModInfo) -> c_int;
    fn ilmsens_hal_setupSensors(
        devs: *const c_uint,
        num: c_uint,
        config: *const RawModConfig,
    ) -> c_int;

    fn ilmsens_hal_setMaster(devs: *const c_uint, num: c_uint, mode: c_int) -> c_int;
    fn ilmsens_hal_synchMS(devs: *const c_uint, num: c_uint, mode: c_int) -> c_int;
    fn ilmsens_hal_setMLBS(devs: *const c_uint, num: c_uint) -> c_int;
    fn ilmsens_hal_setAvg(devs: *const c_uint, num: c_uint, avg: c_uint, wait: c_uint) -> c_int;
    fn ilmsens_hal_setPD(devs: *const c_uint, num: c_uint, mode: c_int) -> c_int;

    fn ilmsens_hal_measRun(devs: *const c_uint, num: c_uint, mode: c_int) -> c_int;
    fn ilmsens_hal_measStop(devs: *const c_uint, num: c_uint) -> c_int;
    fn ilmsens_hal_measGet(
        devs: *const c_uint,
        num: c_uint,
        buffer: *mut Sample,
        size: usize,
        timeout_ms: c_uint,
    ) -> c_int;
}

impl From<&SensorConfig> for RawModConfig {
    fn from(c: &SensorConfig) -> Self {
        Self {
            order: c.mlbs_order,
            sub: c.divider,
            clk: c.clock_ghz,
            ov: c.oversampling,
            tx: c.transmitters,
            rx: c.receivers,
        }
    }
}

impl From<RawModConfig> for SensorConfig {
    fn from(c: RawModConfig) -> Self {
        Self {
            clock_ghz: c.clk,
            mlbs_order: c.order,
            divider: c.sub,
            oversampling: c.ov,
            transmitters: c.tx,
            receivers: c.rx,
        }
    }
}

impl From<RawModInfo> for SensorInfo {
    fn from(i: RawModInfo) -> Self {
        Self {
            config: i.config.into(),
            samples_per_receiver: i.num_samp,
            hardware_averages: i.hw_avg,
            software_averages: i.avg,
            software_average_limits: i.avg_lim,
            wait_cycles: i.wait,
            wait_cycle_limits: i.wait_lim,
            full_scale_range: i.fsr,
            lsb_volts: i.lsb_volt,
            timebase_corner: i.tb_fc,
            temperature: i.temp,
        }
    }
}

/// Sensor numbers in the layout the library expects
fn raw_ids(sensors: &[SensorId]) -> Result<Vec<c_uint>, HalError> {
    if sensors.is_empty() {
        return Err(HalError(status::INVALID_PARAM));
    }
    Ok(sensors.iter().map(|s| s.get()).collect())
}

/// The vendor library. It keeps global state, so there must only ever be one.
#[derive(Debug, Default)]
pub struct IlmsensHal {
    _private: (),
}

impl IlmsensHal {
    pub fn new() -> Self {
        Self::default()
    }

    fn call(
        sensors: &[SensorId],
        f: impl FnOnce(*const c_uint, c_uint) -> c_int,
    ) -> Result<(), HalError> {
        let ids = raw_ids(sensors)?;
        check(f(ids.as_ptr(), ids.len() as c_uint)).map(|_| ())
    }
}

impl Hal for IlmsensHal {
    fn init(&mut self) -> Result<usize, HalError> {
        let count = check(unsafe { ilmsens_hal_initHAL() })?;
        debug!(count, "ilmsens HAL initialised");
        Ok(count as usize)
    }

    fn deinit(&mut self) {
        unsafe { ilmsens_hal_deinitHAL() };
        debug!("ilmsens HAL released");
    }

    fn version(&mut self) -> Result<Version, HalError> {
        let mut raw = RawVersion::default();
        check(unsafe { ilmsens_hal_getVersion(&mut raw) })?;
        Ok(Version {
            major: raw.major,
            minor: raw.minor,
            build: raw.build,
        })
    }

    fn set_log_level(&mut self, level: HalLogLevel) -> Result<(), HalError> {
        check(unsafe { ilmsens_hal_setDEBLevel(level as c_uint) }).map(|_| ())
    }

    fn open(&mut self, sensors: &[SensorId]) -> Result<(), HalError> {
        Self::call(sensors, |ids, n| unsafe { ilmsens_hal_openSensors(ids, n) })
    }

    fn close(&mut self, sensors: &[SensorId]) {
        if let Ok(ids) = raw_ids(sensors) {
            unsafe { ilmsens_hal_closeSensors(ids.as_ptr(), ids.len() as c_uint) };
        }
    }

    fn module_id(&mut self, sensor: SensorId) -> Result<String, HalError> {
        let mut buf: [c_char; 128] = [0; 128];
        check(unsafe { ilmsens_hal_getModId(sensor.get(), buf.as_mut_ptr(), buf.len()) })?;
        // The library may fill the whole buffer without a terminator
        buf[buf.len() - 1] = 0;
        let id = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(id.to_string_lossy().trim().to_owned())
    }

    fn module_info(&mut self, sensor: SensorId) -> Result<SensorInfo, HalError> {
        let mut raw = RawModInfo::default();
        check(unsafe { ilmsens_hal_getModInfo(sensor.get(), &mut raw) })?;
        trace!(?raw, "module info of sensor {}", sensor);
        Ok(raw.into())
    }

    fn setup(&mut self, sensors: &[SensorId], config: &SensorConfig) -> Result<(), HalError> {
        let raw = RawModConfig::from(config);
        Self::call(sensors, |ids, n| unsafe { ilmsens_hal_setupSensors(ids, n, &raw) })
    }

    fn set_role(&mut self, sensors: &[SensorId], role: Role) -> Result<(), HalError> {
        Self::call(sensors, |ids, n| unsafe { ilmsens_hal_setMaster(ids, n, role as c_int) })
    }

    fn synchronize(&mut self, sensors: &[SensorId], mode: Synch) -> Result<(), HalError> {
        Self::call(sensors, |ids, n| unsafe { ilmsens_hal_synchMS(ids, n, mode as c_int) })
    }

    fn reset_mlbs(&mut self, sensors: &[SensorId]) -> Result<(), HalError> {
        Self::call(sensors, |ids, n| unsafe { ilmsens_hal_setMLBS(ids, n) })
    }

    fn set_averages(
        &mut self,
        sensors: &[SensorId],
        software_averages: u32,
        wait_cycles: u32,
    ) -> Result<(), HalError> {
        Self::call(sensors, |ids, n| unsafe {
            ilmsens_hal_setAvg(ids, n, software_averages, wait_cycles)
        })
    }

    fn set_power(&mut self, sensors: &[SensorId], power: TxPower) -> Result<(), HalError> {
        Self::call(sensors, |ids, n| unsafe { ilmsens_hal_setPD(ids, n, power as c_int) })
    }

    fn start(&mut self, sensors: &[SensorId], mode: RunMode) -> Result<(), HalError> {
        Self::call(sensors, |ids, n| unsafe { ilmsens_hal_measRun(ids, n, mode as c_int) })
    }

    fn stop(&mut self, sensors: &[SensorId]) -> Result<(), HalError> {
        Self::call(sensors, |ids, n| unsafe { ilmsens_hal_measStop(ids, n) })
    }

    fn fetch(
        &mut self,
        sensors: &[SensorId],
        buffer: &mut [Sample],
        timeout: Duration,
    ) -> Result<FetchOutcome, HalError> {
        let ids = raw_ids(sensors)?;
        let millis = timeout.as_millis().clamp(1, c_uint::MAX as u128) as c_uint;
        let result = unsafe {
            ilmsens_hal_measGet(
                ids.as_ptr(),
                ids.len() as c_uint,
                buffer.as_mut_ptr(),
                buffer.len() * mem::size_of::<Sample>(),
                millis,
            )
        };
        match check(result) {
            Ok(count) => Ok(FetchOutcome::Ready(count as usize)),
            Err(HalError(status::TIMEOUT)) => Ok(FetchOutcome::TimedOut),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_conversion_keeps_fields() {
        let raw = RawModInfo {
            config: RawModConfig {
                order: 9,
                sub: 0,
                clk: 13.312,
                ov: 1,
                tx: 1,
                rx: 2,
            },
            num_samp: 511,
            avg_lim: [1, 4096],
            fsr: [-0.5, 0.5],
            ..Default::default()
        };
        let info = SensorInfo::from(raw);
        assert_eq!(info.samples_per_receiver, 511);
        assert_eq!(info.config.receivers, 2);
        assert_eq!(info.software_average_limits, [1, 4096]);
        assert_eq!(info.full_scale_range, [-0.5, 0.5]);
    }

    #[test]
    fn empty_selection_is_rejected() {
        assert_eq!(raw_ids(&[]), Err(HalError(status::INVALID_PARAM)));
        assert_eq!(raw_ids(&[SensorId(2), SensorId(1)]), Ok(vec![2, 1]));
    }
}
