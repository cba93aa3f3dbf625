use std::{error::Error as _, process::ExitCode, time::Duration};

use clap::Parser;
use mlbs_acquire::{
    args::{convert_filter, Args},
    error::Error,
    hal::{Hal, SensorId},
    process::{NoProcessing, Process, RawWriter},
    run::{RunController, RunSummary},
    session::Driver,
    sim::SimulatedHal,
};
use tracing::{error, info, warn};

/// Run finished, but not every impulse response made it
const EXIT_ERRORS: u8 = 1;
/// Bad selection, configuration or device failure
const EXIT_FAILURE: u8 = 2;

/// Pace of the simulated sensor
const SIM_IRF_PERIOD: Duration = Duration::from_millis(5);

fn acquire<H: Hal>(hal: H, cli: &Args) -> Result<Option<RunSummary>, Error> {
    let mut driver = Driver::init(hal, cli.hal_log_level())?;
    info!("HAL library version {}", driver.version()?);

    let count = driver.sensor_count();
    info!("Number of sensors detected: {}", count);
    if count == 0 {
        warn!("No sensors connected, nothing to do.");
        return Ok(None);
    }
    if cli.sensor_num as usize > count {
        return Err(Error::NoSuchSensor {
            requested: cli.sensor_num,
            count,
        });
    }

    // Logs every ID and leaves all sensors as slaves
    driver.enumerate()?;
    if cli.sensor_num == 0 {
        info!("No sensor selected, only listing IDs.");
        return Ok(None);
    }

    let mut session = driver.open(SensorId(cli.sensor_num))?;
    session.configure(&cli.sensor_config())?;
    session.arm_as_master(cli.averages())?;
    if let Some(info) = session.info() {
        info!("Sensor {} ('{}') is ready:\n{}", session.id(), session.name(), info);
    }

    let mut hook: Box<dyn Process> = match &cli.dump_dir {
        Some(dir) => Box::new(RawWriter::create_in(dir)?.0),
        None => Box::new(NoProcessing),
    };
    let mut controller = RunController::new(cli.run_config());
    info!(
        "Starting {} run(s) of {} impulse responses each.",
        controller.config().repeat_count,
        controller.config().responses
    );
    controller
        .run(&mut session, hook.as_mut())
        .map(Some)
        .map_err(|e| {
            error!(
                "Run aborted with {} recoverable error(s) counted so far.",
                controller.total_errors()
            );
            e
        })
}

fn dispatch(cli: &Args) -> Result<Option<RunSummary>, Error> {
    if cli.simulate {
        return acquire(SimulatedHal::new(1).with_irf_period(SIM_IRF_PERIOD), cli);
    }
    hardware(cli)
}

#[cfg(feature = "ilmsens")]
fn hardware(cli: &Args) -> Result<Option<RunSummary>, Error> {
    acquire(mlbs_acquire::ilmsens::IlmsensHal::new(), cli)
}

#[cfg(not(feature = "ilmsens"))]
fn hardware(_cli: &Args) -> Result<Option<RunSummary>, Error> {
    Err(Error::NoHardwareSupport)
}

/// Process exit status of a finished (or failed) acquisition
fn exit_code(result: &Result<Option<RunSummary>, Error>) -> u8 {
    match result {
        Ok(Some(summary)) if !summary.is_clean() => EXIT_ERRORS,
        Ok(_) => 0,
        Err(_) => EXIT_FAILURE,
    }
}

/// Error message including its chain of causes
fn report(e: &Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        msg.push_str(&format!(": {}", cause));
        source = cause.source();
    }
    msg
}

fn main() -> ExitCode {
    let cli = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(cli.verbose.log_level_filter()))
        .init();

    let result = dispatch(&cli);
    match &result {
        Ok(Some(summary)) if summary.is_clean() => info!(
            "All {} run(s) done, {} impulse responses without errors.",
            summary.repetitions, summary.dispatched
        ),
        Ok(Some(summary)) => warn!(
            "All {} run(s) done, but {} error(s) occurred.",
            summary.repetitions, summary.errors
        ),
        Ok(None) => {}
        Err(e) => error!("{}", report(e)),
    }
    ExitCode::from(exit_code(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlbs_acquire::hal::{status, HalError};

    fn summary(errors: usize) -> RunSummary {
        RunSummary {
            repetitions: 2,
            dispatched: 20 - errors,
            errors,
            ..Default::default()
        }
    }

    #[test]
    fn exit_codes() {
        let clean = exit_code(&Ok(Some(summary(0))));
        let errors = exit_code(&Ok(Some(summary(3))));
        let listed = exit_code(&Ok(None));
        let fatal = exit_code(&Err(Error::FatalDevice {
            op: "reading measured data",
            source: HalError(status::IO),
        }));
        let missing = exit_code(&Err(Error::NoSuchSensor {
            requested: 3,
            count: 1,
        }));
        assert_eq!(clean, 0);
        assert_eq!(listed, 0);
        assert_eq!(errors, EXIT_ERRORS);
        assert_eq!(fatal, EXIT_FAILURE);
        assert_eq!(missing, EXIT_FAILURE);
        assert_ne!(clean, errors);
        assert_ne!(errors, fatal);
        assert_ne!(clean, fatal);
    }

    #[test]
    fn simulated_run_exits_cleanly() {
        let cli = Args::try_parse_from(["mlbs_acquire", "--simulate", "-c", "3"]).unwrap();
        let result = dispatch(&cli);
        assert!(matches!(&result, Ok(Some(s)) if s.dispatched == 3 && s.is_clean()));
        assert_eq!(exit_code(&result), 0);
    }

    #[test]
    fn missing_sensor_is_a_failure() {
        let cli = Args::try_parse_from(["mlbs_acquire", "--simulate", "-s", "2"]).unwrap();
        let result = dispatch(&cli);
        assert!(matches!(
            result,
            Err(Error::NoSuchSensor {
                requested: 2,
                count: 1
            })
        ));
        assert_eq!(exit_code(&result), EXIT_FAILURE);
    }

    #[cfg(not(feature = "ilmsens"))]
    #[test]
    fn hardware_needs_the_feature() {
        let cli = Args::try_parse_from(["mlbs_acquire"]).unwrap();
        let result = dispatch(&cli);
        assert!(matches!(result, Err(Error::NoHardwareSupport)));
        assert_eq!(exit_code(&result), EXIT_FAILURE);
    }
}
