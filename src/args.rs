//! Argument parsing for running from the command line

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    hal::{HalLogLevel, RunMode, SensorConfig},
    run::RunConfig,
    session::Averages,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// MLBS order of the sensor (9, 12 or 15)
    #[clap(short = 'o', long, default_value_t = 9, value_parser = valid_mlbs_order)]
    pub mlbs_order: u32,
    /// RF system clock in GHz
    #[clap(short = 'f', long, default_value_t = 13.312, value_parser = valid_rf_clock)]
    pub rf_clock: f64,
    /// Number of receivers per sensor
    #[clap(short, long, default_value_t = 2)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub receivers: u32,
    /// Number of software averages
    #[clap(short = 'a', long, default_value_t = 32)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub software_avg: u32,
    /// Wait cycles between measurements, 0 measures continuously
    #[clap(short, long, default_value_t = 0)]
    pub wait_cycles: u32,
    /// Sensor to measure with. 0 only lists the attached sensors.
    #[clap(short, long, default_value_t = 1)]
    pub sensor_num: u32,
    /// How many times the measurement is repeated
    #[clap(short = 'n', long, default_value_t = 1)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat_count: u32,
    /// Number of impulse responses to read per measurement
    #[clap(short = 'c', long, default_value_t = 10)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub response_count: u32,
    /// Timeout of a single read in milliseconds
    #[clap(short, long, default_value_t = 500)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_millis: u64,
    /// Log level of the HAL library (0 = none ... 4 = all)
    #[clap(long, default_value_t = 1, value_parser = valid_hal_log_level)]
    pub hal_log_level: u32,
    /// Transfer data unbuffered instead of buffered
    #[clap(long)]
    pub raw: bool,
    /// Directory to dump raw impulse responses into
    #[clap(short, long)]
    pub dump_dir: Option<PathBuf>,
    /// Use the simulated sensor instead of real hardware
    #[clap(long)]
    pub simulate: bool,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn sensor_config(&self) -> SensorConfig {
        SensorConfig {
            clock_ghz: self.rf_clock,
            mlbs_order: self.mlbs_order,
            receivers: self.receivers,
            ..Default::default()
        }
    }

    pub fn averages(&self) -> Averages {
        Averages {
            software: self.software_avg,
            wait_cycles: self.wait_cycles,
        }
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            repeat_count: self.repeat_count,
            responses: self.response_count as usize,
            timeout: Duration::from_millis(self.timeout_millis),
            mode: if self.raw {
                RunMode::Raw
            } else {
                RunMode::Buffered
            },
        }
    }

    pub fn hal_log_level(&self) -> HalLogLevel {
        // Range checked while parsing
        HalLogLevel::try_from(self.hal_log_level).unwrap_or_default()
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn valid_mlbs_order(s: &str) -> Result<u32, String> {
    match s.parse::<u32>() {
        Ok(order @ (9 | 12 | 15)) => Ok(order),
        Ok(order) => Err(format!("MLBS order {} is not one of 9, 12 or 15", order)),
        Err(_) => Err("Invalid MLBS order".to_string()),
    }
}

fn valid_rf_clock(s: &str) -> Result<f64, String> {
    let clk: f64 = s.parse().map_err(|_| "Invalid clock rate".to_string())?;
    if (0.1..=18.0).contains(&clk) {
        Ok(clk)
    } else {
        Err(format!("RF clock of {} GHz is outside 0.1 to 18 GHz", clk))
    }
}

fn valid_hal_log_level(s: &str) -> Result<u32, String> {
    let level: u32 = s.parse().map_err(|_| "Invalid log level".to_string())?;
    HalLogLevel::try_from(level).map(|_| level)
}
