//! Acquisition of impulse responses from M-sequence UWB radar sensors.
//!
//! The [`hal::Hal`] trait is the seam to the device library. On top of it,
//! [`session`] handles the sensor lifecycle, [`acquire`] pulls and checks
//! datasets, and [`run`] repeats whole acquisition cycles.

pub mod acquire;
pub mod args;
pub mod error;
pub mod hal;
#[cfg(feature = "ilmsens")]
pub mod ilmsens;
pub mod layout;
pub mod monitoring;
pub mod process;
pub mod run;
pub mod session;
pub mod sim;

pub use error::{Anomaly, Error};
