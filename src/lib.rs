pub mod adjuster;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dds;
pub mod drift;
pub mod engine;
pub mod error;
pub mod holdover;
pub mod protocol;
pub mod regression;
pub mod rollover;
pub mod status;
pub mod telemetry;
pub mod traits;

#[cfg(unix)]
pub mod device;

#[cfg(test)]
pub(crate) mod testkit;
