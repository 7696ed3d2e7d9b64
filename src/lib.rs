pub mod cluster;
pub mod config;
pub mod dlt;
pub mod error;
pub mod placement;
pub mod telemetry;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;
