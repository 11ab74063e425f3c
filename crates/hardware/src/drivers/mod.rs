//! Instrument drivers.
//!
//! Only the simulated MX instrument ships with the workspace; it reads real MX
//! database files so device discovery matches the beamline configuration.

pub mod mock;
