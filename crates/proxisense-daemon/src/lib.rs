//! # proxisense-daemon
//!
//! Service wrapper around the proxisense sensor.
//!
//! This library provides logging setup, the logging event observer, and the
//! service state used by the `proxisense` binary.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod logging;
pub mod sink;
pub mod state;
