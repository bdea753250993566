//! Application intake for affordable-housing listings, with duplicate-application flagging.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
