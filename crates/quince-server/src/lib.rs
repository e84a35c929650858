//! Quince member process
//!
//! Configuration loading, logging and shutdown handling for a process that
//! joins a Quince cluster.

pub mod config;
pub mod metrics;
pub mod startup;
