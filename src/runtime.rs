//! Runtime glue that wires configs, escalation, progress tracking, telemetry,
//! pipeline assembly and runner orchestration.

pub mod config;
pub mod fatal;
pub mod hooks;
pub mod pipeline;
pub mod progress;
pub mod runner;
pub mod telemetry;
