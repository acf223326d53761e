//! Core delegate library (agent loop, call tree, jobs, output targets,
//! providers, config).

pub mod config;
pub mod core;
pub mod logging;
pub mod output;
pub mod providers;
pub mod tools;
