//! I/O helpers for the harness.

pub mod config;
pub mod credentials;
pub mod poll;
pub mod process;
pub mod remote;
pub mod run_report;
pub mod ssh;
