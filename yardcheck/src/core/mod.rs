//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. They shape command strings,
//! interpret captured output and do result arithmetic, so every rule here is
//! testable without a remote host.

pub mod checks;
pub mod commands;
pub mod instance;
pub mod probe;
pub mod report;
