//! End-to-end verification harness for the `dockyard` multi-tenant
//! container-host provisioning tool.
//!
//! The harness drives a remote host over a multiplexed SSH channel and checks
//! provisioning, per-tenant isolation, teardown and recovery across a reboot.
//! The layout follows a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (instance descriptors, command
//!   strings, output checks, result arithmetic). No I/O.
//! - **[`io`]**: Side-effecting operations (config files, child processes,
//!   credentials, the SSH channel, polling).
//!
//! Orchestration modules ([`dispatch`], [`isolation`], [`sequencer`], [`suite`])
//! combine the two to run the verification suite.

pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod isolation;
pub mod logging;
pub mod recorder;
pub mod sequencer;
pub mod suite;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
