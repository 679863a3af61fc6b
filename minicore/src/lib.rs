//! Headless shell-agent execution core.
//!
//! An agent takes a natural-language task, asks a language model for one shell
//! command at a time, runs it, feeds the output back, and stops on completion,
//! a budget ceiling, an error or an interrupt. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (types, action parsing, cost
//!   accounting, truncation). No I/O.
//! - **[`io`]**: Side-effecting collaborators (config, processes, model
//!   backends, event stream, trajectory files, prompts, signals).
//!
//! [`agent`] ties them together into the loop; [`headless`] wires the loop to
//! the `mini run` command.

pub mod agent;
pub mod core;
pub mod exit_codes;
pub mod headless;
pub mod interrupt;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
