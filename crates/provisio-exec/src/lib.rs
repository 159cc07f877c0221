//! Provisio-Exec: bounded execution of external commands
//!
//! Runs a driver binary (or any other command) to completion with:
//!
//! - a shell mode (`bash -c`, `sh -c` or direct exec), auto-detected by default
//! - a per-attempt timeout that kills the child's whole process group
//! - environment overrides and a working directory
//! - a fixed-delay retry loop
//! - an optional output tap that sees every line as it is produced
//!
//! ```rust,ignore
//! use provisio_exec::{run, CommandSpec};
//!
//! let spec = CommandSpec::builder("vboxmanage createvm --name m1")
//!     .timeout_secs(600)
//!     .retries(3)
//!     .build()?;
//! let stdout = run(&spec).await?;
//! ```

mod error;
mod lines;
pub mod process_tree;
mod runner;
mod shell;
mod spec;

pub use error::{ExecError, ExecResult, KILLED_MARKER};
pub use lines::LossyLines;
pub use process_tree::{kill_process_tree, terminate_process_tree};
pub use runner::run;
pub use shell::{find_in_path, ShellKind};
pub use spec::{CommandSpec, CommandSpecBuilder, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT};
