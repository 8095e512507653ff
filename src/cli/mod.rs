//! Command-line interface for pgtask.
//!
//! Applications embed the CLI by passing their registry factory to
//! [`run_with_registry`]; the `pgtask` binary itself only knows the
//! built-in actors.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, run_with_registry, Cli, Commands};
