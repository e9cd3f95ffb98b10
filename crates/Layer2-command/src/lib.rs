//! # xrun-command
//!
//! Escaping-safe command representation shared by every adapter.
//!
//! - `CommandSpec` - ordered literal / value segments, validated at build time
//! - `CommandBuilder` - argv-style construction
//! - `ShellDialect` + `quote` - POSIX, PowerShell and cmd quoting rules

pub mod builder;
pub mod dialect;
pub mod spec;
pub mod value;

pub use builder::CommandBuilder;
pub use dialect::{join, posix_group, quote, ShellDialect};
pub use spec::{CommandSpec, Segment};
pub use value::Value;
