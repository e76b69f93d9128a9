//! Provider runtime for `zen`.
//!
//! Binary discovery with version gating, a sandboxed subprocess executor
//! with line streaming, the provider capability traits, and the concrete
//! adapters (`git`, `github`, `jira`).

pub mod adapters;
pub mod discovery;
pub mod executor;
pub mod provider;
pub mod stream;

pub use discovery::{parse_version, validate_version, Discovery};
pub use executor::{sanitize_args, ExecOptions, Executor};
pub use provider::{params, CliProvider, Params, Provider, TaskProvider};
pub use stream::{OutputLine, OutputStream};
