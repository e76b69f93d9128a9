//! Core building blocks for `zen`: the error taxonomy, the unified
//! command/HTTP result, the typed file-system cache, the field mapper and
//! the collaborator contracts (task store, credentials) consumed by the
//! sync engine.

pub mod cache;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod io;
pub mod mapper;
pub mod paths;
pub mod redact;
pub mod result;
pub mod store;
pub mod types;

pub use context::Context;
pub use error::{ErrorCode, Result, ZenError};
pub use result::ExecResult;
