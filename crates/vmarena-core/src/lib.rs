//! Reserve-then-commit bump arena.
//!
//! - `vm`: platform virtual memory backend (reserve, commit, release)
//! - `arena`: bump arena over one reservation with zero-on-pop semantics
//! - `mmap`: read-only memory-mapped file views
//! - `fileio`: whole-file read and write helpers
//! - `config`: layered configuration for arenas built by the tooling

pub mod arena;
pub mod config;
pub mod error;
pub mod fileio;
pub mod mmap;
pub mod vm;

pub use arena::*;
pub use self::config::*;
pub use error::*;
pub use fileio::*;
pub use mmap::*;
pub use vm::*;
