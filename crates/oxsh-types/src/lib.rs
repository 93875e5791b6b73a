//! Pure data types for oxsh: capture policies, job records, alias returns.
//!
//! This crate is a leaf dependency with no POSIX bindings, no threads, no I/O.
//! It exists so that consumers (front-ends, job listers, external tooling) can
//! work with oxsh's type system without pulling oxsh-procs' platform deps.

pub mod alias;
pub mod capture;
pub mod job;

// Flat re-exports for convenience
pub use alias::*;
pub use capture::*;
pub use job::*;
