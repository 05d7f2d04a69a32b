//! Shared runtime configuration: explicit seed derivation and the tracing
//! subscriber used by the command line tools.

pub mod determinism;
pub mod tracing;

pub use determinism::SeedSource;
