//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Everything a forked child calls returns a bare `Errno` and neither
//! allocates nor logs.

pub mod capabilities;
pub mod probe;
pub mod seccomp;
pub mod signal;
pub mod text;
pub mod timer;
