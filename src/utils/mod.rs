//! Utilities
//!
//! Cross-cutting helpers that do not wrap a single kernel facility.

pub mod fd_closure;
