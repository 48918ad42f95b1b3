//! Configuration
//!
//! Worker settings, method selection and shared result types.

pub mod types;
