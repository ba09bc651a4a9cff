//! Skein Core
//!
//! Core domain types, traits, and error handling for the Skein workflow
//! scheduler. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod dag;
pub mod error;
pub mod instance;
pub mod pool;
pub mod ports;
pub mod schedule;
pub mod state;

pub use error::{Error, Result};
