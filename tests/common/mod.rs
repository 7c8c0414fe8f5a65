//! Shared test utilities for recordsafe
//!
//! - Sample datasets and a seeded mock record store
//! - A `TestEnv` that wires coordinator, backup engine and safety manager
//!   over one temporary data directory

pub mod fixtures;
