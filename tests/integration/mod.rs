//! Integration tests for recordsafe
//!
//! These tests verify that multiple components work together correctly.

#[path = "../common/mod.rs"]
pub mod common;

pub mod backup_flow;
pub mod cli;
pub mod coordination;
pub mod safety_flow;
