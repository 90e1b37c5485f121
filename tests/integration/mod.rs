//! Integration test suite for orca.
//!
//! These tests drive supervised instances through their handles and check
//! the run summaries, snapshots and history they leave behind.
//!
//! # Test Categories
//!
//! - `scenarios`: End-to-end acceptance runs
//! - `lifecycle`: Shutdown, restart, resume and durability
//! - `planning`: Planner modes and dispatch pacing
//! - `properties`: Property tests for compaction and scheduling
//!
//! # CI Compatibility
//!
//! Every tool is an in-process stub, so the suite needs no network or
//! external services.

mod fixtures;

mod scenarios;
mod lifecycle;
mod properties;
