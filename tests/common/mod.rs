//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestPipeline, GateTask};
//!
//! #[tokio::test]
//! async fn test_gate() {
//!     let gate = GateTask::new();
//!     let pipeline = TestPipeline::spawn(gate.registry(), 2);
//!     // submit jobs, then gate.open() and pipeline.wait_idle().await
//! }
//! ```

#![allow(dead_code)]

mod pipeline;
mod tasks;

// Public API - this is what tests import
pub use pipeline::{wait_until, ParkingPool, TestPipeline, TEST_TIMEOUT};
pub use tasks::{FlakyTask, GateTask, TrackingTask};
