//! # Replica Testkit
//!
//! Testing utilities for Replica.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: A user, a memory store and a memory backend wired together
//! - **Generators**: Proptest strategies for fields, patches and sync workloads
//! - **Projection check**: Replays a workload through the mutation queue and
//!   entity cache and compares the result with a reference fold
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use replica_testkit::generators::{check_projection, workload};
//!
//! proptest! {
//!     #[test]
//!     fn projection_matches_model(steps in workload(32)) {
//!         let rt = tokio::runtime::Runtime::new().unwrap();
//!         prop_assert_eq!(rt.block_on(check_projection(&steps)), Ok(()));
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use replica_testkit::fixtures::TestFixture;
//!
//! async fn example() {
//!     let fixture = TestFixture::with_user("alice");
//!     let handle = fixture.spawn().await.unwrap();
//!     let _status = handle.status();
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{fast_backoff, fast_config, fields, shared_device_fixtures, TestFixture};
pub use generators::{check_projection, workload, Divergence, Step};
