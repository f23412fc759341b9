// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for the reconciliation engine.
//!
//! These tests drive the lifecycle protocol, the cleanup passes, the
//! reconcilers and the concurrency watchdog WITHOUT a live Kubernetes
//! cluster. The object store, pod API and metrics endpoints are in-memory
//! fakes; everything else is production code.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_watchdog_quorum
//! ```
//!
//! ## Test Categories
//!
//! - **Lifecycle tests**: upsert idempotence, ownership safety, namespace exemption
//! - **Cleanup tests**: retriever-driven cleanup and legacy purges
//! - **DNS tests**: external-dns instances across configuration changes
//! - **Key Vault tests**: SecretProviderClass convergence per owner kind
//! - **Watchdog tests**: voting, quorum, minimum replicas, TTL

mod cleanup_tests;
mod fake_cluster;
mod fake_store;
mod lifecycle_tests;
mod watchdog_tests;
