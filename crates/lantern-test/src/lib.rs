//! Lantern Test - Shared test utilities for the Lantern plugin runtime.
//!
//! This crate provides package builders, mock plugins and test harness
//! helpers that can be used across Lantern crates as a dev-dependency.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! lantern-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use lantern_test::{PackageBuilder, TestContext, mock_registry};
//!
//! #[tokio::test]
//! async fn loads_echo() {
//!     let ctx = TestContext::new();
//!     let package = PackageBuilder::new("com.test.echo")
//!         .intent("echo")
//!         .native(lantern_test::ECHO_SYMBOL)
//!         .write_to(&ctx.packages())
//!         .unwrap();
//!     let manager = ctx.manager(mock_registry());
//!     manager.load(&package).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
