//! Lantern Telemetry - logging and tracing for the plugin runtime.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats
//! - Request context for correlating a routed query across plugin invocations
//! - Integration with the tracing ecosystem
//!
//! # Example
//!
//! ```rust,no_run
//! use lantern_telemetry::{LogConfig, LogFormat, setup_logging, RequestContext};
//!
//! # fn main() -> Result<(), lantern_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Pretty)
//!     .with_directive("lantern_plugins=trace");
//!
//! setup_logging(&config)?;
//!
//! let ctx = RequestContext::new("orchestrator")
//!     .with_operation("route");
//!
//! let span = ctx.span();
//! let _guard = span.enter();
//! tracing::info!("Routing query");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod context;
mod error;
mod logging;

pub use context::{RequestContext, RequestGuard};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
