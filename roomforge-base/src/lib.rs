//! Shared agent framework for the roomforge control plane.
//!
//! Both long-running processes (the factory and the matchmaker) are built as
//! agents on top of this crate: settings loading and validation, tracing
//! setup, prometheus metrics, the standardized HTTP error envelope, and the
//! run-until-first-task-dies harness all live here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod agent;
pub use agent::*;

#[doc(hidden)]
#[macro_use]
mod macros;

mod settings;
pub use settings::*;

mod metrics;
pub use metrics::*;

mod server;
pub use server::*;
